// In-memory host and transport for exercising the core without hardware.

use std::collections::HashMap;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::arbiter::ShellEvent;
use super::descriptor::{DeviceDescriptor, EndpointDescriptor, InterfaceDescriptor};
use super::{Transport, UsbHost};
use crate::error::{CaptureError, TransferError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Claim(u8, bool),
    Release(u8),
    Close,
    Transfer(u8),
    Queue(u8),
}

#[derive(Debug, Clone)]
pub enum Reply {
    Data(Vec<u8>),
    Empty,
    Timeout,
    NoCompletion,
}

#[derive(Clone, Default)]
pub struct FakeTransport {
    calls: Arc<Mutex<Vec<Call>>>,
    replies: HashMap<u8, Reply>,
    refuse_claim: bool,
}

impl FakeTransport {
    pub fn calls(&self) -> Arc<Mutex<Vec<Call>>> {
        Arc::clone(&self.calls)
    }

    pub fn reply(mut self, address: u8, reply: Reply) -> Self {
        self.replies.insert(address, reply);
        self
    }

    pub fn refuse_claim(mut self) -> Self {
        self.refuse_claim = true;
        self
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn fill(&self, address: u8, buf: &mut [u8]) -> Result<Option<usize>, TransferError> {
        match self.replies.get(&address).cloned().unwrap_or(Reply::Empty) {
            Reply::Data(data) => {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                Ok(Some(len))
            }
            Reply::Empty => Ok(Some(0)),
            Reply::Timeout => Err(TransferError::Usb(rusb::Error::Timeout)),
            Reply::NoCompletion => Ok(None),
        }
    }
}

impl Transport for FakeTransport {
    fn claim_interface(
        &mut self,
        interface: &InterfaceDescriptor,
        force: bool,
    ) -> Result<(), CaptureError> {
        self.record(Call::Claim(interface.number, force));
        if self.refuse_claim {
            return Err(CaptureError::Claim {
                interface: interface.number,
                source: rusb::Error::Busy,
            });
        }
        Ok(())
    }

    fn release_interface(&mut self, interface: &InterfaceDescriptor) {
        self.record(Call::Release(interface.number));
    }

    fn close(&mut self) {
        self.record(Call::Close);
    }

    fn transfer(
        &mut self,
        endpoint: &EndpointDescriptor,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, TransferError> {
        self.record(Call::Transfer(endpoint.address));
        Ok(self.fill(endpoint.address, buf)?.unwrap_or(0))
    }

    fn queue_async(
        &mut self,
        endpoint: &EndpointDescriptor,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> Result<Option<usize>, TransferError> {
        self.record(Call::Queue(endpoint.address));
        self.fill(endpoint.address, buf)
    }
}

pub struct FakeHost {
    pub devices: Vec<DeviceDescriptor>,
    pub transport: FakeTransport,
    pub grant: bool,
    pub fail_open: bool,
    pub opened: Arc<Mutex<Vec<String>>>,
}

impl FakeHost {
    pub fn new(devices: Vec<DeviceDescriptor>, transport: FakeTransport) -> Self {
        Self {
            devices,
            transport,
            grant: true,
            fail_open: false,
            opened: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl UsbHost for FakeHost {
    type Transport = FakeTransport;

    fn enumerate(&mut self) -> Result<Vec<DeviceDescriptor>, CaptureError> {
        Ok(self.devices.clone())
    }

    fn request_access(&mut self, device: &DeviceDescriptor, events: Sender<ShellEvent>) {
        let event = if self.grant {
            ShellEvent::AccessGranted(device.id.clone())
        } else {
            ShellEvent::AccessDenied(device.id.clone())
        };
        events.send(event).unwrap();
    }

    fn open(&mut self, device: &DeviceDescriptor) -> Result<FakeTransport, CaptureError> {
        self.opened.lock().unwrap().push(device.id.clone());
        if self.fail_open {
            return Err(CaptureError::Open {
                id: device.id.clone(),
                source: rusb::Error::Access,
            });
        }
        Ok(self.transport.clone())
    }
}

pub fn bulk_in(address: u8) -> EndpointDescriptor {
    EndpointDescriptor::new(0x80 | address, 0x02, 512)
}

pub fn bulk_out(address: u8) -> EndpointDescriptor {
    EndpointDescriptor::new(address & 0x7f, 0x02, 512)
}
