pub mod arbiter;
pub mod descriptor;
pub mod image;
pub mod libusb;
pub mod probe;
pub mod scheduler;
pub mod transfer;

#[cfg(test)]
pub(crate) mod fake;

use std::sync::mpsc::Sender;
use std::time::Duration;

use log::debug;

use crate::error::{CaptureError, TransferError};
use arbiter::ShellEvent;
use descriptor::{DeviceDescriptor, EndpointDescriptor, InterfaceDescriptor};

/// What the core needs from the platform's USB subsystem.
pub trait UsbHost {
    type Transport: Transport;

    /// One snapshot, in whatever order the host lists devices.
    fn enumerate(&mut self) -> Result<Vec<DeviceDescriptor>, CaptureError>;

    /// Never answers inline; the outcome arrives later as an `AccessGranted`
    /// or `AccessDenied` event on `events`.
    fn request_access(&mut self, device: &DeviceDescriptor, events: Sender<ShellEvent>);

    fn open(&mut self, device: &DeviceDescriptor) -> Result<Self::Transport, CaptureError>;
}

/// An open connection to one device.
pub trait Transport: Send + 'static {
    fn claim_interface(
        &mut self,
        interface: &InterfaceDescriptor,
        force: bool,
    ) -> Result<(), CaptureError>;

    fn release_interface(&mut self, interface: &InterfaceDescriptor);

    fn close(&mut self);

    /// Bulk and interrupt reads.
    fn transfer(
        &mut self,
        endpoint: &EndpointDescriptor,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransferError>;

    /// Isochronous read. `Ok(None)` means no completion arrived.
    fn queue_async(
        &mut self,
        endpoint: &EndpointDescriptor,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<Option<usize>, TransferError>;
}

/// A transport with exactly one claimed interface. Teardown releases the
/// interface and closes the connection once, no matter how often it is asked.
pub struct TransportHandle<T: Transport> {
    transport: T,
    interface: InterfaceDescriptor,
    released: bool,
    closed: bool,
}

impl<T: Transport> TransportHandle<T> {
    pub fn claim(
        mut transport: T,
        interface: InterfaceDescriptor,
        force: bool,
    ) -> Result<Self, CaptureError> {
        if let Err(err) = transport.claim_interface(&interface, force) {
            transport.close();
            return Err(err);
        }

        Ok(Self {
            transport,
            interface,
            released: false,
            closed: false,
        })
    }

    pub fn interface(&self) -> &InterfaceDescriptor {
        &self.interface
    }

    pub fn is_open(&self) -> bool {
        !self.closed
    }

    pub fn transfer(
        &mut self,
        endpoint: &EndpointDescriptor,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransferError> {
        if self.closed {
            return Err(TransferError::Closed);
        }
        self.transport.transfer(endpoint, buf, timeout)
    }

    pub fn queue_async(
        &mut self,
        endpoint: &EndpointDescriptor,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<Option<usize>, TransferError> {
        if self.closed {
            return Err(TransferError::Closed);
        }
        self.transport.queue_async(endpoint, buf, timeout)
    }

    pub fn teardown(&mut self) {
        if !self.released {
            self.released = true;
            debug!("releasing interface {}", self.interface.number);
            self.transport.release_interface(&self.interface);
        }

        if !self.closed {
            self.closed = true;
            debug!("closing connection");
            self.transport.close();
        }
    }
}

impl<T: Transport> Drop for TransportHandle<T> {
    fn drop(&mut self) {
        self.teardown();
    }
}
