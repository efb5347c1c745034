mod iso;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, warn};
use rusb::{
    Context, Device, DeviceHandle, Hotplug, HotplugBuilder, Registration, SyncType,
    TransferType, UsageType, UsbContext,
};
use simple_error::SimpleError;

use super::arbiter::ShellEvent;
use super::descriptor::{DeviceDescriptor, EndpointDescriptor, InterfaceDescriptor};
use super::probe::{self, TransferKind};
use super::{Transport, UsbHost};
use crate::error::{CaptureError, TransferError};

// Upper bound on how long the event thread blocks before checking for shutdown.
const EVENT_PUMP_INTERVAL: Duration = Duration::from_millis(100);

/// Desktop host backed by libusb.
pub struct LibUsbHost {
    context: Context,
    devices: HashMap<String, Device<Context>>,
    hotplug: Option<Registration<Context>>,
    pump: Option<EventPump>,
}

struct EventPump {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl LibUsbHost {
    pub fn new() -> Result<Self, CaptureError> {
        Ok(Self {
            context: Context::new()?,
            devices: HashMap::new(),
            hotplug: None,
            pump: None,
        })
    }

    /// Posts `ShellEvent::Detached` whenever a device leaves the bus. Hotplug
    /// callbacks only fire while libusb handles events, so this also starts a
    /// thread that does nothing else.
    pub fn watch_detach(&mut self, events: Sender<ShellEvent>) -> Result<(), CaptureError> {
        if !rusb::has_hotplug() {
            warn!("libusb built without hotplug support, unplugging will go unnoticed");
            return Ok(());
        }

        let registration = HotplugBuilder::new()
            .enumerate(false)
            .register(&self.context, Box::new(DetachWatch { events }))?;
        self.hotplug = Some(registration);

        let context = self.context.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name("usb-events".into())
            .spawn(move || {
                while !flag.load(Ordering::Acquire) {
                    if let Err(err) = context.handle_events(Some(EVENT_PUMP_INTERVAL)) {
                        error!("libusb event handling failed: {}", err);
                        break;
                    }
                }
            })?;
        self.pump = Some(EventPump { stop, thread });

        debug!("hotplug callbacks registered");
        Ok(())
    }

    fn find_device(&self, id: &str) -> Result<&Device<Context>, SimpleError> {
        self.devices
            .get(id)
            .ok_or_else(|| SimpleError::new(format!("{} is no longer attached", id)))
    }
}

impl Drop for LibUsbHost {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.stop.store(true, Ordering::Release);
            if pump.thread.join().is_err() {
                error!("usb event thread panicked");
            }
        }
        self.hotplug.take();
    }
}

struct DetachWatch {
    events: Sender<ShellEvent>,
}

impl<T: UsbContext> Hotplug<T> for DetachWatch {
    fn device_arrived(&mut self, _device: Device<T>) {}

    fn device_left(&mut self, device: Device<T>) {
        let id = device_id(&device);
        debug!("hotplug: {} left", id);

        if self.events.send(ShellEvent::Detached(id)).is_err() {
            debug!("nobody is listening for detach notices");
        }
    }
}

impl UsbHost for LibUsbHost {
    type Transport = LibUsbTransport;

    fn enumerate(&mut self) -> Result<Vec<DeviceDescriptor>, CaptureError> {
        self.devices.clear();

        let mut found = Vec::new();
        for device in self.context.devices()?.iter() {
            let descriptor = match describe_device(&device) {
                Ok(d) => d,
                Err(err) => {
                    debug!(
                        "skipping device {:03}/{:03}: {}",
                        device.bus_number(),
                        device.address(),
                        err
                    );
                    continue;
                }
            };

            self.devices.insert(descriptor.id.clone(), device);
            found.push(descriptor);
        }

        Ok(found)
    }

    // On a desktop the only gate is whether the device node can be opened.
    fn request_access(&mut self, device: &DeviceDescriptor, events: Sender<ShellEvent>) {
        let event = match self.find_device(&device.id).map(|d| d.open()) {
            Ok(Ok(_)) => ShellEvent::AccessGranted(device.id.clone()),
            Ok(Err(err)) => {
                warn!("access check on {} failed: {}", device.id, err);
                ShellEvent::AccessDenied(device.id.clone())
            }
            Err(err) => {
                warn!("{}", err);
                ShellEvent::AccessDenied(device.id.clone())
            }
        };

        if events.send(event).is_err() {
            debug!("nobody is listening for the access answer");
        }
    }

    fn open(&mut self, device: &DeviceDescriptor) -> Result<LibUsbTransport, CaptureError> {
        let handle = self
            .find_device(&device.id)?
            .open()
            .map_err(|source| CaptureError::Open {
                id: device.id.clone(),
                source,
            })?;

        Ok(LibUsbTransport {
            handle: Some(handle),
        })
    }
}

pub struct LibUsbTransport {
    handle: Option<DeviceHandle<Context>>,
}

impl LibUsbTransport {
    fn handle(&mut self) -> Result<&mut DeviceHandle<Context>, TransferError> {
        self.handle.as_mut().ok_or(TransferError::Closed)
    }
}

impl Transport for LibUsbTransport {
    fn claim_interface(
        &mut self,
        interface: &InterfaceDescriptor,
        force: bool,
    ) -> Result<(), CaptureError> {
        let number = interface.number;
        let claim_error = |source: rusb::Error| CaptureError::Claim {
            interface: number,
            source,
        };
        let handle = self
            .handle
            .as_mut()
            .ok_or_else(|| claim_error(rusb::Error::NoDevice))?;

        if force {
            match handle.kernel_driver_active(number) {
                Ok(true) => {
                    debug!("detaching kernel driver from interface {}", number);
                    handle.detach_kernel_driver(number).map_err(claim_error)?;
                }
                Ok(false) => {}
                Err(err) => debug!("kernel driver query unsupported: {}", err),
            }
        }

        handle.claim_interface(number).map_err(claim_error)?;

        if interface.alternate_setting != 0 {
            handle
                .set_alternate_setting(number, interface.alternate_setting)
                .map_err(claim_error)?;
        }

        Ok(())
    }

    fn release_interface(&mut self, interface: &InterfaceDescriptor) {
        if let Some(handle) = self.handle.as_mut() {
            if let Err(err) = handle.release_interface(interface.number) {
                debug!("release of interface {} failed: {}", interface.number, err);
            }
        }
    }

    fn close(&mut self) {
        // dropping the handle closes it
        self.handle.take();
    }

    fn transfer(
        &mut self,
        endpoint: &EndpointDescriptor,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransferError> {
        let handle = self.handle()?;
        let received = match probe::classify(endpoint) {
            TransferKind::Interrupt => handle.read_interrupt(endpoint.address, buf, timeout)?,
            _ => handle.read_bulk(endpoint.address, buf, timeout)?,
        };
        Ok(received)
    }

    fn queue_async(
        &mut self,
        endpoint: &EndpointDescriptor,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<Option<usize>, TransferError> {
        let handle = self.handle()?;
        iso::read_isochronous(handle, endpoint, buf, timeout)
    }
}

fn device_id<T: UsbContext>(device: &Device<T>) -> String {
    format!(
        "/dev/bus/usb/{:03}/{:03}",
        device.bus_number(),
        device.address()
    )
}

/// Every alternate setting is listed as its own interface entry, in descriptor order.
fn describe_device<T: UsbContext>(device: &Device<T>) -> rusb::Result<DeviceDescriptor> {
    let device_desc = device.device_descriptor()?;
    let config = match device.active_config_descriptor() {
        Ok(config) => config,
        Err(_) => device.config_descriptor(0)?,
    };

    let mut interfaces = Vec::new();
    for interface in config.interfaces() {
        for alt in interface.descriptors() {
            interfaces.push(InterfaceDescriptor {
                number: alt.interface_number(),
                alternate_setting: alt.setting_number(),
                class: alt.class_code(),
                subclass: alt.sub_class_code(),
                endpoints: alt
                    .endpoint_descriptors()
                    .map(|ep| describe_endpoint(&ep))
                    .collect(),
            });
        }
    }

    Ok(DeviceDescriptor {
        id: device_id(device),
        vendor_id: device_desc.vendor_id(),
        product_id: device_desc.product_id(),
        interfaces,
    })
}

fn describe_endpoint(ep: &rusb::EndpointDescriptor) -> EndpointDescriptor {
    let transfer = match ep.transfer_type() {
        TransferType::Control => 0,
        TransferType::Isochronous => 1,
        TransferType::Bulk => 2,
        TransferType::Interrupt => 3,
    };
    let sync = match ep.sync_type() {
        SyncType::NoSync => 0,
        SyncType::Asynchronous => 1,
        SyncType::Adaptive => 2,
        SyncType::Synchronous => 3,
    };
    let usage = match ep.usage_type() {
        UsageType::Data => 0,
        UsageType::Feedback => 1,
        UsageType::FeedbackData => 2,
        UsageType::Reserved => 3,
    };

    EndpointDescriptor::new(
        ep.address(),
        transfer | (sync << 2) | (usage << 4),
        ep.max_packet_size(),
    )
}
