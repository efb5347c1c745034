mod capture;
pub mod config;
pub mod error;
pub mod ui;

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

use log::debug;

pub use capture::arbiter::{discover, ArbiterState, Candidate, DeviceArbiter, ShellEvent};
pub use capture::descriptor::{
    DeviceDescriptor, Direction, EndpointDescriptor, InterfaceDescriptor,
};
pub use capture::image::{assemble, yuy2_to_rgb};
pub use capture::libusb::{LibUsbHost, LibUsbTransport};
pub use capture::probe::{classify, is_inbound, TransferKind};
pub use capture::scheduler::{AcquisitionScheduler, CursorState, Step, Tick};
pub use capture::transfer::TRANSFER_SIZE;
pub use capture::{Transport, TransportHandle, UsbHost};
pub use config::{AcquisitionSettings, CameraConfig};
pub use error::{AssemblyError, CaptureError, ConfigError, TransferError};

const EVENT_POLL: Duration = Duration::from_millis(50);

/// One probing session: discovery, the permission round-trip and acquisition,
/// driven by events from the host shell until there is nothing left to do.
pub struct CamProbe<H: UsbHost> {
    arbiter: DeviceArbiter<H>,
    events: Receiver<ShellEvent>,
    sender: Sender<ShellEvent>,
}

impl CamProbe<LibUsbHost> {
    pub fn connect(
        config: CameraConfig,
        settings: AcquisitionSettings,
        ui: ui::UiHandle,
    ) -> Result<Self, CaptureError> {
        let mut probe = Self::new(LibUsbHost::new()?, config, settings, ui);
        let events = probe.events();
        probe.arbiter.host_mut().watch_detach(events)?;
        Ok(probe)
    }
}

impl<H: UsbHost> CamProbe<H> {
    pub fn new(
        host: H,
        config: CameraConfig,
        settings: AcquisitionSettings,
        ui: ui::UiHandle,
    ) -> Self {
        let (sender, events) = mpsc::channel();
        let arbiter = DeviceArbiter::new(host, Arc::new(config), settings, ui, sender.clone());

        Self {
            arbiter,
            events,
            sender,
        }
    }

    /// Where the host shell posts permission answers, detach notices and shutdown.
    pub fn events(&self) -> Sender<ShellEvent> {
        self.sender.clone()
    }

    pub fn run(mut self) -> Result<(), CaptureError> {
        self.arbiter.start_discovery()?;

        while !self.arbiter.is_finished() {
            match self.events.recv_timeout(EVENT_POLL) {
                Ok(event) => self.arbiter.handle_event(event)?,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            self.arbiter.poll();
        }

        debug!("session over");
        self.arbiter.shutdown();
        Ok(())
    }
}
