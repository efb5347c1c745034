use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use log::{debug, info};

use super::descriptor::{DeviceDescriptor, EndpointDescriptor};
use super::image::assemble;
use super::probe::{self, TransferKind};
use super::transfer;
use super::{Transport, TransportHandle};
use crate::config::{AcquisitionSettings, CameraConfig};
use crate::ui::UiHandle;

// Longest stretch the worker sleeps without looking at the running flag.
const PAUSE_SLICE: Duration = Duration::from_millis(10);

/// Where the next tick looks. Only ever moves forward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CursorState {
    pub interface: usize,
    pub endpoint: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Done,
    NextInterface { interface: usize },
    Probe { interface: usize, endpoint: usize },
}

impl CursorState {
    /// Decides what this tick does and where the following one starts.
    pub fn step(self, device: &DeviceDescriptor) -> (Step, CursorState) {
        let Some(interface) = device.interfaces.get(self.interface) else {
            return (Step::Done, self);
        };

        if self.endpoint >= interface.endpoints.len() {
            let next = CursorState {
                interface: self.interface + 1,
                endpoint: 0,
            };

            if next.interface >= device.interface_count() {
                return (Step::Done, next);
            }
            return (
                Step::NextInterface {
                    interface: next.interface,
                },
                next,
            );
        }

        (
            Step::Probe {
                interface: self.interface,
                endpoint: self.endpoint,
            },
            CursorState {
                interface: self.interface,
                endpoint: self.endpoint + 1,
            },
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Skipped { interface: usize },
    Probed {
        interface: usize,
        endpoint: usize,
        kind: TransferKind,
        displayed: bool,
    },
    Done,
}

pub struct AcquisitionScheduler<T: Transport> {
    device: DeviceDescriptor,
    handle: Arc<Mutex<TransportHandle<T>>>,
    config: Arc<CameraConfig>,
    settings: AcquisitionSettings,
    ui: UiHandle,
    cursor: CursorState,
}

impl<T: Transport> AcquisitionScheduler<T> {
    pub fn new(
        device: DeviceDescriptor,
        handle: Arc<Mutex<TransportHandle<T>>>,
        config: Arc<CameraConfig>,
        settings: AcquisitionSettings,
        ui: UiHandle,
    ) -> Self {
        Self {
            device,
            handle,
            config,
            settings,
            ui,
            cursor: CursorState::default(),
        }
    }

    pub fn cursor(&self) -> CursorState {
        self.cursor
    }

    /// Examines at most one endpoint and performs at most one transfer.
    pub fn tick(&mut self) -> Tick {
        let (step, next) = self.cursor.step(&self.device);
        self.cursor = next;

        match step {
            Step::Done => {
                self.ui.emit("All interfaces and endpoints checked");
                Tick::Done
            }
            Step::NextInterface { interface } => {
                debug!("moving on to interface {}", interface);
                Tick::Skipped { interface }
            }
            Step::Probe {
                interface,
                endpoint,
            } => {
                let descriptor = self.device.interfaces[interface].endpoints[endpoint];
                let kind = probe::classify(&descriptor);
                self.ui.emit(format!(
                    "Testing interface {}, endpoint {}: Address = {:#04x}, Type = {}",
                    interface, endpoint, descriptor.address, kind
                ));

                let displayed = self.probe(kind, &descriptor);
                Tick::Probed {
                    interface,
                    endpoint,
                    kind,
                    displayed,
                }
            }
        }
    }

    /// Ticks until every endpoint has been tried or the running flag drops.
    pub fn run(mut self) -> CursorState {
        info!("acquisition started on {}", self.device.id);

        while self.config.is_running() {
            if self.tick() == Tick::Done {
                self.config.stop();
                break;
            }
            self.pause();
        }

        info!("acquisition finished at {:?}", self.cursor);
        self.cursor
    }

    fn pause(&self) {
        let deadline = Instant::now() + self.settings.tick_interval;
        while self.config.is_running() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(PAUSE_SLICE));
        }
    }

    fn lock_handle(&self) -> MutexGuard<'_, TransportHandle<T>> {
        match self.handle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn probe(&self, kind: TransferKind, endpoint: &EndpointDescriptor) -> bool {
        let result = {
            let mut handle = self.lock_handle();
            transfer::read_frame(
                kind,
                &mut handle,
                endpoint,
                self.settings.transfer_timeout,
                &self.ui,
            )
        };

        match result {
            Ok(Some(frame)) => self.present(frame),
            Ok(None) => false,
            Err(err) => {
                self.ui.emit(format!(
                    "{} transfer on endpoint {:#04x} failed: {}",
                    kind, endpoint.address, err
                ));
                false
            }
        }
    }

    fn present(&self, frame: BytesMut) -> bool {
        self.ui.emit(format!("Processing frame, length: {}", frame.len()));
        debug!("frame starts {}", hex::encode(&frame[..frame.len().min(16)]));

        match assemble(frame, self.config.width(), self.config.height()) {
            Ok(image) => {
                self.ui.display(image);
                true
            }
            Err(err) => {
                self.ui.emit(format!("Dropped frame: {}", err));
                false
            }
        }
    }
}
