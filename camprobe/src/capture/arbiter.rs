use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::{debug, error, info, warn};

use super::descriptor::DeviceDescriptor;
use super::probe;
use super::scheduler::{AcquisitionScheduler, CursorState};
use super::{Transport, TransportHandle, UsbHost};
use crate::config::{AcquisitionSettings, CameraConfig};
use crate::error::CaptureError;
use crate::ui::UiHandle;

/// Commands and notifications coming in from the host shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellEvent {
    AccessGranted(String),
    AccessDenied(String),
    Detached(String),
    Shutdown,
}

/// The first inbound endpoint found, and where it lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub device: DeviceDescriptor,
    pub interface: usize,
    pub endpoint: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArbiterState {
    Idle,
    AwaitingAccess(Candidate),
    Acquiring,
    Finished,
}

/// Walks devices, interfaces and endpoints in the order given and stops at
/// the first endpoint pointing IN. No class filtering is applied.
pub fn discover(devices: &[DeviceDescriptor], ui: &UiHandle) -> Option<Candidate> {
    for device in devices {
        ui.emit(format!(
            "Device found: {} ({:04x}:{:04x})",
            device.id, device.vendor_id, device.product_id
        ));

        for (i, interface) in device.interfaces.iter().enumerate() {
            ui.emit(probe::describe_interface(i, interface));

            for (j, endpoint) in interface.endpoints.iter().enumerate() {
                ui.emit(probe::describe_endpoint(j, endpoint));

                if probe::is_inbound(endpoint) {
                    return Some(Candidate {
                        device: device.clone(),
                        interface: i,
                        endpoint: j,
                    });
                }
            }
        }
    }

    None
}

struct Session<T: Transport> {
    device_id: String,
    handle: Arc<Mutex<TransportHandle<T>>>,
    worker: Option<JoinHandle<CursorState>>,
}

/// Owns the single device session: picks the candidate, runs the permission
/// round-trip, claims the interface and hands it to one acquisition worker.
pub struct DeviceArbiter<H: UsbHost> {
    host: H,
    config: Arc<CameraConfig>,
    settings: AcquisitionSettings,
    ui: UiHandle,
    events: Sender<ShellEvent>,
    state: ArbiterState,
    session: Option<Session<H::Transport>>,
}

impl<H: UsbHost> DeviceArbiter<H> {
    pub fn new(
        host: H,
        config: Arc<CameraConfig>,
        settings: AcquisitionSettings,
        ui: UiHandle,
        events: Sender<ShellEvent>,
    ) -> Self {
        Self {
            host,
            config,
            settings,
            ui,
            events,
            state: ArbiterState::Idle,
            session: None,
        }
    }

    pub fn state(&self) -> &ArbiterState {
        &self.state
    }

    pub(crate) fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn config(&self) -> &Arc<CameraConfig> {
        &self.config
    }

    pub fn is_finished(&self) -> bool {
        self.state == ArbiterState::Finished
    }

    pub fn start_discovery(&mut self) -> Result<(), CaptureError> {
        if self.state != ArbiterState::Idle {
            return Err(CaptureError::AcquisitionInFlight);
        }

        self.ui.emit("Searching for camera...");
        let devices = match self.host.enumerate() {
            Ok(devices) => devices,
            Err(err) => {
                self.state = ArbiterState::Finished;
                self.ui.emit(format!("Unable to list USB devices: {}", err));
                return Err(err);
            }
        };

        let Some(candidate) = discover(&devices, &self.ui) else {
            self.state = ArbiterState::Finished;
            self.ui.emit("No suitable USB camera found");
            return Err(CaptureError::NoCamera);
        };

        self.ui.emit(format!(
            "Trying to open device with interface {} and endpoint {}",
            candidate.interface, candidate.endpoint
        ));
        self.host.request_access(&candidate.device, self.events.clone());
        self.state = ArbiterState::AwaitingAccess(candidate);

        Ok(())
    }

    pub fn handle_event(&mut self, event: ShellEvent) -> Result<(), CaptureError> {
        debug!("shell event {:?}", event);

        match event {
            ShellEvent::AccessGranted(id) => match self.take_pending(&id) {
                Some(candidate) => self.setup(candidate),
                None => Ok(()),
            },
            ShellEvent::AccessDenied(id) => match self.take_pending(&id) {
                Some(_) => {
                    self.ui.emit("USB permission denied");
                    self.state = ArbiterState::Finished;
                    Err(CaptureError::PermissionDenied(id))
                }
                None => Ok(()),
            },
            ShellEvent::Detached(id) => {
                let active = self
                    .session
                    .as_ref()
                    .is_some_and(|session| session.device_id == id);
                if active || self.is_pending(&id) {
                    self.ui.emit(format!("Device detached: {}", id));
                    self.shutdown();
                }
                Ok(())
            }
            ShellEvent::Shutdown => {
                self.shutdown();
                Ok(())
            }
        }
    }

    /// Notices a worker that ran out of endpoints and tears its session down.
    pub fn poll(&mut self) {
        let exhausted = self
            .session
            .as_ref()
            .and_then(|session| session.worker.as_ref())
            .is_some_and(|worker| worker.is_finished());

        if exhausted {
            self.shutdown();
        }
    }

    /// Stops the worker and releases the device. Safe to call any number of times.
    pub fn shutdown(&mut self) {
        self.config.stop();

        if let Some(mut session) = self.session.take() {
            if let Some(worker) = session.worker.take() {
                match worker.join() {
                    Ok(cursor) => debug!("acquisition worker stopped at {:?}", cursor),
                    Err(_) => error!("acquisition worker panicked"),
                }
            }

            let mut handle = match session.handle.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            handle.teardown();
            info!("released {}", session.device_id);
        }

        self.state = ArbiterState::Finished;
    }

    fn take_pending(&mut self, id: &str) -> Option<Candidate> {
        if !self.is_pending(id) {
            debug!("ignoring access answer for {}", id);
            return None;
        }

        match std::mem::replace(&mut self.state, ArbiterState::Idle) {
            ArbiterState::AwaitingAccess(candidate) => Some(candidate),
            _ => None,
        }
    }

    fn is_pending(&self, id: &str) -> bool {
        matches!(&self.state, ArbiterState::AwaitingAccess(c) if c.device.id == id)
    }

    fn setup(&mut self, candidate: Candidate) -> Result<(), CaptureError> {
        if self.session.is_some() {
            return Err(CaptureError::AcquisitionInFlight);
        }

        let device = candidate.device;
        self.ui.emit(format!("Setting up device: {}", device.id));

        let interface = device.interfaces[candidate.interface].clone();
        let handle = match self
            .host
            .open(&device)
            .and_then(|transport| TransportHandle::claim(transport, interface, true))
        {
            Ok(handle) => handle,
            Err(err) => {
                warn!("setup of {} failed: {}", device.id, err);
                self.ui.emit("Failed to claim interface or open device");
                self.state = ArbiterState::Finished;
                return Err(err);
            }
        };
        self.ui.emit("Device connected and interface claimed");

        let handle = Arc::new(Mutex::new(handle));
        let device_id = device.id.clone();
        let scheduler = AcquisitionScheduler::new(
            device,
            Arc::clone(&handle),
            Arc::clone(&self.config),
            self.settings,
            self.ui.clone(),
        );

        self.config.start();
        let worker = thread::Builder::new()
            .name("acquisition".into())
            .spawn(move || scheduler.run());

        let worker = match worker {
            Ok(worker) => worker,
            Err(err) => {
                self.config.stop();
                self.state = ArbiterState::Finished;
                return Err(CaptureError::Spawn(err));
            }
        };

        self.session = Some(Session {
            device_id,
            handle,
            worker: Some(worker),
        });
        self.state = ArbiterState::Acquiring;

        Ok(())
    }
}

impl<H: UsbHost> Drop for DeviceArbiter<H> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::super::descriptor::{EndpointDescriptor, InterfaceDescriptor};
    use super::super::fake::{bulk_in, bulk_out, Call, FakeHost, FakeTransport, Reply};
    use super::*;
    use crate::ui::{self, tests::Recorder};
    use std::sync::mpsc;
    use std::time::Duration;

    fn settings() -> AcquisitionSettings {
        AcquisitionSettings {
            tick_interval: Duration::from_millis(1),
            transfer_timeout: Duration::from_millis(5),
        }
    }

    fn out_only(id: &str) -> DeviceDescriptor {
        DeviceDescriptor::new(
            id,
            vec![InterfaceDescriptor::new(0, 255, 0, vec![bulk_out(1), bulk_out(2)])],
        )
    }

    #[test]
    fn picks_first_inbound_endpoint_in_walk_order() {
        let third = DeviceDescriptor::new(
            "third",
            vec![
                InterfaceDescriptor::new(0, 255, 0, vec![bulk_out(1)]),
                InterfaceDescriptor::new(
                    1,
                    14,
                    2,
                    vec![bulk_out(2), bulk_out(3), bulk_in(4), bulk_in(5)],
                ),
            ],
        );
        let devices = vec![out_only("first"), out_only("second"), third];
        let (ui, _queue) = ui::channel();

        let candidate = discover(&devices, &ui).unwrap();
        assert_eq!(
            (candidate.device.id.as_str(), candidate.interface, candidate.endpoint),
            ("third", 1, 2)
        );
    }

    #[test]
    fn no_inbound_endpoint_never_opens() {
        let host = FakeHost::new(
            vec![out_only("first"), out_only("second")],
            FakeTransport::default(),
        );
        let opened = Arc::clone(&host.opened);
        let (ui, queue) = ui::channel();
        let (events, _inbox) = mpsc::channel();
        let mut arbiter =
            DeviceArbiter::new(host, Arc::new(CameraConfig::default()), settings(), ui, events);

        assert!(matches!(
            arbiter.start_discovery(),
            Err(CaptureError::NoCamera)
        ));
        assert!(arbiter.is_finished());
        assert!(opened.lock().unwrap().is_empty());

        let mut recorder = Recorder::default();
        queue.drain(&mut recorder);
        assert_eq!(
            recorder.log.lines().last().map(String::as_str),
            Some("No suitable USB camera found")
        );
    }

    #[test]
    fn denied_permission_is_terminal() {
        let device = DeviceDescriptor::new(
            "cam",
            vec![InterfaceDescriptor::new(0, 14, 2, vec![bulk_in(1)])],
        );
        let mut host = FakeHost::new(vec![device], FakeTransport::default());
        host.grant = false;
        let opened = Arc::clone(&host.opened);
        let (ui, _queue) = ui::channel();
        let (events, inbox) = mpsc::channel();
        let mut arbiter =
            DeviceArbiter::new(host, Arc::new(CameraConfig::default()), settings(), ui, events);

        arbiter.start_discovery().unwrap();
        assert!(matches!(arbiter.state(), ArbiterState::AwaitingAccess(_)));

        let answer = inbox.recv().unwrap();
        assert_eq!(answer, ShellEvent::AccessDenied("cam".into()));
        assert!(matches!(
            arbiter.handle_event(answer),
            Err(CaptureError::PermissionDenied(id)) if id == "cam"
        ));
        assert!(arbiter.is_finished());
        assert!(opened.lock().unwrap().is_empty());
    }

    #[test]
    fn answer_for_another_device_is_ignored() {
        let device = DeviceDescriptor::new(
            "cam",
            vec![InterfaceDescriptor::new(0, 14, 2, vec![bulk_in(1)])],
        );
        let host = FakeHost::new(vec![device], FakeTransport::default());
        let (ui, _queue) = ui::channel();
        let (events, _inbox) = mpsc::channel();
        let mut arbiter =
            DeviceArbiter::new(host, Arc::new(CameraConfig::default()), settings(), ui, events);

        arbiter.start_discovery().unwrap();
        arbiter
            .handle_event(ShellEvent::AccessGranted("other".into()))
            .unwrap();
        assert!(matches!(arbiter.state(), ArbiterState::AwaitingAccess(_)));
    }

    #[test]
    fn claim_failure_ends_the_session() {
        let device = DeviceDescriptor::new(
            "cam",
            vec![InterfaceDescriptor::new(3, 14, 2, vec![bulk_in(1)])],
        );
        let transport = FakeTransport::default().refuse_claim();
        let calls = transport.calls();
        let host = FakeHost::new(vec![device], transport);
        let (ui, queue) = ui::channel();
        let (events, inbox) = mpsc::channel();
        let mut arbiter =
            DeviceArbiter::new(host, Arc::new(CameraConfig::default()), settings(), ui, events);

        arbiter.start_discovery().unwrap();
        let answer = inbox.recv().unwrap();
        assert!(matches!(
            arbiter.handle_event(answer),
            Err(CaptureError::Claim { interface: 3, .. })
        ));
        assert!(arbiter.is_finished());
        assert_eq!(*calls.lock().unwrap(), vec![Call::Claim(3, true), Call::Close]);

        let mut recorder = Recorder::default();
        queue.drain(&mut recorder);
        assert!(recorder
            .log
            .lines()
            .contains(&"Failed to claim interface or open device".to_string()));
    }

    #[test]
    fn open_failure_ends_the_session() {
        let device = DeviceDescriptor::new(
            "cam",
            vec![InterfaceDescriptor::new(0, 14, 2, vec![bulk_in(1)])],
        );
        let transport = FakeTransport::default();
        let calls = transport.calls();
        let mut host = FakeHost::new(vec![device], transport);
        host.fail_open = true;
        let opened = Arc::clone(&host.opened);
        let config = Arc::new(CameraConfig::default());
        let (ui, queue) = ui::channel();
        let (events, inbox) = mpsc::channel();
        let mut arbiter = DeviceArbiter::new(host, Arc::clone(&config), settings(), ui, events);

        arbiter.start_discovery().unwrap();
        let answer = inbox.recv().unwrap();
        assert!(matches!(
            arbiter.handle_event(answer),
            Err(CaptureError::Open { id, .. }) if id == "cam"
        ));
        assert!(arbiter.is_finished());
        assert!(!config.is_running());
        assert_eq!(*opened.lock().unwrap(), vec!["cam".to_string()]);
        assert!(calls.lock().unwrap().is_empty());

        let mut recorder = Recorder::default();
        queue.drain(&mut recorder);
        assert_eq!(
            recorder.log.lines().last().map(String::as_str),
            Some("Failed to claim interface or open device")
        );
    }

    #[test]
    fn granted_device_is_probed_to_exhaustion_and_released_once() {
        let device = DeviceDescriptor::new(
            "cam",
            vec![
                InterfaceDescriptor::new(0, 14, 1, vec![]),
                InterfaceDescriptor::new(
                    1,
                    14,
                    2,
                    vec![bulk_in(1), EndpointDescriptor::new(0x82, 0x05, 512)],
                ),
            ],
        );
        let transport = FakeTransport::default()
            .reply(0x81, Reply::Data([235, 128, 235, 128].repeat(128)))
            .reply(0x82, Reply::Data([16, 128, 16, 128].repeat(128)));
        let calls = transport.calls();
        let host = FakeHost::new(vec![device], transport);
        let config = Arc::new(CameraConfig::new(30, 16, 16).unwrap());
        let (ui, queue) = ui::channel();
        let (events, inbox) = mpsc::channel();
        let mut arbiter = DeviceArbiter::new(host, Arc::clone(&config), settings(), ui, events);

        arbiter.start_discovery().unwrap();
        arbiter.handle_event(inbox.recv().unwrap()).unwrap();
        assert_eq!(arbiter.state(), &ArbiterState::Acquiring);
        assert!(matches!(
            arbiter.start_discovery(),
            Err(CaptureError::AcquisitionInFlight)
        ));

        while !arbiter.is_finished() {
            arbiter.poll();
            thread::sleep(Duration::from_millis(1));
        }
        arbiter.shutdown();
        arbiter.shutdown();
        assert!(!config.is_running());

        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                Call::Claim(1, true),
                Call::Transfer(0x81),
                Call::Queue(0x82),
                Call::Release(1),
                Call::Close,
            ]
        );

        let mut recorder = Recorder::default();
        queue.drain(&mut recorder);
        assert_eq!(recorder.frames.len(), 2);
        assert_eq!(recorder.frames[0].get_pixel(0, 0).0, [255, 255, 255]);
        assert_eq!(recorder.frames[1].get_pixel(0, 0).0, [0, 0, 0]);
    }

    #[test]
    fn detach_stops_acquisition() {
        let device = DeviceDescriptor::new(
            "cam",
            vec![InterfaceDescriptor::new(0, 14, 2, vec![bulk_in(1)])],
        );
        let transport = FakeTransport::default();
        let calls = transport.calls();
        let host = FakeHost::new(vec![device], transport);
        let config = Arc::new(CameraConfig::default());
        let (ui, _queue) = ui::channel();
        let (events, inbox) = mpsc::channel();
        let mut arbiter = DeviceArbiter::new(
            host,
            Arc::clone(&config),
            AcquisitionSettings {
                tick_interval: Duration::from_secs(5),
                transfer_timeout: Duration::from_millis(5),
            },
            ui,
            events,
        );

        arbiter.start_discovery().unwrap();
        arbiter.handle_event(inbox.recv().unwrap()).unwrap();
        arbiter
            .handle_event(ShellEvent::Detached("cam".into()))
            .unwrap();

        assert!(arbiter.is_finished());
        assert!(!config.is_running());
        let calls = calls.lock().unwrap();
        assert_eq!(calls.iter().filter(|c| **c == Call::Close).count(), 1);
        assert_eq!(calls.last(), Some(&Call::Close));
    }
}
