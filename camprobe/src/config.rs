use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::ConfigError;

pub const TICK_INTERVAL: Duration = Duration::from_millis(100);
pub const TRANSFER_TIMEOUT: Duration = Duration::from_millis(1000);

/// Frame geometry is fixed at construction. `running` is the only thing that
/// changes afterwards and it is what the acquisition loop checks before each tick.
#[derive(Debug)]
pub struct CameraConfig {
    frame_rate: u32,
    width: u32,
    height: u32,
    running: AtomicBool,
}

impl CameraConfig {
    pub fn new(frame_rate: u32, width: u32, height: u32) -> Result<Self, ConfigError> {
        if width == 0 || height == 0 {
            return Err(ConfigError::ZeroGeometry { width, height });
        }

        Ok(Self {
            frame_rate,
            width,
            height,
            running: AtomicBool::new(false),
        })
    }

    pub fn frame_rate(&self) -> u32 {
        self.frame_rate
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::Release);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            frame_rate: 30,
            width: 640,
            height: 480,
            running: AtomicBool::new(false),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquisitionSettings {
    pub tick_interval: Duration,
    /// Applies to bulk, interrupt and isochronous reads alike.
    pub transfer_timeout: Duration,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            tick_interval: TICK_INTERVAL,
            transfer_timeout: TRANSFER_TIMEOUT,
        }
    }
}
