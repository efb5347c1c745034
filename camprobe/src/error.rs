use simple_error::SimpleError;

/// Failures on the one-time discovery and setup path. Any of these ends the session.
#[derive(thiserror::Error, Debug)]
pub enum CaptureError {
    #[error("No suitable USB camera found")]
    NoCamera,

    #[error("USB permission denied for {0}")]
    PermissionDenied(String),

    #[error("Failed to open {id}: {source}")]
    Open {
        id: String,
        #[source]
        source: rusb::Error,
    },

    #[error("Failed to claim interface {interface}: {source}")]
    Claim {
        interface: u8,
        #[source]
        source: rusb::Error,
    },

    #[error("An acquisition is already in flight")]
    AcquisitionInFlight,

    #[error("Unable to start acquisition worker: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("{0}")]
    Setup(#[from] SimpleError),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Failures of a single transfer attempt. Logged, never fatal.
#[derive(thiserror::Error, Debug)]
pub enum TransferError {
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("transfer submission failed with code {0}")]
    Submit(i32),

    #[error("transfer ended with status {0}")]
    Status(i32),

    #[error("transport already closed")]
    Closed,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum AssemblyError {
    #[error("frame needs {needed} bytes but only {available} arrived")]
    BufferTooShort { needed: usize, available: usize },

    #[error("cannot lay out a {width}x{height} YUY2 frame")]
    InvalidGeometry { width: u32, height: u32 },
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("frame geometry {width}x{height} has a zero dimension")]
    ZeroGeometry { width: u32, height: u32 },
}
