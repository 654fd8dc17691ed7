use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrailcamError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("Deserialization error: {0}")]
    Deserialization(#[from] toml::de::Error),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("System error: {message}")]
    System { message: String },

    #[error("Component error in {component}: {message}")]
    Component { component: String, message: String },
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Failed to open camera device {device}: {details}")]
    DeviceOpen { device: String, details: String },

    #[error("Camera configuration rejected: {details}")]
    Configuration { details: String },

    #[error("Frame acquisition failed: {details}")]
    Acquisition { details: String },

    #[error("Still capture failed: {details}")]
    Still { details: String },

    #[error("Frame decode failed: {details}")]
    Decode { details: String },

    #[error("Video buffer inactive")]
    BufferInactive,
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage usage at {percent:.1}%, refusing to write")]
    Exhausted { percent: f64 },

    #[error("Failed to create directory {path}: {source}")]
    DirectoryCreation {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },

    #[error("Image encoding failed: {details}")]
    Encode { details: String },

    #[error("Video remux failed: {details}")]
    Remux { details: String },

    #[error("Persistence worker unavailable")]
    WorkerGone,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Invalid session kind: {kind}")]
    InvalidRequest { kind: String },

    #[error("Invalid sensitivity preset: {preset}")]
    InvalidPreset { preset: String },

    #[error("Device clock already set")]
    ClockAlreadySet,

    #[error("Device clock value {epoch} out of range")]
    ClockOutOfRange { epoch: i64 },

    #[error("Session controller unavailable")]
    ControllerGone,
}

impl TrailcamError {
    pub fn system<S: Into<String>>(message: S) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    pub fn component<S: Into<String>>(component: S, message: S) -> Self {
        Self::Component {
            component: component.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TrailcamError>;
