pub mod config;
pub mod error;
pub mod frame;
pub mod clock;
pub mod ring;
pub mod camera;
pub mod detector;
pub mod source;
pub mod session;
pub mod saver;
pub mod orchestrator;

pub use config::{
    CameraConfig, ConfigUpdate, ConfigWriter, DetectionConfig, SessionConfig, StorageConfig,
    TrailcamConfig,
};
pub use error::{CaptureError, Result, SessionError, StorageError, TrailcamError};
pub use frame::{CaptureKind, Frame, VideoSegment};
pub use clock::{DeviceClock, EPOCH_FLOOR};
pub use ring::{FrameRing, RingStatsSnapshot};
pub use camera::{open_device, CameraDevice, ExposureMode, ExposureSettings, SyntheticCamera};
pub use detector::{BackgroundModel, MotionDetector, Sensitivity, SensitivityPreset};
pub use source::{FrameSource, SourceStatsSnapshot};
pub use session::{
    SessionController, SessionHandle, SessionMode, SessionStatus, SettingsSnapshot,
};
pub use saver::{DiskUsage, PersistenceWorker, SaverHandle, SystemDiskUsage};
pub use orchestrator::{ShutdownReason, TrailcamOrchestrator};

#[cfg(all(feature = "camera", target_os = "linux"))]
pub use camera::V4l2Camera;
