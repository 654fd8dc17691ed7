use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TrailcamConfig {
    pub camera: CameraConfig,
    pub detection: DetectionConfig,
    pub session: SessionConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CameraConfig {
    /// Camera device index (e.g., 0 for /dev/video0)
    #[serde(default = "default_camera_index")]
    pub index: u32,

    /// Full capture resolution (width, height)
    #[serde(default = "default_camera_resolution")]
    pub resolution: (u32, u32),

    /// Frames per second
    #[serde(default = "default_camera_fps")]
    pub fps: u32,

    /// Width of the downscaled frame used for change detection
    #[serde(default = "default_md_width")]
    pub md_width: u32,

    /// Rotate the image by 180 degrees
    #[serde(default = "default_camera_rotate")]
    pub rotate: bool,

    /// Exposure mode ("auto" or "off")
    #[serde(default = "default_exposure_mode")]
    pub exposure_mode: String,

    /// ISO sensitivity, 0 selects automatic
    #[serde(default = "default_iso")]
    pub iso: u32,

    /// Shutter speed in microseconds, 0 selects automatic
    #[serde(default = "default_shutter_speed")]
    pub shutter_speed: u32,

    /// Rolling buffer duration retained before motion, in seconds
    #[serde(default = "default_buffer_seconds_before")]
    pub buffer_seconds_before: u64,

    /// Recording continues this long after motion, in seconds
    #[serde(default = "default_buffer_seconds_after")]
    pub buffer_seconds_after: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DetectionConfig {
    /// Pixel delta threshold applied to the background difference
    #[serde(default = "default_delta_threshold")]
    pub delta_threshold: u8,

    /// Minimum accepted motion region width in pixels
    #[serde(default = "default_min_width")]
    pub min_width: u32,

    /// Maximum accepted motion region width in pixels
    #[serde(default = "default_max_width")]
    pub max_width: u32,

    /// Minimum accepted motion region height in pixels
    #[serde(default = "default_min_height")]
    pub min_height: u32,

    /// Maximum accepted motion region height in pixels
    #[serde(default = "default_max_height")]
    pub max_height: u32,

    /// Minimum region width for the low-sensitivity tier
    #[serde(default = "default_less_sensitivity")]
    pub less_sensitivity: u32,

    /// Minimum region width for the high-sensitivity tier
    #[serde(default = "default_more_sensitivity")]
    pub more_sensitivity: u32,

    /// Minimum time between captures, in seconds
    #[serde(default = "default_min_capture_interval_secs")]
    pub min_capture_interval_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SessionConfig {
    /// Interval between timelapse captures, in seconds
    #[serde(default = "default_timelapse_interval_secs")]
    pub timelapse_interval_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StorageConfig {
    /// Base data directory, also holds the log file
    #[serde(default = "default_data_path")]
    pub data_path: String,

    /// Directory for photo and timelapse artifacts
    #[serde(default = "default_photos_path")]
    pub photos_path: String,

    /// Directory for video artifacts
    #[serde(default = "default_videos_path")]
    pub videos_path: String,

    /// Thumbnail width in pixels
    #[serde(default = "default_thumbnail_width")]
    pub thumbnail_width: u32,
}

impl CameraConfig {
    /// Detection resolution, height derived from the full aspect ratio
    pub fn md_resolution(&self) -> (u32, u32) {
        let (width, height) = self.resolution;
        if width == 0 {
            return (self.md_width, 0);
        }
        (self.md_width, (self.md_width * height / width).max(1))
    }

    pub fn device_path(&self) -> String {
        format!("/dev/video{}", self.index)
    }

    /// Frames the rolling buffer must hold to cover both durations
    pub fn buffer_capacity(&self) -> usize {
        ((self.buffer_seconds_before + self.buffer_seconds_after) * self.fps as u64) as usize
    }
}

impl TrailcamConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("trailcam.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            // Start with default values
            .set_default("camera.index", default_camera_index())?
            .set_default(
                "camera.resolution",
                vec![default_camera_resolution().0, default_camera_resolution().1],
            )?
            .set_default("camera.fps", default_camera_fps())?
            .set_default("camera.md_width", default_md_width())?
            .set_default("camera.rotate", default_camera_rotate())?
            .set_default("camera.exposure_mode", default_exposure_mode())?
            .set_default("camera.iso", default_iso())?
            .set_default("camera.shutter_speed", default_shutter_speed())?
            .set_default(
                "camera.buffer_seconds_before",
                default_buffer_seconds_before(),
            )?
            .set_default(
                "camera.buffer_seconds_after",
                default_buffer_seconds_after(),
            )?
            .set_default(
                "detection.delta_threshold",
                default_delta_threshold() as u32,
            )?
            .set_default("detection.min_width", default_min_width())?
            .set_default("detection.max_width", default_max_width())?
            .set_default("detection.min_height", default_min_height())?
            .set_default("detection.max_height", default_max_height())?
            .set_default("detection.less_sensitivity", default_less_sensitivity())?
            .set_default("detection.more_sensitivity", default_more_sensitivity())?
            .set_default(
                "detection.min_capture_interval_secs",
                default_min_capture_interval_secs(),
            )?
            .set_default(
                "session.timelapse_interval_secs",
                default_timelapse_interval_secs(),
            )?
            .set_default("storage.data_path", default_data_path())?
            .set_default("storage.photos_path", default_photos_path())?
            .set_default("storage.videos_path", default_videos_path())?
            .set_default("storage.thumbnail_width", default_thumbnail_width())?
            // Add configuration file (optional)
            .add_source(File::with_name(&path_str).required(false))
            // Add environment variables with TRAILCAM_ prefix
            .add_source(Environment::with_prefix("TRAILCAM").separator("_"))
            .build()?;

        let config: TrailcamConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.camera.resolution.0 == 0 || self.camera.resolution.1 == 0 {
            return Err(ConfigError::Message(
                "Camera resolution must be greater than 0".to_string(),
            ));
        }

        if self.camera.fps == 0 {
            return Err(ConfigError::Message(
                "Camera fps must be greater than 0".to_string(),
            ));
        }

        if self.camera.md_width == 0 || self.camera.md_width > self.camera.resolution.0 {
            return Err(ConfigError::Message(
                "Detection width must be between 1 and the capture width".to_string(),
            ));
        }

        if self.camera.exposure_mode != "auto" && self.camera.exposure_mode != "off" {
            return Err(ConfigError::Message(format!(
                "Unknown exposure mode: {}",
                self.camera.exposure_mode
            )));
        }

        if self.camera.buffer_seconds_before == 0 || self.camera.buffer_seconds_after == 0 {
            return Err(ConfigError::Message(
                "Video buffer durations must be greater than 0".to_string(),
            ));
        }

        if self.detection.min_width > self.detection.max_width {
            return Err(ConfigError::Message(
                "Detection min_width must not exceed max_width".to_string(),
            ));
        }

        if self.detection.min_height > self.detection.max_height {
            return Err(ConfigError::Message(
                "Detection min_height must not exceed max_height".to_string(),
            ));
        }

        if self.session.timelapse_interval_secs == 0 {
            return Err(ConfigError::Message(
                "Timelapse interval must be greater than 0".to_string(),
            ));
        }

        if self.storage.thumbnail_width == 0 {
            return Err(ConfigError::Message(
                "Thumbnail width must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for TrailcamConfig {
    fn default() -> Self {
        Self {
            camera: CameraConfig {
                index: default_camera_index(),
                resolution: default_camera_resolution(),
                fps: default_camera_fps(),
                md_width: default_md_width(),
                rotate: default_camera_rotate(),
                exposure_mode: default_exposure_mode(),
                iso: default_iso(),
                shutter_speed: default_shutter_speed(),
                buffer_seconds_before: default_buffer_seconds_before(),
                buffer_seconds_after: default_buffer_seconds_after(),
            },
            detection: DetectionConfig {
                delta_threshold: default_delta_threshold(),
                min_width: default_min_width(),
                max_width: default_max_width(),
                min_height: default_min_height(),
                max_height: default_max_height(),
                less_sensitivity: default_less_sensitivity(),
                more_sensitivity: default_more_sensitivity(),
                min_capture_interval_secs: default_min_capture_interval_secs(),
            },
            session: SessionConfig {
                timelapse_interval_secs: default_timelapse_interval_secs(),
            },
            storage: StorageConfig {
                data_path: default_data_path(),
                photos_path: default_photos_path(),
                videos_path: default_videos_path(),
                thumbnail_width: default_thumbnail_width(),
            },
        }
    }
}

/// Camera setting change to apply and persist
#[derive(Debug, Clone)]
pub enum ConfigUpdate {
    Rotation(bool),
    Exposure {
        mode: String,
        iso: u32,
        shutter_speed: u32,
    },
}

/// Serialized writer for camera settings that survive restarts.
///
/// All mutations funnel through one task owning the authoritative copy,
/// so concurrent updates cannot interleave partial writes.
#[derive(Debug, Clone)]
pub struct ConfigWriter {
    tx: mpsc::Sender<ConfigUpdate>,
}

impl ConfigWriter {
    pub fn spawn(mut config: TrailcamConfig, path: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::channel::<ConfigUpdate>(16);

        tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                match update {
                    ConfigUpdate::Rotation(rotate) => {
                        config.camera.rotate = rotate;
                    }
                    ConfigUpdate::Exposure {
                        mode,
                        iso,
                        shutter_speed,
                    } => {
                        config.camera.exposure_mode = mode;
                        config.camera.iso = iso;
                        config.camera.shutter_speed = shutter_speed;
                    }
                }

                match toml::to_string_pretty(&config) {
                    Ok(rendered) => {
                        if let Err(e) = tokio::fs::write(&path, rendered).await {
                            warn!("Failed to persist configuration to {:?}: {}", path, e);
                        } else {
                            debug!("Configuration persisted to {:?}", path);
                        }
                    }
                    Err(e) => warn!("Failed to serialize configuration: {}", e),
                }
            }
            debug!("Configuration writer stopped");
        });

        Self { tx }
    }

    pub async fn submit(&self, update: ConfigUpdate) {
        if self.tx.send(update).await.is_err() {
            warn!("Configuration writer is gone, update dropped");
        }
    }
}

// Default value functions
fn default_camera_index() -> u32 {
    0
}
fn default_camera_resolution() -> (u32, u32) {
    (1640, 1232)
}
fn default_camera_fps() -> u32 {
    30
}
fn default_md_width() -> u32 {
    320
}
fn default_camera_rotate() -> bool {
    false
}
fn default_exposure_mode() -> String {
    "auto".to_string()
}
fn default_iso() -> u32 {
    0
}
fn default_shutter_speed() -> u32 {
    0
}
fn default_buffer_seconds_before() -> u64 {
    5
}
fn default_buffer_seconds_after() -> u64 {
    10
}

fn default_delta_threshold() -> u8 {
    5
}
fn default_min_width() -> u32 {
    20
}
fn default_max_width() -> u32 {
    200
}
fn default_min_height() -> u32 {
    20
}
fn default_max_height() -> u32 {
    200
}
fn default_less_sensitivity() -> u32 {
    50
}
fn default_more_sensitivity() -> u32 {
    10
}
fn default_min_capture_interval_secs() -> u64 {
    5
}

fn default_timelapse_interval_secs() -> u64 {
    30
}

fn default_data_path() -> String {
    "./data".to_string()
}
fn default_photos_path() -> String {
    "./data/photos".to_string()
}
fn default_videos_path() -> String {
    "./data/videos".to_string()
}
fn default_thumbnail_width() -> u32 {
    320
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::time::Duration;

    #[test]
    fn test_default_config_is_valid() {
        let config = TrailcamConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.camera.md_resolution(), (320, 240));
        assert_eq!(config.camera.device_path(), "/dev/video0");
        assert_eq!(config.camera.buffer_capacity(), 450);
    }

    #[test]
    fn test_environment_variable_override() {
        env::set_var("TRAILCAM_CAMERA_INDEX", "1");
        env::set_var("TRAILCAM_CAMERA_ROTATE", "true");

        assert_eq!(env::var("TRAILCAM_CAMERA_INDEX").unwrap(), "1");
        assert_eq!(env::var("TRAILCAM_CAMERA_ROTATE").unwrap(), "true");

        // Clean up
        env::remove_var("TRAILCAM_CAMERA_INDEX");
        env::remove_var("TRAILCAM_CAMERA_ROTATE");
    }

    #[test]
    fn test_config_validation() {
        let mut config = TrailcamConfig::default();
        config.detection.min_width = 300;

        // min_width above max_width must fail
        assert!(config.validate().is_err());

        config.detection.min_width = 20;
        assert!(config.validate().is_ok());

        config.camera.exposure_mode = "night".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trailcam.toml");
        std::fs::write(
            &path,
            "[detection]\ndelta_threshold = 12\n\n[session]\ntimelapse_interval_secs = 60\n",
        )
        .unwrap();

        let config = TrailcamConfig::load_from_file(&path).unwrap();
        assert_eq!(config.detection.delta_threshold, 12);
        assert_eq!(config.session.timelapse_interval_secs, 60);
        // Untouched sections keep their defaults
        assert_eq!(config.camera.fps, default_camera_fps());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");

        let config = TrailcamConfig::load_from_file(&path).unwrap();
        assert_eq!(config.camera.resolution, default_camera_resolution());
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_config_writer_persists_updates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trailcam.toml");
        let writer = ConfigWriter::spawn(TrailcamConfig::default(), path.clone());

        writer.submit(ConfigUpdate::Rotation(true)).await;
        writer
            .submit(ConfigUpdate::Exposure {
                mode: "off".to_string(),
                iso: 200,
                shutter_speed: 8000,
            })
            .await;

        let mut persisted = String::new();
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if let Ok(contents) = tokio::fs::read_to_string(&path).await {
                if contents.contains("shutter_speed = 8000") {
                    persisted = contents;
                    break;
                }
            }
        }

        assert!(persisted.contains("rotate = true"));
        assert!(persisted.contains("exposure_mode = \"off\""));
        assert!(persisted.contains("iso = 200"));
    }
}
