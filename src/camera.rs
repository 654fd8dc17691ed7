use crate::config::CameraConfig;
use crate::error::CaptureError;
use crate::frame::Frame;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[cfg(all(feature = "camera", target_os = "linux"))]
use arc_swap::ArcSwapOption;
#[cfg(all(feature = "camera", target_os = "linux"))]
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
#[cfg(all(feature = "camera", target_os = "linux"))]
use std::sync::Arc;
#[cfg(all(feature = "camera", target_os = "linux"))]
use std::time::{Duration, Instant};
#[cfg(all(feature = "camera", target_os = "linux"))]
use tracing::{debug, error};

#[cfg(all(feature = "camera", target_os = "linux"))]
use v4l::buffer::Type;
#[cfg(all(feature = "camera", target_os = "linux"))]
use v4l::io::mmap::Stream;
#[cfg(all(feature = "camera", target_os = "linux"))]
use v4l::io::traits::CaptureStream;
#[cfg(all(feature = "camera", target_os = "linux"))]
use v4l::video::Capture;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExposureMode {
    Auto,
    Off,
}

impl ExposureMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExposureMode::Auto => "auto",
            ExposureMode::Off => "off",
        }
    }
}

/// Exposure state as last applied to (or stored for) the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposureSettings {
    pub mode: ExposureMode,
    pub iso: u32,
    pub shutter_micros: u32,
}

impl ExposureSettings {
    pub fn auto() -> Self {
        Self {
            mode: ExposureMode::Auto,
            iso: 0,
            shutter_micros: 0,
        }
    }

    pub fn from_config(config: &CameraConfig) -> Self {
        match parse_exposure_mode(&config.exposure_mode) {
            Ok(ExposureMode::Off) => Self {
                mode: ExposureMode::Off,
                iso: config.iso,
                shutter_micros: config.shutter_speed,
            },
            _ => Self::auto(),
        }
    }
}

/// Parse an exposure mode name from configuration or a client request
pub fn parse_exposure_mode(mode: &str) -> Result<ExposureMode, CaptureError> {
    match mode.to_lowercase().as_str() {
        "auto" => Ok(ExposureMode::Auto),
        "off" => Ok(ExposureMode::Off),
        _ => Err(CaptureError::Configuration {
            details: format!("Unknown exposure mode: {}", mode),
        }),
    }
}

/// Capability surface of a capture device.
///
/// Exactly one implementation is selected at startup: the V4L2 device
/// when the hardware opens, otherwise the synthetic source. Callers only
/// see this trait.
pub trait CameraDevice: Send {
    fn name(&self) -> &'static str;

    /// Block until the next full-resolution frame is available
    fn acquire_frame(&mut self) -> Result<Frame, CaptureError>;

    /// Fresh full-resolution still, may block for up to a frame interval
    fn capture_still(&mut self) -> Result<Frame, CaptureError>;

    /// Hook for devices with an on-board recording pipeline
    fn begin_buffering(&mut self) {}

    /// Counterpart of `begin_buffering`
    fn end_buffering(&mut self) {}

    fn set_rotation(&mut self, rotate: bool) -> Result<(), CaptureError>;

    fn rotation(&self) -> bool;

    /// Apply manual exposure. Implementations apply ISO first, give the
    /// sensor time to settle, then the shutter, then disable automatic
    /// exposure.
    fn set_exposure(&mut self, shutter_micros: u32, iso: u32) -> Result<(), CaptureError>;

    /// Return the device to fully automatic exposure
    fn set_auto_exposure(&mut self) -> Result<(), CaptureError>;

    fn exposure(&self) -> ExposureSettings;

    /// Tear down and reopen the device after an acquisition failure
    fn reinitialize(&mut self) -> Result<(), CaptureError>;
}

/// Open the configured camera, falling back to the synthetic source when
/// the hardware is unavailable.
pub fn open_device(config: &CameraConfig) -> Box<dyn CameraDevice> {
    #[cfg(all(feature = "camera", target_os = "linux"))]
    {
        match V4l2Camera::open(config.clone()) {
            Ok(camera) => {
                info!("Using V4L2 camera at {}", config.device_path());
                return Box::new(camera);
            }
            Err(e) => {
                warn!(
                    "Failed to open {}: {}, falling back to synthetic source",
                    config.device_path(),
                    e
                );
            }
        }
    }

    #[cfg(not(all(feature = "camera", target_os = "linux")))]
    warn!("V4L2 capture is only available on Linux, using synthetic source");

    Box::new(SyntheticCamera::new(config.clone()))
}

// V4L2 exposure and ISO control identifiers
#[cfg(all(feature = "camera", target_os = "linux"))]
const CID_EXPOSURE_AUTO: u32 = 0x009a_0901;
#[cfg(all(feature = "camera", target_os = "linux"))]
const CID_EXPOSURE_ABSOLUTE: u32 = 0x009a_0902;
#[cfg(all(feature = "camera", target_os = "linux"))]
const CID_ISO_SENSITIVITY: u32 = 0x009a_0917;
#[cfg(all(feature = "camera", target_os = "linux"))]
const CID_ISO_SENSITIVITY_AUTO: u32 = 0x009a_0918;

// EXPOSURE_AUTO menu values
#[cfg(all(feature = "camera", target_os = "linux"))]
const EXPOSURE_MANUAL: i64 = 1;
#[cfg(all(feature = "camera", target_os = "linux"))]
const EXPOSURE_APERTURE_PRIORITY: i64 = 3;

/// V4L2 camera. A dedicated reader thread owns the capture stream and
/// publishes the latest decoded frame; trait methods consume that slot
/// and drive controls through the shared device handle.
#[cfg(all(feature = "camera", target_os = "linux"))]
pub struct V4l2Camera {
    config: CameraConfig,
    device: Arc<v4l::Device>,
    latest: Arc<ArcSwapOption<Frame>>,
    running: Arc<AtomicBool>,
    rotate: Arc<AtomicBool>,
    frame_counter: Arc<AtomicU64>,
    reader: Option<std::thread::JoinHandle<()>>,
    last_delivered: u64,
    exposure: ExposureSettings,
}

#[cfg(all(feature = "camera", target_os = "linux"))]
impl V4l2Camera {
    pub fn open(config: CameraConfig) -> Result<Self, CaptureError> {
        let device = Self::open_configured(&config)?;

        let mut camera = Self {
            rotate: Arc::new(AtomicBool::new(config.rotate)),
            exposure: ExposureSettings::from_config(&config),
            config,
            device: Arc::new(device),
            latest: Arc::new(ArcSwapOption::empty()),
            running: Arc::new(AtomicBool::new(false)),
            frame_counter: Arc::new(AtomicU64::new(0)),
            reader: None,
            last_delivered: 0,
        };
        camera.spawn_reader();
        Ok(camera)
    }

    /// Open the device node and negotiate format and frame rate
    fn open_configured(config: &CameraConfig) -> Result<v4l::Device, CaptureError> {
        let device_path = config.device_path();
        debug!("Opening V4L2 device: {}", device_path);

        let device = v4l::Device::with_path(&device_path).map_err(|e| CaptureError::DeviceOpen {
            device: device_path.clone(),
            details: e.to_string(),
        })?;

        let mut fmt = device.format().map_err(|e| CaptureError::Configuration {
            details: format!("Failed to get format: {}", e),
        })?;

        fmt.width = config.resolution.0;
        fmt.height = config.resolution.1;
        fmt.fourcc = v4l::FourCC::new(b"MJPG");

        device
            .set_format(&fmt)
            .map_err(|e| CaptureError::Configuration {
                details: format!("Failed to set format: {}", e),
            })?;

        let actual_fmt = device.format().map_err(|e| CaptureError::Configuration {
            details: format!("Failed to verify format: {}", e),
        })?;

        if actual_fmt.width != config.resolution.0 || actual_fmt.height != config.resolution.1 {
            warn!(
                "Camera resolution adjusted by driver: requested {}x{}, got {}x{}",
                config.resolution.0, config.resolution.1, actual_fmt.width, actual_fmt.height
            );
        }

        let mut params = device.params().map_err(|e| CaptureError::Configuration {
            details: format!("Failed to get params: {}", e),
        })?;

        params.interval = v4l::Fraction::new(1, config.fps);

        device
            .set_params(&params)
            .map_err(|e| CaptureError::Configuration {
                details: format!("Failed to set frame rate: {}", e),
            })?;

        let actual_params = device.params().map_err(|e| CaptureError::Configuration {
            details: format!("Failed to verify params: {}", e),
        })?;

        if actual_params.interval.numerator > 0 {
            let actual_fps = actual_params.interval.denominator / actual_params.interval.numerator;
            if actual_fps != config.fps {
                warn!(
                    "Camera frame rate adjusted by driver: requested {}fps, got {}fps",
                    config.fps, actual_fps
                );
            }
        }

        info!(
            "Camera configured: {}x{} @ {}fps, format: {:?}",
            actual_fmt.width, actual_fmt.height, config.fps, actual_fmt.fourcc
        );

        Ok(device)
    }

    fn spawn_reader(&mut self) {
        let device = Arc::clone(&self.device);
        let latest = Arc::clone(&self.latest);
        let running = Arc::clone(&self.running);
        let rotate = Arc::clone(&self.rotate);
        let frame_counter = Arc::clone(&self.frame_counter);

        running.store(true, Ordering::Relaxed);
        self.reader = Some(std::thread::spawn(move || {
            let mut stream = match Stream::with_buffers(&device, Type::VideoCapture, 4) {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Failed to create capture stream: {}", e);
                    running.store(false, Ordering::Relaxed);
                    return;
                }
            };

            info!("Camera capture thread started");
            while running.load(Ordering::Relaxed) {
                match stream.next() {
                    Ok((buffer, _meta)) => {
                        let decoded = match image::load_from_memory(buffer) {
                            Ok(img) => img.to_rgb8(),
                            Err(e) => {
                                warn!("Dropping undecodable frame: {}", e);
                                continue;
                            }
                        };

                        let (width, height) = decoded.dimensions();
                        let id = frame_counter.fetch_add(1, Ordering::Relaxed) + 1;
                        let mut frame = Frame::new(id, decoded.into_raw(), width, height);
                        if rotate.load(Ordering::Relaxed) {
                            frame = frame.rotate180();
                        }
                        latest.store(Some(Arc::new(frame)));
                    }
                    Err(e) => {
                        error!("Frame capture error: {}", e);
                        running.store(false, Ordering::Relaxed);
                        break;
                    }
                }
            }
            debug!("Camera capture thread stopped");
        }));
    }

    fn stop_reader(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.reader.take() {
            if handle.join().is_err() {
                warn!("Camera capture thread panicked during shutdown");
            }
        }
    }

    fn set_control(&self, id: u32, value: i64) -> std::io::Result<()> {
        self.device.set_control(v4l::Control {
            id,
            value: v4l::control::Value::Integer(value),
        })
    }

    /// Wait for a frame newer than the last one delivered
    fn next_fresh_frame(&mut self) -> Result<Frame, CaptureError> {
        let frame_interval = Duration::from_millis(1000 / self.config.fps.max(1) as u64);
        let deadline = Instant::now() + (frame_interval * 3).max(Duration::from_millis(500));

        loop {
            if let Some(frame) = self.latest.load_full() {
                if frame.id > self.last_delivered {
                    self.last_delivered = frame.id;
                    return Ok((*frame).clone());
                }
            }

            if !self.running.load(Ordering::Relaxed) {
                return Err(CaptureError::Acquisition {
                    details: "capture thread is not running".to_string(),
                });
            }
            if Instant::now() >= deadline {
                return Err(CaptureError::Acquisition {
                    details: "timed out waiting for a frame".to_string(),
                });
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }
}

#[cfg(all(feature = "camera", target_os = "linux"))]
impl CameraDevice for V4l2Camera {
    fn name(&self) -> &'static str {
        "v4l2"
    }

    fn acquire_frame(&mut self) -> Result<Frame, CaptureError> {
        self.next_fresh_frame()
    }

    fn capture_still(&mut self) -> Result<Frame, CaptureError> {
        self.next_fresh_frame()
    }

    fn set_rotation(&mut self, rotate: bool) -> Result<(), CaptureError> {
        self.rotate.store(rotate, Ordering::Relaxed);
        Ok(())
    }

    fn rotation(&self) -> bool {
        self.rotate.load(Ordering::Relaxed)
    }

    fn set_exposure(&mut self, shutter_micros: u32, iso: u32) -> Result<(), CaptureError> {
        if iso > 0 {
            // ISO controls are optional on UVC hardware
            if let Err(e) = self.set_control(CID_ISO_SENSITIVITY_AUTO, 0) {
                warn!("ISO mode control not applied: {}", e);
            }
            if let Err(e) = self.set_control(CID_ISO_SENSITIVITY, iso as i64) {
                warn!("ISO control not applied: {}", e);
            }
        }

        // Let the sensor settle before fixing the shutter
        std::thread::sleep(Duration::from_millis(500));

        // EXPOSURE_ABSOLUTE is in 100 microsecond units
        self.set_control(CID_EXPOSURE_ABSOLUTE, (shutter_micros / 100).max(1) as i64)
            .map_err(|e| CaptureError::Configuration {
                details: format!("Failed to set shutter: {}", e),
            })?;

        self.set_control(CID_EXPOSURE_AUTO, EXPOSURE_MANUAL)
            .map_err(|e| CaptureError::Configuration {
                details: format!("Failed to disable auto exposure: {}", e),
            })?;

        self.exposure = ExposureSettings {
            mode: ExposureMode::Off,
            iso,
            shutter_micros,
        };
        info!(shutter_micros, iso, "manual exposure applied");
        Ok(())
    }

    fn set_auto_exposure(&mut self) -> Result<(), CaptureError> {
        self.set_control(CID_EXPOSURE_AUTO, EXPOSURE_APERTURE_PRIORITY)
            .map_err(|e| CaptureError::Configuration {
                details: format!("Failed to enable auto exposure: {}", e),
            })?;
        if let Err(e) = self.set_control(CID_ISO_SENSITIVITY_AUTO, 1) {
            warn!("ISO mode control not applied: {}", e);
        }

        self.exposure = ExposureSettings::auto();
        info!("automatic exposure restored");
        Ok(())
    }

    fn exposure(&self) -> ExposureSettings {
        self.exposure
    }

    fn reinitialize(&mut self) -> Result<(), CaptureError> {
        info!("Reinitializing camera device {}", self.config.index);
        self.stop_reader();

        let device = Self::open_configured(&self.config)?;
        self.device = Arc::new(device);
        self.latest.store(None);
        self.spawn_reader();
        Ok(())
    }
}

#[cfg(all(feature = "camera", target_os = "linux"))]
impl Drop for V4l2Camera {
    fn drop(&mut self) {
        self.stop_reader();
    }
}

/// Synthetic frame source used when no camera hardware is available.
///
/// Produces a deterministic color pattern so the rest of the pipeline
/// can run end to end. Rotation and exposure are stored but inert.
pub struct SyntheticCamera {
    config: CameraConfig,
    frame_counter: u64,
    rotate: bool,
    exposure: ExposureSettings,
}

impl SyntheticCamera {
    pub fn new(config: CameraConfig) -> Self {
        Self {
            rotate: config.rotate,
            exposure: ExposureSettings::from_config(&config),
            config,
            frame_counter: 0,
        }
    }

    fn generate_frame(&mut self) -> Frame {
        self.frame_counter += 1;
        let id = self.frame_counter;
        let (width, height) = self.config.resolution;

        // Solid color pattern derived from the frame id
        let color = [(id % 256) as u8, 128u8, (255 - id % 256) as u8];
        let mut data = vec![0u8; (width * height * 3) as usize];
        for chunk in data.chunks_exact_mut(3) {
            chunk.copy_from_slice(&color);
        }

        Frame::new(id, data, width, height)
    }
}

impl CameraDevice for SyntheticCamera {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn acquire_frame(&mut self) -> Result<Frame, CaptureError> {
        Ok(self.generate_frame())
    }

    fn capture_still(&mut self) -> Result<Frame, CaptureError> {
        Ok(self.generate_frame())
    }

    fn set_rotation(&mut self, rotate: bool) -> Result<(), CaptureError> {
        self.rotate = rotate;
        Ok(())
    }

    fn rotation(&self) -> bool {
        self.rotate
    }

    fn set_exposure(&mut self, shutter_micros: u32, iso: u32) -> Result<(), CaptureError> {
        self.exposure = ExposureSettings {
            mode: ExposureMode::Off,
            iso,
            shutter_micros,
        };
        Ok(())
    }

    fn set_auto_exposure(&mut self) -> Result<(), CaptureError> {
        self.exposure = ExposureSettings::auto();
        Ok(())
    }

    fn exposure(&self) -> ExposureSettings {
        self.exposure
    }

    fn reinitialize(&mut self) -> Result<(), CaptureError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrailcamConfig;

    fn create_test_config() -> CameraConfig {
        let mut config = TrailcamConfig::default().camera;
        config.resolution = (64, 48);
        config.md_width = 32;
        config
    }

    #[test]
    fn test_synthetic_frames_are_valid() {
        let mut camera = SyntheticCamera::new(create_test_config());
        assert_eq!(camera.name(), "synthetic");

        let first = camera.acquire_frame().unwrap();
        let second = camera.acquire_frame().unwrap();

        assert!(first.validate_size());
        assert_eq!(first.width, 64);
        assert_eq!(first.height, 48);
        assert!(second.id > first.id);
    }

    #[test]
    fn test_synthetic_rotation_is_stored() {
        let mut camera = SyntheticCamera::new(create_test_config());
        assert!(!camera.rotation());

        camera.set_rotation(true).unwrap();
        assert!(camera.rotation());

        camera.reinitialize().unwrap();
        assert!(camera.rotation());
    }

    #[test]
    fn test_synthetic_exposure_round_trip() {
        let mut camera = SyntheticCamera::new(create_test_config());
        assert_eq!(camera.exposure().mode, ExposureMode::Auto);

        camera.set_exposure(8000, 400).unwrap();
        let exposure = camera.exposure();
        assert_eq!(exposure.mode, ExposureMode::Off);
        assert_eq!(exposure.shutter_micros, 8000);
        assert_eq!(exposure.iso, 400);

        camera.set_auto_exposure().unwrap();
        assert_eq!(camera.exposure(), ExposureSettings::auto());
    }

    #[test]
    fn test_exposure_mode_parsing() {
        assert_eq!(parse_exposure_mode("auto").unwrap(), ExposureMode::Auto);
        assert_eq!(parse_exposure_mode("AUTO").unwrap(), ExposureMode::Auto);
        assert_eq!(parse_exposure_mode("off").unwrap(), ExposureMode::Off);
        assert!(parse_exposure_mode("night").is_err());
    }

    #[test]
    fn test_exposure_settings_from_config() {
        let mut config = create_test_config();
        config.exposure_mode = "off".to_string();
        config.iso = 200;
        config.shutter_speed = 5000;

        let settings = ExposureSettings::from_config(&config);
        assert_eq!(settings.mode, ExposureMode::Off);
        assert_eq!(settings.iso, 200);
        assert_eq!(settings.shutter_micros, 5000);

        config.exposure_mode = "auto".to_string();
        assert_eq!(
            ExposureSettings::from_config(&config),
            ExposureSettings::auto()
        );
    }

    #[test]
    fn test_open_device_always_yields_a_device() {
        let mut device = open_device(&create_test_config());
        let frame = device.acquire_frame().unwrap();
        assert!(frame.validate_size());
    }
}
