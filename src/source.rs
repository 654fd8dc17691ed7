use crate::camera::{CameraDevice, ExposureSettings};
use crate::config::{CameraConfig, ConfigUpdate, ConfigWriter};
use crate::error::CaptureError;
use crate::frame::{Frame, VideoSegment};
use crate::ring::FrameRing;
use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Manual exposure with an unset shutter falls back to this value
const DEFAULT_SHUTTER_MICROS: u32 = 5000;

/// Longest pause between acquisition retries after repeated failures
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(10);

fn coerce_shutter(shutter_micros: u32) -> u32 {
    if shutter_micros == 0 {
        DEFAULT_SHUTTER_MICROS
    } else {
        shutter_micros
    }
}

/// Continuous frame acquisition in front of a camera device.
///
/// A background thread pulls full resolution frames from the device,
/// downscales them to the detection resolution, and publishes each one
/// to a lock-free slot that readers sample without blocking. While
/// video buffering is active the same frames also land in a bounded
/// ring that preserves the seconds leading up to a motion event.
///
/// Device failures never stop the loop. Each failure reinitializes the
/// device and backs off before retrying, so an unplugged or wedged
/// camera recovers as soon as it returns.
pub struct FrameSource {
    config: CameraConfig,
    device: Arc<Mutex<Box<dyn CameraDevice>>>,
    current: Arc<ArcSwapOption<Frame>>,
    ring: Arc<FrameRing>,
    running: Arc<AtomicBool>,
    buffering: Arc<AtomicBool>,
    stats: Arc<SourceStats>,
    config_writer: ConfigWriter,
    acquisition: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl FrameSource {
    pub fn new(
        config: CameraConfig,
        device: Box<dyn CameraDevice>,
        config_writer: ConfigWriter,
    ) -> Self {
        let ring = Arc::new(FrameRing::new(config.buffer_capacity()));
        FrameSource {
            config,
            device: Arc::new(Mutex::new(device)),
            current: Arc::new(ArcSwapOption::empty()),
            ring,
            running: Arc::new(AtomicBool::new(false)),
            buffering: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(SourceStats::default()),
            config_writer,
            acquisition: Mutex::new(None),
        }
    }

    /// Apply persisted camera settings and begin acquisition. Calling
    /// this while already running is a no-op.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Frame source already running");
            return;
        }

        self.apply_persisted_settings();

        let device = Arc::clone(&self.device);
        let current = Arc::clone(&self.current);
        let ring = Arc::clone(&self.ring);
        let running = Arc::clone(&self.running);
        let buffering = Arc::clone(&self.buffering);
        let stats = Arc::clone(&self.stats);
        let (md_width, md_height) = self.config.md_resolution();
        let tick = Duration::from_millis((1000 / self.config.fps.max(1)).max(1) as u64);

        let handle = std::thread::spawn(move || {
            info!("Frame acquisition started");
            let mut failures: u32 = 0;

            while running.load(Ordering::Relaxed) {
                let started = Instant::now();
                let acquired = device.lock().acquire_frame();

                match acquired {
                    Ok(frame) => {
                        failures = 0;
                        stats.frames_acquired.fetch_add(1, Ordering::Relaxed);
                        match frame.resized(md_width, md_height) {
                            Ok(scaled) => {
                                if buffering.load(Ordering::Relaxed) {
                                    ring.push(scaled.clone());
                                }
                                current.store(Some(Arc::new(scaled)));
                            }
                            Err(e) => warn!("Failed to downscale frame: {}", e),
                        }
                    }
                    Err(e) => {
                        failures += 1;
                        error!("Frame acquisition failed ({} in a row): {}", failures, e);
                        stats.reinitializations.fetch_add(1, Ordering::Relaxed);
                        if let Err(e) = device.lock().reinitialize() {
                            error!("Device reinitialization failed: {}", e);
                        }
                        let backoff =
                            Duration::from_secs(failures.min(10) as u64).min(MAX_RETRY_BACKOFF);
                        interruptible_sleep(&running, backoff);
                        continue;
                    }
                }

                if let Some(rest) = tick.checked_sub(started.elapsed()) {
                    std::thread::sleep(rest);
                }
            }

            debug!("Frame acquisition stopped");
        });

        *self.acquisition.lock() = Some(handle);
    }

    /// Stop acquisition and wait for the loop to wind down
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.acquisition.lock().take() {
            if handle.join().is_err() {
                error!("Acquisition thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Most recent detection-resolution frame, if any has arrived yet
    pub fn current_frame(&self) -> Option<Frame> {
        self.current.load_full().map(|frame| (*frame).clone())
    }

    /// Most recent frame encoded as JPEG
    pub fn current_frame_jpeg(&self) -> Option<Vec<u8>> {
        let frame = self.current_frame()?;
        match frame.encode_jpeg() {
            Ok(jpeg) => Some(jpeg),
            Err(e) => {
                warn!("Failed to encode current frame: {}", e);
                None
            }
        }
    }

    /// Grab a full resolution still from the device
    pub async fn capture_high_res(&self) -> Result<Frame, CaptureError> {
        let device = Arc::clone(&self.device);
        let frame = tokio::task::spawn_blocking(move || device.lock().capture_still())
            .await
            .map_err(|e| CaptureError::Still {
                details: format!("capture task failed: {}", e),
            })??;
        self.stats.stills_captured.fetch_add(1, Ordering::Relaxed);
        Ok(frame)
    }

    /// Discard any previously buffered frames and begin collecting a
    /// fresh pre-roll window
    pub fn start_video_buffer(&self) {
        self.ring.clear();
        self.device.lock().begin_buffering();
        self.buffering.store(true, Ordering::SeqCst);
        self.stats.buffer_starts.fetch_add(1, Ordering::Relaxed);
        debug!("Video buffering started");
    }

    /// Stop collecting frames. Already buffered frames stay in place
    /// until the next buffering start discards them.
    pub fn stop_video_buffer(&self) {
        self.buffering.store(false, Ordering::SeqCst);
        self.device.lock().end_buffering();
        self.stats.buffer_stops.fetch_add(1, Ordering::Relaxed);
        debug!("Video buffering stopped");
    }

    pub fn is_buffering(&self) -> bool {
        self.buffering.load(Ordering::Relaxed)
    }

    /// Keep buffering for `after` beyond the event, then materialize the
    /// retained pre-motion window plus that extension into a segment
    pub async fn flush_video_buffer(&self, after: Duration) -> Result<VideoSegment, CaptureError> {
        if !self.buffering.load(Ordering::Relaxed) {
            return Err(CaptureError::BufferInactive);
        }

        tokio::time::sleep(after).await;

        let window = Duration::from_secs(self.config.buffer_seconds_before) + after;
        let frames = self.ring.collect_recent(window);
        debug!("Flushed {} buffered frames", frames.len());
        Ok(VideoSegment::new(frames, self.config.fps))
    }

    /// Rotate the image by half a turn. Unchanged values touch neither
    /// the device nor the persisted configuration.
    pub async fn set_rotation(&self, rotate: bool) -> Result<(), CaptureError> {
        let changed = {
            let mut device = self.device.lock();
            if device.rotation() == rotate {
                false
            } else {
                device.set_rotation(rotate)?;
                true
            }
        };

        if changed {
            info!("Rotation set to {}", rotate);
            self.config_writer.submit(ConfigUpdate::Rotation(rotate)).await;
        }
        Ok(())
    }

    /// Switch to manual exposure. A zero shutter speed falls back to
    /// the default so the sensor never ends up with an unset exposure.
    pub async fn set_exposure(&self, shutter_micros: u32, iso: u32) -> Result<(), CaptureError> {
        let shutter = coerce_shutter(shutter_micros);
        let device = Arc::clone(&self.device);
        tokio::task::spawn_blocking(move || device.lock().set_exposure(shutter, iso))
            .await
            .map_err(|e| CaptureError::Configuration {
                details: format!("exposure task failed: {}", e),
            })??;

        info!("Manual exposure set: shutter {}us, ISO {}", shutter, iso);
        self.config_writer
            .submit(ConfigUpdate::Exposure {
                mode: "off".to_string(),
                iso,
                shutter_speed: shutter,
            })
            .await;
        Ok(())
    }

    /// Return exposure control to the sensor
    pub async fn set_auto_exposure(&self) -> Result<(), CaptureError> {
        let device = Arc::clone(&self.device);
        tokio::task::spawn_blocking(move || device.lock().set_auto_exposure())
            .await
            .map_err(|e| CaptureError::Configuration {
                details: format!("exposure task failed: {}", e),
            })??;

        info!("Auto exposure restored");
        self.config_writer
            .submit(ConfigUpdate::Exposure {
                mode: "auto".to_string(),
                iso: 0,
                shutter_speed: 0,
            })
            .await;
        Ok(())
    }

    pub fn exposure_state(&self) -> ExposureSettings {
        self.device.lock().exposure()
    }

    pub fn rotation(&self) -> bool {
        self.device.lock().rotation()
    }

    #[cfg(test)]
    pub(crate) fn inject_frame(&self, frame: Frame) {
        self.current.store(Some(Arc::new(frame)));
    }

    pub fn stats_snapshot(&self) -> SourceStatsSnapshot {
        SourceStatsSnapshot {
            frames_acquired: self.stats.frames_acquired.load(Ordering::Relaxed),
            stills_captured: self.stats.stills_captured.load(Ordering::Relaxed),
            reinitializations: self.stats.reinitializations.load(Ordering::Relaxed),
            buffer_starts: self.stats.buffer_starts.load(Ordering::Relaxed),
            buffer_stops: self.stats.buffer_stops.load(Ordering::Relaxed),
        }
    }

    fn apply_persisted_settings(&self) {
        let mut device = self.device.lock();

        if let Err(e) = device.set_rotation(self.config.rotate) {
            warn!("Failed to apply persisted rotation: {}", e);
        }

        if self.config.exposure_mode == "off" {
            let shutter = coerce_shutter(self.config.shutter_speed);
            if let Err(e) = device.set_exposure(shutter, self.config.iso) {
                warn!("Failed to apply persisted exposure: {}", e);
            }
        }
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn interruptible_sleep(running: &AtomicBool, total: Duration) {
    let slice = Duration::from_millis(50);
    let mut remaining = total;
    while running.load(Ordering::Relaxed) && remaining > Duration::ZERO {
        let nap = remaining.min(slice);
        std::thread::sleep(nap);
        remaining = remaining.saturating_sub(nap);
    }
}

/// Counters for the acquisition loop
#[derive(Default)]
struct SourceStats {
    frames_acquired: AtomicU64,
    stills_captured: AtomicU64,
    reinitializations: AtomicU64,
    buffer_starts: AtomicU64,
    buffer_stops: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct SourceStatsSnapshot {
    pub frames_acquired: u64,
    pub stills_captured: u64,
    pub reinitializations: u64,
    pub buffer_starts: u64,
    pub buffer_stops: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::SyntheticCamera;
    use crate::config::TrailcamConfig;
    use tempfile::TempDir;

    fn create_test_config() -> TrailcamConfig {
        let mut config = TrailcamConfig::default();
        config.camera.resolution = (64, 48);
        config.camera.md_width = 32;
        config.camera.fps = 50;
        config.camera.buffer_seconds_before = 1;
        config.camera.buffer_seconds_after = 1;
        config
    }

    fn create_test_source(dir: &TempDir) -> FrameSource {
        let config = create_test_config();
        let writer = ConfigWriter::spawn(config.clone(), dir.path().join("trailcam.toml"));
        let device = Box::new(SyntheticCamera::new(config.camera.clone()));
        FrameSource::new(config.camera, device, writer)
    }

    async fn wait_for_frame(source: &FrameSource) -> Frame {
        for _ in 0..100 {
            if let Some(frame) = source.current_frame() {
                return frame;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("no frame arrived");
    }

    #[tokio::test]
    async fn test_start_populates_current_frame() {
        let dir = TempDir::new().unwrap();
        let source = create_test_source(&dir);

        assert!(source.current_frame().is_none());
        source.start();

        let frame = wait_for_frame(&source).await;
        assert_eq!((frame.width, frame.height), (32, 24));
        assert!(frame.validate_size());

        source.stop();
        assert!(!source.is_running());
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let source = create_test_source(&dir);

        source.start();
        source.start();
        assert!(source.is_running());

        wait_for_frame(&source).await;
        source.stop();
    }

    #[tokio::test]
    async fn test_current_frame_jpeg_encodes() {
        let dir = TempDir::new().unwrap();
        let source = create_test_source(&dir);
        source.start();
        wait_for_frame(&source).await;

        let jpeg = source.current_frame_jpeg().unwrap();
        assert_eq!(&jpeg[0..2], &[0xFF, 0xD8]);

        source.stop();
    }

    #[tokio::test]
    async fn test_capture_high_res_is_full_resolution() {
        let dir = TempDir::new().unwrap();
        let source = create_test_source(&dir);

        let still = source.capture_high_res().await.unwrap();
        assert_eq!((still.width, still.height), (64, 48));
    }

    #[tokio::test]
    async fn test_buffer_start_and_stop_are_counted() {
        let dir = TempDir::new().unwrap();
        let source = create_test_source(&dir);
        source.start();
        wait_for_frame(&source).await;

        source.start_video_buffer();
        assert!(source.is_buffering());
        tokio::time::sleep(Duration::from_millis(100)).await;
        source.stop_video_buffer();
        assert!(!source.is_buffering());

        let stats = source.stats_snapshot();
        assert_eq!(stats.buffer_starts, 1);
        assert_eq!(stats.buffer_stops, 1);
        assert_eq!(stats.stills_captured, 0);

        source.stop();
    }

    #[tokio::test]
    async fn test_flush_returns_detection_resolution_frames() {
        let dir = TempDir::new().unwrap();
        let source = create_test_source(&dir);
        source.start();
        wait_for_frame(&source).await;

        source.start_video_buffer();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let segment = source
            .flush_video_buffer(Duration::from_millis(200))
            .await
            .unwrap();
        assert!(!segment.is_empty());
        assert_eq!(segment.frame_rate, 50);
        for frame in &segment.frames {
            assert_eq!((frame.width, frame.height), (32, 24));
        }

        source.stop();
    }

    #[tokio::test]
    async fn test_flush_without_active_buffer_is_rejected() {
        let dir = TempDir::new().unwrap();
        let source = create_test_source(&dir);

        let result = source.flush_video_buffer(Duration::ZERO).await;
        assert!(matches!(result, Err(CaptureError::BufferInactive)));
    }

    #[tokio::test]
    async fn test_rotation_change_applies_and_persists() {
        let dir = TempDir::new().unwrap();
        let source = create_test_source(&dir);

        // Unchanged value writes nothing
        source.set_rotation(false).await.unwrap();
        assert!(!source.rotation());
        assert!(!dir.path().join("trailcam.toml").exists());

        source.set_rotation(true).await.unwrap();
        assert!(source.rotation());

        let mut persisted = String::new();
        for _ in 0..50 {
            if let Ok(contents) = std::fs::read_to_string(dir.path().join("trailcam.toml")) {
                if contents.contains("rotate = true") {
                    persisted = contents;
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(persisted.contains("rotate = true"));
    }

    #[tokio::test]
    async fn test_set_exposure_coerces_zero_shutter() {
        let dir = TempDir::new().unwrap();
        let source = create_test_source(&dir);

        source.set_exposure(0, 100).await.unwrap();

        let exposure = source.exposure_state();
        assert_eq!(exposure.shutter_micros, DEFAULT_SHUTTER_MICROS);
        assert_eq!(exposure.iso, 100);
    }

    #[tokio::test]
    async fn test_auto_exposure_round_trip() {
        let dir = TempDir::new().unwrap();
        let source = create_test_source(&dir);

        source.set_exposure(8000, 200).await.unwrap();
        source.set_auto_exposure().await.unwrap();

        let exposure = source.exposure_state();
        assert_eq!(exposure.iso, 0);
        assert_eq!(exposure.shutter_micros, 0);
    }
}
