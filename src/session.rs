use crate::clock::DeviceClock;
use crate::config::TrailcamConfig;
use crate::detector::{BackgroundModel, MotionDetector, Sensitivity, SensitivityPreset};
use crate::error::SessionError;
use crate::frame::{CaptureKind, Frame};
use crate::saver::SaverHandle;
use crate::source::FrameSource;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Cadence of the detection loop between frame polls
const TICK_INTERVAL: Duration = Duration::from_millis(20);

/// Pause after a poll finds no frame available
const MISSING_FRAME_BACKOFF: Duration = Duration::from_secs(1);

const COMMAND_QUEUE_DEPTH: usize = 16;

/// Capture mode the controller is currently in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    Inactive,
    Photo,
    Video,
    Timelapse,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionMode::Inactive => "inactive",
            SessionMode::Photo => "photo",
            SessionMode::Video => "video",
            SessionMode::Timelapse => "timelapse",
        }
    }
}

/// Point-in-time view of the adjustable camera settings
#[derive(Debug, Clone, Serialize)]
pub struct SettingsSnapshot {
    pub rotation: bool,
    pub exposure_mode: String,
    pub iso: u32,
    pub shutter_speed: u32,
    pub sensitivity: String,
    pub timelapse_active: bool,
    pub timelapse_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub mode: SessionMode,
    pub started_epoch_secs: Option<u64>,
}

enum SessionCommand {
    Start {
        kind: CaptureKind,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Stop {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    SetSensitivity {
        preset: SensitivityPreset,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    SetDeviceClock {
        epoch_secs: i64,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    SetTimelapse {
        active: bool,
        interval_secs: u64,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Snapshot {
        reply: oneshot::Sender<SettingsSnapshot>,
    },
    Status {
        reply: oneshot::Sender<SessionStatus>,
    },
}

/// Cloneable front door to the session controller. Every call is
/// answered once the controller has applied it, so callers observe
/// completed state changes rather than queued ones.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub async fn start_session(&self, kind: CaptureKind) -> Result<(), SessionError> {
        self.send(|reply| SessionCommand::Start { kind, reply }).await?
    }

    pub async fn stop_session(&self) -> Result<(), SessionError> {
        self.send(|reply| SessionCommand::Stop { reply }).await?
    }

    pub async fn set_sensitivity(&self, preset: SensitivityPreset) -> Result<(), SessionError> {
        self.send(|reply| SessionCommand::SetSensitivity { preset, reply })
            .await?
    }

    pub async fn set_device_clock(&self, epoch_secs: i64) -> Result<(), SessionError> {
        self.send(|reply| SessionCommand::SetDeviceClock { epoch_secs, reply })
            .await?
    }

    pub async fn set_timelapse(&self, active: bool, interval_secs: u64) -> Result<(), SessionError> {
        self.send(|reply| SessionCommand::SetTimelapse {
            active,
            interval_secs,
            reply,
        })
        .await?
    }

    pub async fn settings_snapshot(&self) -> Result<SettingsSnapshot, SessionError> {
        self.send(|reply| SessionCommand::Snapshot { reply }).await
    }

    pub async fn session_status(&self) -> Result<SessionStatus, SessionError> {
        self.send(|reply| SessionCommand::Status { reply }).await
    }

    async fn send<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| SessionError::ControllerGone)?;
        reply_rx.await.map_err(|_| SessionError::ControllerGone)
    }
}

/// Capture state machine.
///
/// Runs as a single task that interleaves command handling with a
/// fixed-cadence detection tick, so all session state lives on one
/// owner and never needs locking. Tick failures are logged and
/// swallowed; only an explicit stop or shutdown ends a session.
pub struct SessionController {
    config: TrailcamConfig,
    source: Arc<FrameSource>,
    saver: SaverHandle,
    clock: Arc<DeviceClock>,
    detector: MotionDetector,
    model: BackgroundModel,
    sensitivity: Sensitivity,
    mode: SessionMode,
    session_started: Option<Duration>,
    last_capture: Duration,
    min_capture_interval: Duration,
    timelapse_active: bool,
    timelapse_interval: Duration,
}

impl SessionController {
    pub fn spawn(
        config: TrailcamConfig,
        source: Arc<FrameSource>,
        saver: SaverHandle,
        clock: Arc<DeviceClock>,
        shutdown: CancellationToken,
    ) -> (SessionHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let controller = SessionController::new(config, source, saver, clock);
        let task = tokio::spawn(controller.run(rx, shutdown));
        (SessionHandle { tx }, task)
    }

    fn new(
        config: TrailcamConfig,
        source: Arc<FrameSource>,
        saver: SaverHandle,
        clock: Arc<DeviceClock>,
    ) -> Self {
        let detector = MotionDetector::new(&config.detection);
        let sensitivity = Sensitivity::from_config(&config.detection);
        let min_capture_interval = Duration::from_secs(config.detection.min_capture_interval_secs);
        let timelapse_interval = Duration::from_secs(config.session.timelapse_interval_secs);
        let last_capture = clock.now();

        SessionController {
            config,
            source,
            saver,
            clock,
            detector,
            model: BackgroundModel::default(),
            sensitivity,
            mode: SessionMode::Inactive,
            session_started: None,
            last_capture,
            min_capture_interval,
            timelapse_active: false,
            timelapse_interval,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<SessionCommand>, shutdown: CancellationToken) {
        info!("Session controller started");
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                command = rx.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                _ = tick.tick() => self.run_tick().await,
            }
        }

        if self.mode == SessionMode::Video {
            self.source.stop_video_buffer();
        }
        info!("Session controller stopped");
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Start { kind, reply } => {
                let _ = reply.send(self.start_session(kind));
            }
            SessionCommand::Stop { reply } => {
                let _ = reply.send(self.stop_session());
            }
            SessionCommand::SetSensitivity { preset, reply } => {
                let _ = reply.send(self.apply_sensitivity(preset));
            }
            SessionCommand::SetDeviceClock { epoch_secs, reply } => {
                let _ = reply.send(self.clock.set(epoch_secs));
            }
            SessionCommand::SetTimelapse {
                active,
                interval_secs,
                reply,
            } => {
                let _ = reply.send(self.set_timelapse(active, interval_secs));
            }
            SessionCommand::Snapshot { reply } => {
                let _ = reply.send(self.build_snapshot());
            }
            SessionCommand::Status { reply } => {
                let _ = reply.send(self.build_status());
            }
        }
    }

    fn start_session(&mut self, kind: CaptureKind) -> Result<(), SessionError> {
        info!("Starting {} session", kind.as_str());
        self.mode = match kind {
            CaptureKind::Photo => SessionMode::Photo,
            CaptureKind::Video => {
                self.source.start_video_buffer();
                SessionMode::Video
            }
            CaptureKind::Timelapse => {
                self.timelapse_active = true;
                SessionMode::Timelapse
            }
        };
        self.session_started = Some(self.clock.now());
        Ok(())
    }

    fn stop_session(&mut self) -> Result<(), SessionError> {
        info!("Stopping {} session", self.mode.as_str());
        match self.mode {
            SessionMode::Video => self.source.stop_video_buffer(),
            SessionMode::Timelapse => self.timelapse_active = false,
            _ => {}
        }
        self.mode = SessionMode::Inactive;
        self.session_started = None;
        Ok(())
    }

    fn apply_sensitivity(&mut self, preset: SensitivityPreset) -> Result<(), SessionError> {
        self.sensitivity.apply_preset(preset, &self.config.detection);
        info!("Sensitivity preset set to {}", preset.as_str());
        Ok(())
    }

    fn set_timelapse(&mut self, active: bool, interval_secs: u64) -> Result<(), SessionError> {
        if interval_secs == 0 {
            return Err(SessionError::InvalidRequest {
                kind: "timelapse interval must be positive".to_string(),
            });
        }
        self.timelapse_active = active;
        self.timelapse_interval = Duration::from_secs(interval_secs);
        info!(
            "Timelapse {} with {}s interval",
            if active { "enabled" } else { "disabled" },
            interval_secs
        );
        Ok(())
    }

    fn build_snapshot(&self) -> SettingsSnapshot {
        let exposure = self.source.exposure_state();
        SettingsSnapshot {
            rotation: self.source.rotation(),
            exposure_mode: exposure.mode.as_str().to_string(),
            iso: exposure.iso,
            shutter_speed: exposure.shutter_micros,
            sensitivity: self
                .sensitivity
                .tier(&self.config.detection)
                .as_str()
                .to_string(),
            timelapse_active: self.timelapse_active,
            timelapse_interval_secs: self.timelapse_interval.as_secs(),
        }
    }

    fn build_status(&self) -> SessionStatus {
        SessionStatus {
            mode: self.mode,
            started_epoch_secs: self.session_started.map(|started| started.as_secs()),
        }
    }

    async fn run_tick(&mut self) {
        match self.mode {
            SessionMode::Inactive => {}
            SessionMode::Photo | SessionMode::Video => self.motion_tick().await,
            SessionMode::Timelapse => self.timelapse_tick().await,
        }
    }

    async fn motion_tick(&mut self) {
        let Some(frame) = self.source.current_frame() else {
            error!("No frame available for motion detection");
            tokio::time::sleep(MISSING_FRAME_BACKOFF).await;
            return;
        };

        let now = self.clock.now();
        let motion = match self.detector.detect(
            &frame,
            &mut self.model,
            &self.sensitivity,
            self.min_capture_interval,
            self.last_capture,
            now,
        ) {
            Ok(motion) => motion,
            Err(e) => {
                error!("Motion detection failed: {}", e);
                return;
            }
        };

        if !motion {
            return;
        }

        info!("Motion detected in {} session", self.mode.as_str());
        match self.mode {
            SessionMode::Photo => self.capture_photo(&frame, CaptureKind::Photo).await,
            SessionMode::Video => self.capture_video(&frame).await,
            _ => {}
        }
    }

    async fn timelapse_tick(&mut self) {
        let now = self.clock.now();
        let elapsed = now.checked_sub(self.last_capture).unwrap_or(Duration::ZERO);
        if elapsed < self.timelapse_interval {
            return;
        }

        let Some(frame) = self.source.current_frame() else {
            error!("No frame available for timelapse capture");
            tokio::time::sleep(MISSING_FRAME_BACKOFF).await;
            return;
        };

        debug!("Timelapse interval elapsed");
        self.capture_photo(&frame, CaptureKind::Timelapse).await;
    }

    /// Grab a high-res still and persist it with a thumbnail built from
    /// the frame that triggered the capture. The thumbnail is submitted
    /// first so it is on disk before the main artifact.
    async fn capture_photo(&mut self, motion_frame: &Frame, kind: CaptureKind) {
        let timestamp = self.clock.timestamp_string();

        let still = match self.source.capture_high_res().await {
            Ok(still) => still,
            Err(e) => {
                error!("High resolution capture failed: {}", e);
                return;
            }
        };

        match motion_frame.thumbnail(self.config.storage.thumbnail_width) {
            Ok(thumb) => {
                self.saver.save_thumb(thumb, &timestamp, kind).await;
            }
            Err(e) => warn!("Failed to build thumbnail: {}", e),
        }

        if self.saver.save_image(still, &timestamp).await.is_none() {
            warn!("Capture {} was not persisted", timestamp);
        }

        // The interval starts once the save attempt has finished
        self.last_capture = self.clock.now();
    }

    async fn capture_video(&mut self, motion_frame: &Frame) {
        let timestamp = self.clock.timestamp_string();

        match motion_frame.thumbnail(self.config.storage.thumbnail_width) {
            Ok(thumb) => {
                self.saver.save_thumb(thumb, &timestamp, CaptureKind::Video).await;
            }
            Err(e) => warn!("Failed to build thumbnail: {}", e),
        }

        let after = Duration::from_secs(self.config.camera.buffer_seconds_after);
        match self.source.flush_video_buffer(after).await {
            Ok(segment) => {
                if self.saver.save_video(segment, &timestamp).await.is_none() {
                    warn!("Video {} was not persisted", timestamp);
                }
                self.last_capture = self.clock.now();
            }
            Err(e) => error!("Video buffer flush failed: {}", e),
        }
    }
}
