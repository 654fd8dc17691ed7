use crate::camera::open_device;
use crate::clock::DeviceClock;
use crate::config::{ConfigWriter, TrailcamConfig};
use crate::error::{Result, TrailcamError};
use crate::saver::{PersistenceWorker, SaverHandle, SystemDiskUsage};
use crate::session::{SessionController, SessionHandle};
use crate::source::FrameSource;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const FRAME_STARTUP_TIMEOUT: Duration = Duration::from_secs(5);
const COMPONENT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// System shutdown reason
#[derive(Debug, Clone)]
pub enum ShutdownReason {
    Signal(String),
    UserRequest,
}

/// Main application coordinator that wires the capture pipeline
/// together and manages its lifecycle
pub struct TrailcamOrchestrator {
    config: TrailcamConfig,
    config_path: PathBuf,
    clock: Arc<DeviceClock>,

    // Components
    source: Option<Arc<FrameSource>>,
    saver: Option<SaverHandle>,
    saver_task: Option<JoinHandle<()>>,
    session: Option<SessionHandle>,
    session_task: Option<JoinHandle<()>>,

    // Lifecycle management
    shutdown_sender: Arc<Mutex<Option<oneshot::Sender<ShutdownReason>>>>,
    shutdown_receiver: Option<oneshot::Receiver<ShutdownReason>>,
    cancellation_token: CancellationToken,
}

impl TrailcamOrchestrator {
    pub fn new(config: TrailcamConfig, config_path: PathBuf) -> Self {
        let (shutdown_sender, shutdown_receiver) = oneshot::channel();

        TrailcamOrchestrator {
            config,
            config_path,
            clock: Arc::new(DeviceClock::new()),
            source: None,
            saver: None,
            saver_task: None,
            session: None,
            session_task: None,
            shutdown_sender: Arc::new(Mutex::new(Some(shutdown_sender))),
            shutdown_receiver: Some(shutdown_receiver),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Start all system components in dependency order
    pub async fn start(&mut self) -> Result<()> {
        info!("Starting trailcam system");

        // Persistence first so captures always have somewhere to land
        let (saver, saver_task) =
            PersistenceWorker::spawn(self.config.storage.clone(), Arc::new(SystemDiskUsage))
                .await?;

        let config_writer = ConfigWriter::spawn(self.config.clone(), self.config_path.clone());

        let device = open_device(&self.config.camera);
        let source = Arc::new(FrameSource::new(
            self.config.camera.clone(),
            device,
            config_writer,
        ));
        source.start();
        wait_for_frames(&source, FRAME_STARTUP_TIMEOUT).await?;
        info!("Frame source started successfully");

        let (session, session_task) = SessionController::spawn(
            self.config.clone(),
            Arc::clone(&source),
            saver.clone(),
            Arc::clone(&self.clock),
            self.cancellation_token.child_token(),
        );

        self.saver = Some(saver);
        self.saver_task = Some(saver_task);
        self.source = Some(source);
        self.session = Some(session);
        self.session_task = Some(session_task);

        info!("Trailcam system started");
        Ok(())
    }

    /// Handle to the session controller, for embedding callers
    pub fn session(&self) -> Option<SessionHandle> {
        self.session.clone()
    }

    /// Shared frame source, for embedding callers
    pub fn source(&self) -> Option<Arc<FrameSource>> {
        self.source.clone()
    }

    pub fn saver(&self) -> Option<SaverHandle> {
        self.saver.clone()
    }

    pub fn clock(&self) -> Arc<DeviceClock> {
        Arc::clone(&self.clock)
    }

    /// Ask a running orchestrator to shut down
    pub async fn request_stop(&self) {
        if let Some(sender) = self.shutdown_sender.lock().await.take() {
            let _ = sender.send(ShutdownReason::UserRequest);
        }
    }

    /// Run the main application loop with signal handling
    pub async fn run(&mut self) -> Result<i32> {
        info!("Trailcam system is running");

        let shutdown_receiver = self
            .shutdown_receiver
            .take()
            .ok_or_else(|| TrailcamError::system("Shutdown receiver already taken"))?;

        self.setup_signal_handlers();

        let shutdown_reason = shutdown_receiver
            .await
            .map_err(|_| TrailcamError::system("Shutdown channel closed unexpectedly"))?;

        info!("Shutdown initiated: {:?}", shutdown_reason);

        let exit_code = self.shutdown().await?;

        info!("Trailcam system shutdown complete");
        Ok(exit_code)
    }

    /// Set up signal handlers for graceful shutdown
    fn setup_signal_handlers(&self) {
        // Handle SIGTERM (systemd stop) - Unix only
        #[cfg(unix)]
        {
            let shutdown_sender_sigterm = Arc::clone(&self.shutdown_sender);
            tokio::spawn(async move {
                if signal::unix::signal(signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM handler")
                    .recv()
                    .await
                    .is_some()
                {
                    info!("Received SIGTERM signal");
                    if let Some(sender) = shutdown_sender_sigterm.lock().await.take() {
                        let _ = sender.send(ShutdownReason::Signal("SIGTERM".to_string()));
                    }
                }
            });
        }

        // Handle SIGINT (Ctrl+C) - Cross-platform
        let shutdown_sender_sigint = Arc::clone(&self.shutdown_sender);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received SIGINT signal (Ctrl+C)");
                if let Some(sender) = shutdown_sender_sigint.lock().await.take() {
                    let _ = sender.send(ShutdownReason::Signal("SIGINT".to_string()));
                }
            }
        });
    }

    /// Perform graceful shutdown of all components in reverse order
    async fn shutdown(&mut self) -> Result<i32> {
        info!("Beginning graceful shutdown");

        self.cancellation_token.cancel();

        let mut exit_code = 0;

        // Session controller goes first so no new captures are started
        self.session = None;
        if let Some(task) = self.session_task.take() {
            match timeout(COMPONENT_STOP_TIMEOUT, task).await {
                Ok(Ok(())) => info!("Session controller stopped"),
                Ok(Err(e)) => {
                    error!("Session controller task failed: {}", e);
                    exit_code = 1;
                }
                Err(_) => {
                    error!("Session controller stop timeout");
                    exit_code = 1;
                }
            }
        }

        if let Some(source) = self.source.take() {
            let stopped = tokio::task::spawn_blocking(move || source.stop()).await;
            if stopped.is_err() {
                error!("Frame source stop failed");
                exit_code = 1;
            } else {
                info!("Frame source stopped");
            }
        }

        // Dropping the last handle closes the queue; the worker drains
        // what is left before finishing
        self.saver = None;
        if let Some(task) = self.saver_task.take() {
            match timeout(COMPONENT_STOP_TIMEOUT, task).await {
                Ok(Ok(())) => info!("Persistence worker stopped"),
                Ok(Err(e)) => {
                    error!("Persistence worker task failed: {}", e);
                    exit_code = 1;
                }
                Err(_) => {
                    error!("Persistence worker stop timeout");
                    exit_code = 1;
                }
            }
        }

        info!("Graceful shutdown completed with exit code: {}", exit_code);
        Ok(exit_code)
    }
}

async fn wait_for_frames(source: &FrameSource, startup_timeout: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + startup_timeout;
    while tokio::time::Instant::now() < deadline {
        if source.current_frame().is_some() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    Err(TrailcamError::component(
        "camera",
        "No frames produced within the startup window",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_config(dir: &TempDir) -> TrailcamConfig {
        let mut config = TrailcamConfig::default();
        config.camera.resolution = (64, 48);
        config.camera.md_width = 32;
        config.camera.fps = 50;
        config.storage.data_path = dir.path().to_string_lossy().to_string();
        config.storage.photos_path = dir.path().join("photos").to_string_lossy().to_string();
        config.storage.videos_path = dir.path().join("videos").to_string_lossy().to_string();
        config
    }

    #[tokio::test]
    async fn test_start_wires_components() {
        let dir = TempDir::new().unwrap();
        let config = create_test_config(&dir);
        let mut orchestrator =
            TrailcamOrchestrator::new(config, dir.path().join("trailcam.toml"));

        orchestrator.start().await.unwrap();

        assert!(orchestrator.source().unwrap().current_frame().is_some());
        let session = orchestrator.session().unwrap();
        let status = session.session_status().await.unwrap();
        assert_eq!(status.mode, crate::session::SessionMode::Inactive);

        orchestrator.request_stop().await;
        let code = orchestrator.run().await.unwrap();
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn test_run_exits_cleanly_on_stop_request() {
        let dir = TempDir::new().unwrap();
        let config = create_test_config(&dir);
        let mut orchestrator =
            TrailcamOrchestrator::new(config, dir.path().join("trailcam.toml"));

        orchestrator.start().await.unwrap();
        orchestrator.request_stop().await;

        let code = orchestrator.run().await.unwrap();
        assert_eq!(code, 0);
        assert!(orchestrator.session().is_none());
        assert!(orchestrator.source().is_none());
    }
}
