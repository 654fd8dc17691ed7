use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use trailcam::{
    CaptureKind, ConfigWriter, DeviceClock, FrameSource, PersistenceWorker, SessionController,
    SyntheticCamera, SystemDiskUsage, TrailcamConfig,
};
use tracing::{info, Level};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    info!("Starting synthetic session demo");

    // Small frames and a local data directory so the demo runs anywhere
    let mut config = TrailcamConfig::default();
    config.camera.resolution = (320, 240);
    config.camera.md_width = 160;
    config.storage.data_path = "./demo_data".to_string();
    config.storage.photos_path = "./demo_data/photos".to_string();
    config.storage.videos_path = "./demo_data/videos".to_string();

    // Persistence first so captures always have somewhere to land
    let (saver, _saver_task) =
        PersistenceWorker::spawn(config.storage.clone(), Arc::new(SystemDiskUsage)).await?;
    let writer = ConfigWriter::spawn(config.clone(), PathBuf::from("./demo_data/trailcam.toml"));

    // Synthetic device needs no hardware
    let device = Box::new(SyntheticCamera::new(config.camera.clone()));
    let source = Arc::new(FrameSource::new(config.camera.clone(), device, writer));
    source.start();

    let shutdown = CancellationToken::new();
    let (session, _session_task) = SessionController::spawn(
        config,
        Arc::clone(&source),
        saver,
        Arc::new(DeviceClock::new()),
        shutdown.clone(),
    );

    info!("Starting a photo session...");
    session.start_session(CaptureKind::Photo).await?;

    // Watch the acquisition loop for a few seconds
    for i in 1..=5 {
        sleep(Duration::from_secs(1)).await;
        let stats = source.stats_snapshot();
        let status = session.session_status().await?;
        info!(
            "Second {}: {} frames acquired, session mode '{}'",
            i,
            stats.frames_acquired,
            status.mode.as_str()
        );
    }

    let snapshot = session.settings_snapshot().await?;
    info!(
        "Settings: sensitivity '{}', exposure '{}', rotation {}",
        snapshot.sensitivity, snapshot.exposure_mode, snapshot.rotation
    );

    info!("Stopping the session...");
    session.stop_session().await?;

    shutdown.cancel();
    source.stop();

    info!("Synthetic session demo completed");
    Ok(())
}
