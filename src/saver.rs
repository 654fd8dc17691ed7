use crate::config::StorageConfig;
use crate::error::StorageError;
use crate::frame::{CaptureKind, Frame, VideoSegment};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use sysinfo::Disks;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Refuse image and video writes at or above this disk usage
const STORAGE_CEILING_PERCENT: f64 = 99.0;

/// Pending save jobs the worker will accept before submissions wait
const QUEUE_DEPTH: usize = 8;

/// Disk usage probe, swappable in tests
pub trait DiskUsage: Send + Sync {
    /// Percentage used of the volume holding `path`
    fn usage_percent(&self, path: &Path) -> f64;
}

/// Probe backed by the operating system's mounted disk list
pub struct SystemDiskUsage;

impl DiskUsage for SystemDiskUsage {
    fn usage_percent(&self, path: &Path) -> f64 {
        let resolved = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let disks = Disks::new_with_refreshed_list();

        // Longest mount point containing the path wins
        let mut best: Option<(usize, u64, u64)> = None;
        for disk in disks.list() {
            if !resolved.starts_with(disk.mount_point()) {
                continue;
            }
            let depth = disk.mount_point().as_os_str().len();
            if best.map_or(true, |(best_depth, _, _)| depth > best_depth) {
                best = Some((depth, disk.total_space(), disk.available_space()));
            }
        }

        match best {
            Some((_, total, available)) if total > 0 => {
                let used = total - available;
                (used as f64 / total as f64) * 100.0
            }
            _ => {
                warn!("No disk found for {:?}, reporting 0% usage", resolved);
                0.0
            }
        }
    }
}

enum SaveJob {
    Image {
        frame: Frame,
        timestamp: String,
        reply: oneshot::Sender<Option<String>>,
    },
    Thumb {
        frame: Frame,
        timestamp: String,
        kind: CaptureKind,
        reply: oneshot::Sender<Option<String>>,
    },
    Video {
        segment: VideoSegment,
        timestamp: String,
        reply: oneshot::Sender<Option<String>>,
    },
}

/// Submission side of the persistence queue.
///
/// The disk ceiling is enforced here, before a job is accepted, so a
/// full disk rejects work immediately instead of queueing it. Jobs are
/// processed in submission order by a single worker.
#[derive(Clone)]
pub struct SaverHandle {
    tx: mpsc::Sender<SaveJob>,
    disk: Arc<dyn DiskUsage>,
    config: StorageConfig,
}

impl SaverHandle {
    /// Persist a full-resolution capture as `{timestamp}.jpg` in the
    /// photos directory. Returns the filename, or nothing when the disk
    /// is at the ceiling or the write failed.
    pub async fn save_image(&self, frame: Frame, timestamp: &str) -> Option<String> {
        if let Err(e) = self.ensure_headroom(&self.config.photos_path) {
            warn!("{}, dropping image {}", e, timestamp);
            return None;
        }

        self.submit(|reply| SaveJob::Image {
            frame,
            timestamp: timestamp.to_string(),
            reply,
        })
        .await
    }

    /// Persist a thumbnail as `thumb_{timestamp}.jpg`. Photo and
    /// timelapse thumbnails go to the photos directory, video
    /// thumbnails next to the videos. Thumbnails are small enough that
    /// the disk ceiling is not consulted.
    pub async fn save_thumb(
        &self,
        frame: Frame,
        timestamp: &str,
        kind: CaptureKind,
    ) -> Option<String> {
        self.submit(|reply| SaveJob::Thumb {
            frame,
            timestamp: timestamp.to_string(),
            kind,
            reply,
        })
        .await
    }

    /// Persist a flushed segment as `{timestamp}.mp4` in the videos
    /// directory, remuxing through an external encoder process.
    pub async fn save_video(&self, segment: VideoSegment, timestamp: &str) -> Option<String> {
        if let Err(e) = self.ensure_headroom(&self.config.videos_path) {
            warn!("{}, dropping video {}", e, timestamp);
            return None;
        }

        self.submit(|reply| SaveJob::Video {
            segment,
            timestamp: timestamp.to_string(),
            reply,
        })
        .await
    }

    /// Current usage percentage of the data volume
    pub fn check_storage(&self) -> f64 {
        let percent = self.disk.usage_percent(Path::new(&self.config.data_path));
        debug!("Storage usage at {:.1}%", percent);
        percent
    }

    fn ensure_headroom(&self, dir: &str) -> Result<(), StorageError> {
        let percent = self.disk.usage_percent(Path::new(dir));
        if percent >= STORAGE_CEILING_PERCENT {
            return Err(StorageError::Exhausted { percent });
        }
        Ok(())
    }

    async fn submit<F>(&self, job: F) -> Option<String>
    where
        F: FnOnce(oneshot::Sender<Option<String>>) -> SaveJob,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(job(reply_tx)).await.is_err() {
            error!("{}, save dropped", StorageError::WorkerGone);
            return None;
        }

        match reply_rx.await {
            Ok(result) => result,
            Err(_) => {
                error!("{}, save reply lost", StorageError::WorkerGone);
                None
            }
        }
    }
}

/// Background writer draining the save queue in order
pub struct PersistenceWorker {
    config: StorageConfig,
}

impl PersistenceWorker {
    /// Ensure the artifact directories exist and start the worker. The
    /// returned task finishes once every handle is dropped and the
    /// remaining queue has drained.
    pub async fn spawn(
        config: StorageConfig,
        disk: Arc<dyn DiskUsage>,
    ) -> Result<(SaverHandle, JoinHandle<()>), StorageError> {
        ensure_directory(Path::new(&config.data_path)).await?;
        ensure_directory(Path::new(&config.photos_path)).await?;
        ensure_directory(Path::new(&config.videos_path)).await?;

        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let worker = PersistenceWorker {
            config: config.clone(),
        };
        let task = tokio::spawn(worker.run(rx));

        Ok((SaverHandle { tx, disk, config }, task))
    }

    async fn run(self, mut rx: mpsc::Receiver<SaveJob>) {
        info!("Persistence worker started");
        while let Some(job) = rx.recv().await {
            self.handle_job(job).await;
        }
        debug!("Persistence worker stopped");
    }

    async fn handle_job(&self, job: SaveJob) {
        match job {
            SaveJob::Image {
                frame,
                timestamp,
                reply,
            } => {
                let filename = format!("{}.jpg", timestamp);
                let path = Path::new(&self.config.photos_path).join(&filename);
                let result = match self.write_jpeg(&frame, &path).await {
                    Ok(()) => {
                        info!("Saved image {}", filename);
                        Some(filename)
                    }
                    Err(e) => {
                        error!("Failed to save image {}: {}", filename, e);
                        None
                    }
                };
                let _ = reply.send(result);
            }
            SaveJob::Thumb {
                frame,
                timestamp,
                kind,
                reply,
            } => {
                let filename = format!("thumb_{}.jpg", timestamp);
                let dir = if kind.is_photo_like() {
                    &self.config.photos_path
                } else {
                    &self.config.videos_path
                };
                let path = Path::new(dir).join(&filename);
                let result = match self.write_jpeg(&frame, &path).await {
                    Ok(()) => {
                        debug!("Saved thumbnail {}", filename);
                        Some(filename)
                    }
                    Err(e) => {
                        error!("Failed to save thumbnail {}: {}", filename, e);
                        None
                    }
                };
                let _ = reply.send(result);
            }
            SaveJob::Video {
                segment,
                timestamp,
                reply,
            } => {
                let result = match self.write_video(&segment, &timestamp).await {
                    Ok(filename) => {
                        info!("Saved video {}", filename);
                        Some(filename)
                    }
                    Err(e) => {
                        error!("Failed to save video {}: {}", timestamp, e);
                        None
                    }
                };
                let _ = reply.send(result);
            }
        }
    }

    async fn write_jpeg(&self, frame: &Frame, path: &Path) -> Result<(), StorageError> {
        let jpeg = frame.encode_jpeg()?;
        tokio::fs::write(path, jpeg)
            .await
            .map_err(|e| StorageError::Write {
                path: path.to_string_lossy().to_string(),
                source: e,
            })
    }

    /// Write the raw stream, remux it into a playable container, then
    /// drop the intermediate
    async fn write_video(
        &self,
        segment: &VideoSegment,
        timestamp: &str,
    ) -> Result<String, StorageError> {
        if segment.is_empty() {
            return Err(StorageError::Encode {
                details: "video segment is empty".to_string(),
            });
        }

        let videos_dir = Path::new(&self.config.videos_path);
        let raw_path = videos_dir.join(format!("{}.mjpeg", timestamp));
        let output_name = format!("{}.mp4", timestamp);
        let output_path = videos_dir.join(&output_name);

        let mut raw = Vec::new();
        for frame in &segment.frames {
            raw.extend_from_slice(&frame.encode_jpeg()?);
        }

        tokio::fs::write(&raw_path, raw)
            .await
            .map_err(|e| StorageError::Write {
                path: raw_path.to_string_lossy().to_string(),
                source: e,
            })?;

        debug!(
            frames = segment.frame_count(),
            rate = segment.frame_rate,
            "remuxing video segment"
        );

        let frame_rate = segment.frame_rate.to_string();
        let raw_arg = raw_path.to_string_lossy().to_string();
        let output = Command::new("ffmpeg")
            .args([
                "-y",
                "-f",
                "mjpeg",
                "-framerate",
                frame_rate.as_str(),
                "-i",
                raw_arg.as_str(),
                "-c:v",
                "copy",
            ])
            .arg(&output_path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .await
            .map_err(|e| StorageError::Remux {
                details: format!("failed to run ffmpeg: {}", e),
            })?;

        if !output.status.success() {
            return Err(StorageError::Remux {
                details: format!("ffmpeg exited with {}", output.status),
            });
        }

        if let Err(e) = tokio::fs::remove_file(&raw_path).await {
            warn!("Failed to remove intermediate {:?}: {}", raw_path, e);
        }

        Ok(output_name)
    }
}

async fn ensure_directory(path: &Path) -> Result<(), StorageError> {
    match tokio::fs::metadata(path).await {
        Ok(_) => Ok(()),
        Err(_) => {
            warn!("Directory {:?} missing, creating it", path);
            tokio::fs::create_dir_all(path)
                .await
                .map_err(|e| StorageError::DirectoryCreation {
                    path: path.to_string_lossy().to_string(),
                    source: e,
                })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Fixed-percentage probe
    struct StubDisk(f64);

    impl DiskUsage for StubDisk {
        fn usage_percent(&self, _path: &Path) -> f64 {
            self.0
        }
    }

    fn create_test_storage(dir: &TempDir) -> StorageConfig {
        StorageConfig {
            data_path: dir.path().to_string_lossy().to_string(),
            photos_path: dir.path().join("photos").to_string_lossy().to_string(),
            videos_path: dir.path().join("videos").to_string_lossy().to_string(),
            thumbnail_width: 64,
        }
    }

    fn test_frame() -> Frame {
        Frame::new(1, vec![40u8; 16 * 16 * 3], 16, 16)
    }

    async fn spawn_with_disk(dir: &TempDir, percent: f64) -> SaverHandle {
        let (saver, _) =
            PersistenceWorker::spawn(create_test_storage(dir), Arc::new(StubDisk(percent)))
                .await
                .unwrap();
        saver
    }

    #[tokio::test]
    async fn test_directories_created_on_spawn() {
        let dir = TempDir::new().unwrap();
        let _saver = spawn_with_disk(&dir, 10.0).await;

        assert!(dir.path().join("photos").is_dir());
        assert!(dir.path().join("videos").is_dir());
    }

    #[tokio::test]
    async fn test_save_image_writes_jpeg() {
        let dir = TempDir::new().unwrap();
        let saver = spawn_with_disk(&dir, 50.0).await;

        let filename = saver
            .save_image(test_frame(), "2021-06-01-12-00-00")
            .await
            .unwrap();
        assert_eq!(filename, "2021-06-01-12-00-00.jpg");

        let written = std::fs::read(dir.path().join("photos").join(&filename)).unwrap();
        assert_eq!(&written[0..2], &[0xFF, 0xD8]);
    }

    #[tokio::test]
    async fn test_save_image_refused_at_ceiling() {
        let dir = TempDir::new().unwrap();
        let saver = spawn_with_disk(&dir, 99.0).await;

        let result = saver.save_image(test_frame(), "2021-06-01-12-00-00").await;
        assert!(result.is_none());

        // Nothing may be written when the save is refused
        let entries: Vec<_> = std::fs::read_dir(dir.path().join("photos"))
            .unwrap()
            .collect();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_thumbnails_skip_ceiling_and_route_by_kind() {
        let dir = TempDir::new().unwrap();
        let saver = spawn_with_disk(&dir, 100.0).await;

        let photo_thumb = saver
            .save_thumb(test_frame(), "2021-06-01-12-00-00", CaptureKind::Photo)
            .await
            .unwrap();
        assert!(dir.path().join("photos").join(&photo_thumb).is_file());

        let lapse_thumb = saver
            .save_thumb(test_frame(), "2021-06-01-12-00-01", CaptureKind::Timelapse)
            .await
            .unwrap();
        assert!(dir.path().join("photos").join(&lapse_thumb).is_file());

        let video_thumb = saver
            .save_thumb(test_frame(), "2021-06-01-12-00-02", CaptureKind::Video)
            .await
            .unwrap();
        assert_eq!(video_thumb, "thumb_2021-06-01-12-00-02.jpg");
        assert!(dir.path().join("videos").join(&video_thumb).is_file());
    }

    #[tokio::test]
    async fn test_save_video_refused_at_ceiling() {
        let dir = TempDir::new().unwrap();
        let saver = spawn_with_disk(&dir, 99.5).await;

        let segment = VideoSegment::new(vec![test_frame()], 30);
        let result = saver.save_video(segment, "2021-06-01-12-00-00").await;
        assert!(result.is_none());

        let entries: Vec<_> = std::fs::read_dir(dir.path().join("videos"))
            .unwrap()
            .collect();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_empty_segment_saves_nothing() {
        let dir = TempDir::new().unwrap();
        let saver = spawn_with_disk(&dir, 10.0).await;

        let segment = VideoSegment::new(Vec::new(), 30);
        let result = saver.save_video(segment, "2021-06-01-12-00-00").await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_check_storage_reports_probe_value() {
        let dir = TempDir::new().unwrap();
        let saver = spawn_with_disk(&dir, 42.5).await;
        assert!((saver.check_storage() - 42.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_submissions_complete_in_order() {
        let dir = TempDir::new().unwrap();
        let saver = spawn_with_disk(&dir, 10.0).await;

        let thumb = saver
            .save_thumb(test_frame(), "2021-06-01-12-00-00", CaptureKind::Photo)
            .await;
        let image = saver.save_image(test_frame(), "2021-06-01-12-00-00").await;

        assert_eq!(thumb.unwrap(), "thumb_2021-06-01-12-00-00.jpg");
        assert_eq!(image.unwrap(), "2021-06-01-12-00-00.jpg");
        assert!(dir
            .path()
            .join("photos")
            .join("thumb_2021-06-01-12-00-00.jpg")
            .is_file());
    }
}
