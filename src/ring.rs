use crate::frame::Frame;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};
use tracing::{debug, trace};

/// Fixed-capacity ring holding the most recent frames for video flushes.
///
/// One slot per frame, each behind its own short-lived lock so the
/// producer never waits on readers walking the history. The write index
/// counts total pushes; the slot is the index modulo capacity.
pub struct FrameRing {
    slots: Vec<Mutex<Option<Frame>>>,
    write_index: AtomicUsize,
    stats: RingStats,
}

/// Counters for ring activity
#[derive(Debug, Default)]
pub struct RingStats {
    frames_pushed: AtomicU64,
    frames_collected: AtomicU64,
    clears: AtomicU64,
}

/// Point-in-time copy of the ring counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingStatsSnapshot {
    pub frames_pushed: u64,
    pub frames_collected: u64,
    pub clears: u64,
}

impl FrameRing {
    /// Create a ring with the given capacity. A zero capacity is bumped
    /// to one slot so pushes always have somewhere to land.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        debug!(capacity, "frame ring created");
        Self {
            slots: (0..capacity).map(|_| Mutex::new(None)).collect(),
            write_index: AtomicUsize::new(0),
            stats: RingStats::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Store a frame, overwriting the oldest slot once full
    pub fn push(&self, frame: Frame) {
        let index = self.write_index.fetch_add(1, Ordering::Relaxed) % self.capacity();
        trace!(frame_id = frame.id, slot = index, "frame buffered");
        *self.slots[index].lock() = Some(frame);
        self.stats.frames_pushed.fetch_add(1, Ordering::Relaxed);
    }

    /// Most recently pushed frame, if any
    pub fn latest(&self) -> Option<Frame> {
        let count = self.write_index.load(Ordering::Relaxed);
        if count == 0 {
            return None;
        }
        self.slots[(count - 1) % self.capacity()].lock().clone()
    }

    /// Frames captured within the trailing window, oldest first.
    ///
    /// Walks backward from the newest slot and stops at the first frame
    /// older than the window, so a cleared or partially filled ring
    /// yields only what it actually holds.
    pub fn collect_recent(&self, window: Duration) -> Vec<Frame> {
        let count = self.write_index.load(Ordering::Relaxed);
        if count == 0 {
            return Vec::new();
        }

        let cutoff = SystemTime::now()
            .checked_sub(window)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let capacity = self.capacity();
        let available = count.min(capacity);

        let mut frames = Vec::with_capacity(available);
        for back in 0..available {
            let index = (count - 1 - back) % capacity;
            let slot = self.slots[index].lock().clone();
            match slot {
                Some(frame) if frame.timestamp >= cutoff => frames.push(frame),
                _ => break,
            }
        }

        frames.reverse();
        self.stats
            .frames_collected
            .fetch_add(frames.len() as u64, Ordering::Relaxed);
        trace!(count = frames.len(), "frames collected from ring");
        frames
    }

    /// Drop all buffered frames and restart the write index
    pub fn clear(&self) {
        for slot in &self.slots {
            *slot.lock() = None;
        }
        self.write_index.store(0, Ordering::Relaxed);
        self.stats.clears.fetch_add(1, Ordering::Relaxed);
        debug!("frame ring cleared");
    }

    /// Number of occupied slots
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.lock().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats_snapshot(&self) -> RingStatsSnapshot {
        RingStatsSnapshot {
            frames_pushed: self.stats.frames_pushed.load(Ordering::Relaxed),
            frames_collected: self.stats.frames_collected.load(Ordering::Relaxed),
            clears: self.stats.clears.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn test_frame(id: u64) -> Frame {
        Frame::new(id, vec![0u8; 12], 2, 2)
    }

    fn aged_frame(id: u64, age: Duration) -> Frame {
        let mut frame = test_frame(id);
        frame.timestamp = SystemTime::now() - age;
        frame
    }

    #[test]
    fn test_push_wraps_oldest_slot() {
        let ring = FrameRing::new(3);
        assert!(ring.is_empty());

        for id in 0..5 {
            ring.push(test_frame(id));
        }

        assert_eq!(ring.len(), 3);
        assert_eq!(ring.latest().unwrap().id, 4);

        let stats = ring.stats_snapshot();
        assert_eq!(stats.frames_pushed, 5);
    }

    #[test]
    fn test_collect_recent_is_chronological() {
        let ring = FrameRing::new(10);
        for id in 0..6 {
            ring.push(aged_frame(id, Duration::from_millis(600 - id * 100)));
        }

        let frames = ring.collect_recent(Duration::from_secs(5));
        let ids: Vec<u64> = frames.iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_collect_recent_respects_window() {
        let ring = FrameRing::new(10);
        ring.push(aged_frame(0, Duration::from_secs(60)));
        ring.push(aged_frame(1, Duration::from_secs(30)));
        ring.push(aged_frame(2, Duration::from_secs(1)));
        ring.push(aged_frame(3, Duration::from_millis(100)));

        let frames = ring.collect_recent(Duration::from_secs(10));
        let ids: Vec<u64> = frames.iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn test_clear_empties_ring() {
        let ring = FrameRing::new(4);
        for id in 0..4 {
            ring.push(test_frame(id));
        }
        assert_eq!(ring.len(), 4);

        ring.clear();
        assert!(ring.is_empty());
        assert!(ring.latest().is_none());
        assert!(ring.collect_recent(Duration::from_secs(60)).is_empty());
        assert_eq!(ring.stats_snapshot().clears, 1);
    }

    #[test]
    fn test_zero_capacity_is_bumped() {
        let ring = FrameRing::new(0);
        assert_eq!(ring.capacity(), 1);
        ring.push(test_frame(9));
        assert_eq!(ring.latest().unwrap().id, 9);
    }

    #[tokio::test]
    async fn test_concurrent_pushers() {
        let ring = Arc::new(FrameRing::new(64));

        let mut handles = Vec::new();
        for task in 0..4u64 {
            let ring = Arc::clone(&ring);
            handles.push(tokio::spawn(async move {
                for i in 0..100u64 {
                    ring.push(test_frame(task * 1000 + i));
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(ring.stats_snapshot().frames_pushed, 400);
        assert_eq!(ring.len(), 64);
    }
}
