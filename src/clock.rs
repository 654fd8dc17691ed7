use crate::error::SessionError;
use chrono::{TimeZone, Utc};
use parking_lot::RwLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::info;

/// Epoch seconds at or below this value are rejected by `set`
pub const EPOCH_FLOOR: i64 = 1_580_317_004;

#[derive(Debug)]
struct ClockAnchor {
    /// Epoch supplied by the client at anchor time
    device_epoch: Duration,
    /// Monotonic instant the anchor was established
    anchored_at: Instant,
}

/// Wall clock with an optional externally supplied epoch override.
///
/// Devices without a battery-backed clock boot with a bogus date, so a
/// client may supply the real time once. All capture timestamps and
/// interval arithmetic go through this clock. The override can be set at
/// most once per process and never regresses.
#[derive(Debug, Default)]
pub struct DeviceClock {
    anchor: RwLock<Option<ClockAnchor>>,
}

impl DeviceClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Anchor the clock to the supplied epoch seconds. Fails if already
    /// anchored or if the value is at or below the plausibility floor.
    pub fn set(&self, epoch_secs: i64) -> std::result::Result<(), SessionError> {
        let mut anchor = self.anchor.write();
        if anchor.is_some() {
            return Err(SessionError::ClockAlreadySet);
        }
        if epoch_secs <= EPOCH_FLOOR {
            return Err(SessionError::ClockOutOfRange { epoch: epoch_secs });
        }

        info!(epoch_secs, "device clock anchored");
        *anchor = Some(ClockAnchor {
            device_epoch: Duration::from_secs(epoch_secs as u64),
            anchored_at: Instant::now(),
        });
        Ok(())
    }

    pub fn is_set(&self) -> bool {
        self.anchor.read().is_some()
    }

    /// Current time as seconds since the epoch, honoring the override
    pub fn now(&self) -> Duration {
        match self.anchor.read().as_ref() {
            Some(anchor) => anchor.device_epoch + anchor.anchored_at.elapsed(),
            None => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or(Duration::ZERO),
        }
    }

    /// Current time formatted for artifact filenames, UTC
    pub fn timestamp_string(&self) -> String {
        let secs = self.now().as_secs() as i64;
        Utc.timestamp_opt(secs, 0)
            .single()
            .map(|dt| dt.format("%Y-%m-%d-%H-%M-%S").to_string())
            .unwrap_or_else(|| secs.to_string())
    }
}
