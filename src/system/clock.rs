use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Time source shared by the caches and the blacklist engine.
///
/// All values are relative to the unix epoch.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;

    #[inline]
    fn now_secs(&self) -> u64 {
        self.now_ms() / 1_000
    }

    /// `floor(now / 60)`, the bucketing key of the per-minute statistics.
    #[inline]
    fn minute_epoch(&self) -> u64 {
        self.now_secs() / 60
    }
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(now_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(now_ms),
        }
    }

    /// Start at the beginning of the given epoch minute.
    pub fn at_minute(minute: u64) -> Self {
        Self::new(minute * 60_000)
    }

    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    #[inline]
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}
