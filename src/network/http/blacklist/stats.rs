use crate::network::http::ban::BanState;
use crate::system::cache::TtlLruCache;
use crate::system::clock::Clock;
use arc_swap::ArcSwap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::ops::AddAssign;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Counters for one address during one epoch minute.
///
/// Written by the request path without any lock.
#[derive(Debug, Default)]
pub struct MinuteStats {
    code_2xx: AtomicU64,
    code_404: AtomicU64,
    code_429: AtomicU64,
    head: AtomicU64,
    post: AtomicU64,
    total: AtomicU64,
}

impl MinuteStats {
    #[inline]
    pub fn record(&self, status: u16, method: &str) {
        self.total.fetch_add(1, Ordering::Relaxed);
        match status {
            200..=299 => self.code_2xx.fetch_add(1, Ordering::Relaxed),
            404 => self.code_404.fetch_add(1, Ordering::Relaxed),
            429 => self.code_429.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };
        if method.eq_ignore_ascii_case("POST") {
            self.post.fetch_add(1, Ordering::Relaxed);
        } else if method.eq_ignore_ascii_case("HEAD") {
            self.head.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> PlainStats {
        PlainStats {
            code_2xx: self.code_2xx.load(Ordering::Relaxed),
            code_404: self.code_404.load(Ordering::Relaxed),
            code_429: self.code_429.load(Ordering::Relaxed),
            head: self.head.load(Ordering::Relaxed),
            post: self.post.load(Ordering::Relaxed),
            total: self.total.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PlainStats {
    pub code_2xx: u64,
    pub code_404: u64,
    pub code_429: u64,
    pub head: u64,
    pub post: u64,
    pub total: u64,
}

impl PlainStats {
    /// Per-counter integer mean over `minutes`; all zero when `minutes` is zero.
    pub fn per_minute(&self, minutes: u64) -> PlainStats {
        if minutes == 0 {
            return PlainStats::default();
        }
        PlainStats {
            code_2xx: self.code_2xx / minutes,
            code_404: self.code_404 / minutes,
            code_429: self.code_429 / minutes,
            head: self.head / minutes,
            post: self.post / minutes,
            total: self.total / minutes,
        }
    }
}

impl AddAssign for PlainStats {
    fn add_assign(&mut self, rhs: Self) {
        self.code_2xx += rhs.code_2xx;
        self.code_404 += rhs.code_404;
        self.code_429 += rhs.code_429;
        self.head += rhs.head;
        self.post += rhs.post;
        self.total += rhs.total;
    }
}

/// Result of one collection pass for one address.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SummedStats {
    pub total: PlainStats,
    pub average: PlainStats,
    pub minutes_stored: u64,
    /// Start of the earliest retained minute, unix seconds.
    pub first_minute: u64,
    /// Start of the latest retained minute, unix seconds.
    pub last_minute: u64,
}

/// Roll-up owned by the collector; rewritten wholesale on every pass.
#[derive(Debug, Default, Clone)]
pub(crate) struct Rollup {
    pub total_period: PlainStats,
    pub average_period: PlainStats,
    pub total: u64,
    pub average: f64,
}

/// Everything tracked for a single address.
pub struct AddressStats {
    pub(crate) minutes: TtlLruCache<u64, Arc<MinuteStats>>,
    pub(crate) rollup: Mutex<Rollup>,
    pub(crate) ban: ArcSwap<BanState>,
    /// Serializes ban transitions so the registry flag and `ban` always agree.
    pub(crate) ban_lock: Mutex<()>,
}

impl AddressStats {
    pub(crate) fn new(max_minutes: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            minutes: TtlLruCache::with_clock(max_minutes, clock),
            rollup: Mutex::new(Rollup::default()),
            ban: ArcSwap::from_pointee(BanState::default()),
            ban_lock: Mutex::new(()),
        }
    }

    pub fn ban_state(&self) -> Arc<BanState> {
        self.ban.load_full()
    }
}

/// Point-in-time view of one address for debug endpoints.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AddressDetail {
    pub total: u64,
    pub average: f64,
    pub total_period_stats: PlainStats,
    pub average_period_stats: PlainStats,
    pub blocked: bool,
    pub comment: String,
    pub block_expires: u64,
    /// Keyed by the start of each minute, unix seconds.
    pub minute_stats: BTreeMap<u64, PlainStats>,
}
