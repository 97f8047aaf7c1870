//! Per-address traffic statistics and automatic bans.
//!
//! The request path calls [`Blacklist::place_request`] and
//! [`Blacklist::is_banned`]; neither waits on the collector. A scheduled
//! collection pass ([`Blacklist::collect`]) rolls up every address's recent
//! minutes, evaluates [`Verdict`]s and bans or unbans accordingly.
//!
//! Tracked addresses are bounded by [`BlacklistConfig::max_sources`]. When the
//! table is full the least recently seen address is dropped together with its
//! ban; size the table for the expected number of distinct clients.

mod collect;
mod place;
pub mod stats;

pub use collect::{CollectError, Verdict};
pub use stats::{AddressDetail, MinuteStats, PlainStats, SummedStats};

use crate::network::http::ban::{BanRegistry, BanState};
use crate::{s_error, s_info, s_trace, s_warn};
use crate::system::cache::TtlLruCache;
use crate::system::clock::{Clock, SystemClock};
use crate::system::interval::Interval;
use arc_swap::ArcSwap;
use serde::Serialize;
use stats::AddressStats;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Average-per-minute limits; exceeding any of them bans the address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub avg_429: u64,
    pub avg_total: u64,
    pub avg_404: u64,
    pub avg_2xx: u64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            avg_429: 50,
            avg_total: 5000,
            avg_404: 500,
            avg_2xx: 3500,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BlacklistConfig {
    /// Maximum number of tracked addresses, 0 for unbounded.
    pub max_sources: usize,
    /// How long an address is kept after its last request.
    pub source_ttl: Duration,
    /// Number of past minutes that feed the averages.
    pub retention_minutes: u64,
    /// Extra lifetime of a minute bucket past the retention window.
    pub minute_grace_minutes: u64,
    pub collect_interval: Duration,
    /// Addresses processed concurrently by one collection pass.
    pub collect_concurrency: usize,
    /// Length of an automatic ban.
    pub ban_duration: Duration,
    pub thresholds: Thresholds,
}

impl Default for BlacklistConfig {
    fn default() -> Self {
        Self {
            max_sources: 65_536,
            source_ttl: Duration::from_secs(60 * 60),
            retention_minutes: 30,
            minute_grace_minutes: 2,
            collect_interval: Duration::from_secs(60),
            collect_concurrency: 64,
            ban_duration: Duration::from_secs(30 * 60),
            thresholds: Thresholds::default(),
        }
    }
}

impl BlacklistConfig {
    pub fn with_max_sources(mut self, max_sources: usize) -> Self {
        self.max_sources = max_sources;
        self
    }

    pub fn with_source_ttl(mut self, ttl: Duration) -> Self {
        self.source_ttl = ttl;
        self
    }

    pub fn with_retention_minutes(mut self, minutes: u64) -> Self {
        self.retention_minutes = minutes;
        self
    }

    pub fn with_collect_interval(mut self, interval: Duration) -> Self {
        self.collect_interval = interval;
        self
    }

    pub fn with_collect_concurrency(mut self, concurrency: usize) -> Self {
        self.collect_concurrency = concurrency.max(1);
        self
    }

    pub fn with_ban_duration(mut self, duration: Duration) -> Self {
        self.ban_duration = duration;
        self
    }

    pub fn with_thresholds(mut self, thresholds: Thresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Lifetime of a minute bucket.
    #[inline]
    pub(crate) fn minute_ttl(&self) -> Duration {
        Duration::from_secs((self.retention_minutes + self.minute_grace_minutes) * 60)
    }

    /// Every minute inside the retention window must fit.
    #[inline]
    pub(crate) fn max_minutes(&self) -> usize {
        self.retention_minutes as usize + 1
    }
}

/// Output of [`Blacklist::get_stats`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct BlacklistStats {
    /// The last complete collection pass.
    pub aggregated_ip_stats: Arc<HashMap<String, SummedStats>>,
    pub aggregated_ban_list: HashMap<String, String>,
}

pub struct Blacklist {
    config: BlacklistConfig,
    clock: Arc<dyn Clock>,
    sources: TtlLruCache<String, Arc<AddressStats>>,
    registry: Arc<BanRegistry>,
    aggregated: ArcSwap<HashMap<String, SummedStats>>,
    collector: Mutex<Option<Interval>>,
}

impl Blacklist {
    pub fn new(config: BlacklistConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: BlacklistConfig, clock: Arc<dyn Clock>) -> Self {
        let registry = Arc::new(BanRegistry::new());
        let evicted = Arc::clone(&registry);
        let evict_clock = Arc::clone(&clock);

        let sources = TtlLruCache::with_clock(config.max_sources, Arc::clone(&clock))
            .with_on_evicted(move |address: &String, stats: &Arc<AddressStats>| {
                let ban = stats.ban.load();
                if ban.blocked && ban.expires_at >= evict_clock.now_secs() {
                    s_warn!("dropping banned address {address}, its ban is lost");
                } else {
                    s_trace!("dropping address {address}");
                }
                evicted.forget(address);
            });

        Self {
            config,
            clock,
            sources,
            registry,
            aggregated: ArcSwap::from_pointee(HashMap::new()),
            collector: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &BlacklistConfig {
        &self.config
    }

    /// Number of addresses currently tracked.
    pub fn tracked_addresses(&self) -> usize {
        self.sources.size()
    }

    #[inline]
    fn new_address(&self) -> Arc<AddressStats> {
        Arc::new(AddressStats::new(
            self.config.max_minutes(),
            Arc::clone(&self.clock),
        ))
    }

    /// Admission check for the request path. Unknown or empty addresses are
    /// allowed.
    #[inline]
    pub fn is_banned(&self, address: &str) -> bool {
        !address.is_empty() && self.registry.is_banned(address)
    }

    /// Ban (`blocked == true`) or unban `address` for `duration`, regardless of
    /// its traffic. A later collection pass may still ban it again, or extend
    /// the ban while traffic stays over a threshold.
    ///
    /// `is_banned` reflects the change as soon as this returns. An empty
    /// comment keeps the previous one while banning.
    pub fn ban(&self, address: &str, comment: &str, blocked: bool, duration: Duration) {
        if address.is_empty() {
            return;
        }
        let stats = self.sources.touch_or_add_with_ttl(
            address,
            self.config.source_ttl,
            || self.new_address(),
        );
        self.apply_ban(address, &stats, comment, blocked, duration);
    }

    /// How long a banned address must stay tracked: past its expiry by the
    /// bucket grace, so a pass can still see it and lift the ban.
    #[inline]
    fn ban_ttl(&self, duration: Duration) -> Duration {
        duration + Duration::from_secs((self.config.minute_grace_minutes + 1) * 60)
    }

    pub(crate) fn apply_ban(
        &self,
        address: &str,
        stats: &AddressStats,
        comment: &str,
        blocked: bool,
        duration: Duration,
    ) {
        let _transition = stats
            .ban_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let now_secs = self.clock.now_secs();
        let previous = stats.ban.load();
        let comment = match (blocked, comment.is_empty()) {
            (false, _) => String::new(),
            (true, true) => previous.comment.clone(),
            (true, false) => comment.to_owned(),
        };

        let state = BanState {
            blocked,
            comment,
            expires_at: now_secs.saturating_add(duration.as_secs()),
            minute: now_secs / 60,
        };
        if blocked {
            self.sources.extend_ttl(address, self.ban_ttl(duration));
            s_info!(
                "banning {address} until {} ({})",
                state.expires_at,
                state.comment
            );
        } else if previous.blocked {
            s_info!("unbanning {address}");
        }

        self.registry.publish(address, &state.comment, blocked);
        stats.ban.store(Arc::new(state));
    }

    /// Snapshot for reporting endpoints; the per-address stats always come from
    /// one complete collection pass.
    pub fn get_stats(&self) -> BlacklistStats {
        BlacklistStats {
            aggregated_ip_stats: self.aggregated.load_full(),
            aggregated_ban_list: self.registry.ban_list(),
        }
    }

    /// Detailed view of one address without refreshing its recency.
    pub fn peek_address(&self, address: &str) -> Option<AddressDetail> {
        let stats = self.sources.peek(address)?;
        let rollup = stats
            .rollup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let ban = stats.ban_state();

        // anything older has expired or waits for the next pass to purge it
        let oldest = self
            .clock
            .minute_epoch()
            .saturating_sub(self.config.retention_minutes);
        let mut minute_stats = BTreeMap::new();
        stats.minutes.map(|&minute, counters| {
            if minute >= oldest {
                minute_stats.insert(minute * 60, counters.snapshot());
            }
            true
        });

        Some(AddressDetail {
            total: rollup.total,
            average: rollup.average,
            total_period_stats: rollup.total_period,
            average_period_stats: rollup.average_period,
            blocked: ban.blocked,
            comment: ban.comment.clone(),
            block_expires: ban.expires_at,
            minute_stats,
        })
    }

    /// Run [`collect`](Self::collect) every `collect_interval` until
    /// [`stop`](Self::stop) is called or the engine is dropped.
    pub fn start(self: &Arc<Self>) {
        let mut collector = self
            .collector
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if collector.is_some() {
            s_warn!("blacklist collector already running");
            return;
        }

        let weak = Arc::downgrade(self);
        *collector = Some(Interval::start(
            "blacklist-collect",
            self.config.collect_interval,
            move || {
                let Some(blacklist) = weak.upgrade() else {
                    return;
                };
                for err in blacklist.collect() {
                    s_error!("blacklist collect: {err}");
                }
            },
        ));
    }

    /// Stop the scheduled collector, waiting for a running pass to finish.
    pub fn stop(&self) {
        let collector = self
            .collector
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(interval) = collector {
            interval.stop();
        }
    }

    pub fn is_running(&self) -> bool {
        self.collector
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}
