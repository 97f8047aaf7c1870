use super::stats::{AddressStats, PlainStats, Rollup, SummedStats};
use super::{Blacklist, Thresholds};
use crate::network::http::ban::BanState;
use crate::s_debug;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    /// A previous holder of the address's roll-up lock panicked. The poison is
    /// cleared, so the next pass recomputes the address from scratch.
    #[error("roll-up of {address} was poisoned")]
    Poisoned { address: String },
}

/// Why an address deserves a ban. Each variant carries the limit it crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Avg429(u64),
    AvgTotal(u64),
    Avg404(u64),
    Avg2xx(u64),
}

impl Verdict {
    /// First matching rule wins, in a fixed order.
    pub fn evaluate(average: &PlainStats, limits: &Thresholds) -> Option<Verdict> {
        if average.code_429 > limits.avg_429 {
            Some(Verdict::Avg429(limits.avg_429))
        } else if average.total > limits.avg_total {
            Some(Verdict::AvgTotal(limits.avg_total))
        } else if average.code_404 > limits.avg_404 {
            Some(Verdict::Avg404(limits.avg_404))
        } else if average.code_2xx > limits.avg_2xx {
            Some(Verdict::Avg2xx(limits.avg_2xx))
        } else {
            None
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Avg429(n) => write!(f, "rate-limit: Avg.429 gt {n}"),
            Verdict::AvgTotal(n) => write!(f, "rate-limit: Avg.Total gt {n}"),
            Verdict::Avg404(n) => write!(f, "rate-limit: Avg.404 gt {n}"),
            Verdict::Avg2xx(n) => write!(f, "rate-limit: Avg.2xx gt {n}"),
        }
    }
}

impl Blacklist {
    /// Run one collection pass over every tracked address and publish the
    /// resulting snapshot.
    ///
    /// Addresses are processed concurrently and independently; an address
    /// that fails is left out of the snapshot and reported in the returned
    /// errors, everything else is still collected.
    pub fn collect(&self) -> Vec<CollectError> {
        let started = Instant::now();
        // expired addresses go through the eviction callback, which clears
        // whatever they still hold in the registry
        let purged = self.sources.purge_expired();
        let minute = self.clock.minute_epoch();
        let collected = Mutex::new(HashMap::with_capacity(self.sources.size()));

        let errors = self
            .sources
            .each(self.config.collect_concurrency, |address, stats| {
                let summed = self.collect_address(address, &stats, minute)?;
                collected
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(address.clone(), summed);
                Ok(())
            });

        let collected = collected
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        s_debug!(
            "collected {} addresses ({} purged, {} errors) in {:?}",
            collected.len(),
            purged,
            errors.len(),
            started.elapsed()
        );
        self.aggregated.store(collected.into());
        errors
    }

    fn collect_address(
        &self,
        address: &str,
        stats: &AddressStats,
        minute: u64,
    ) -> Result<SummedStats, CollectError> {
        let mut rollup = match stats.rollup.lock() {
            Ok(rollup) => rollup,
            Err(_) => {
                stats.rollup.clear_poison();
                return Err(CollectError::Poisoned {
                    address: address.to_owned(),
                });
            }
        };

        let oldest = minute.saturating_sub(self.config.retention_minutes);
        let mut total = PlainStats::default();
        let mut minutes_stored = 0u64;
        let mut first_minute = u64::MAX;
        let mut last_minute = 0u64;

        for key in stats.minutes.keys() {
            if key < oldest {
                stats.minutes.remove(&key);
                continue;
            }
            let Some(counters) = stats.minutes.peek(&key) else {
                continue;
            };
            minutes_stored += 1;
            first_minute = first_minute.min(key);
            last_minute = last_minute.max(key);
            total += counters.snapshot();
        }
        if minutes_stored == 0 {
            first_minute = 0;
        }

        let average = total.per_minute(minutes_stored);
        *rollup = Rollup {
            total_period: total,
            average_period: average,
            total: total.total,
            average: if minutes_stored > 0 {
                total.total as f64 / minutes_stored as f64
            } else {
                0.0
            },
        };

        let verdict = if minutes_stored > 0 {
            Verdict::evaluate(&average, &self.config.thresholds)
        } else {
            None
        };
        let state = stats.ban_state();
        match verdict {
            // nothing newer than the minute we banned on
            Some(_) if state.blocked && state.minute == last_minute => {
                self.check_unban(address, stats, &state, minute)
            }
            Some(verdict) => {
                s_debug!("verdict for {address}: {verdict}");
                self.apply_ban(
                    address,
                    stats,
                    &verdict.to_string(),
                    true,
                    self.config.ban_duration,
                );
            }
            None => self.check_unban(address, stats, &state, minute),
        }

        Ok(SummedStats {
            total,
            average,
            minutes_stored,
            first_minute: first_minute * 60,
            last_minute: last_minute * 60,
        })
    }

    fn check_unban(&self, address: &str, stats: &AddressStats, state: &BanState, minute: u64) {
        if state.blocked && state.expires_at < minute * 60 {
            self.apply_ban(address, stats, "", false, std::time::Duration::ZERO);
        }
    }
}
