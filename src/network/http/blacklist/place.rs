use super::Blacklist;
use super::stats::MinuteStats;
use std::sync::Arc;

impl Blacklist {
    /// Count one finished request against `address`.
    ///
    /// Only takes the address table's and the minute table's own locks for a
    /// lookup; the counters themselves are atomics, so this never waits on a
    /// collection pass.
    pub fn place_request(&self, address: &str, status: u16, method: &str) {
        if address.is_empty() {
            return;
        }

        let stats = self
            .sources
            .touch_or_add_with_ttl(address, self.config.source_ttl, || self.new_address());

        // a bucket lives retention + grace from its first request
        let minute = self.clock.minute_epoch();
        let counters = stats.minutes.get_or_add_with_ttl(
            &minute,
            self.config.minute_ttl(),
            || Arc::new(MinuteStats::default()),
        );
        counters.record(status, method);
    }
}
