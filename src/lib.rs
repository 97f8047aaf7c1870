pub mod network;
pub mod system;

#[doc(hidden)]
pub use tracing;

pub use network::http::ban::{BanRegistry, BanState};
pub use network::http::blacklist::{Blacklist, BlacklistConfig, BlacklistStats, Thresholds};
pub use system::cache::TtlLruCache;
pub use system::clock::{Clock, ManualClock, SystemClock};

/// Build stamp, `vYYYY.MM.DD.HHMMSS` in UTC.
pub const VERSION: &str = env!("TURNSTILE_BUILD_VERSION");

/// Configure the coroutine runtime used by collection passes and the
/// scheduled collector. Call once, before the first [`Blacklist::start`].
pub fn init_global_poller(num_of_workers: usize, stack_size: usize) {
    may::config()
        .set_workers(num_of_workers)
        .set_stack_size(stack_size);
}
