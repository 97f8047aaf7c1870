use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Ban state of one address. Always replaced as a whole, never mutated in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BanState {
    pub blocked: bool,
    pub comment: String,
    /// Unix seconds.
    pub expires_at: u64,
    /// Epoch minute at which the ban was last (re)applied.
    pub minute: u64,
}

/// Authoritative blocked/allowed flags plus the human readable ban list.
///
/// The flag map is what the request path reads; the list is only for
/// reporting and sits behind its own lock.
#[derive(Debug, Default)]
pub struct BanRegistry {
    banned: DashMap<String, bool>,
    ban_list: Mutex<HashMap<String, String>>,
}

impl BanRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_banned(&self, address: &str) -> bool {
        self.banned.get(address).is_some_and(|blocked| *blocked)
    }

    /// Flag first, so `is_banned` reflects the change as soon as this returns.
    pub fn publish(&self, address: &str, comment: &str, blocked: bool) {
        self.banned.insert(address.to_owned(), blocked);

        let mut list = self.ban_list.lock().unwrap_or_else(PoisonError::into_inner);
        if blocked {
            list.insert(address.to_owned(), comment.to_owned());
        } else {
            list.remove(address);
        }
    }

    /// Drop everything known about `address`.
    pub fn forget(&self, address: &str) {
        self.banned.remove(address);
        self.ban_list
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(address);
    }

    pub fn ban_list(&self) -> HashMap<String, String> {
        self.ban_list
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of addresses currently blocked.
    pub fn banned_count(&self) -> usize {
        self.banned.iter().filter(|entry| *entry.value()).count()
    }
}
