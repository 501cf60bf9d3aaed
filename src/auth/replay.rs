//! In-memory nonce replay cache.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tracing::debug;

/// Remembers accepted nonces for `window` seconds.
///
/// Eviction and the membership test happen under the same lock as the insert,
/// so two concurrent pushes carrying one nonce cannot both be accepted.
#[derive(Debug)]
pub struct ReplayCache {
    window_secs: i64,
    seen: Mutex<HashMap<String, i64>>,
}

impl ReplayCache {
    pub fn new(window: Duration) -> Self {
        Self {
            window_secs: i64::try_from(window.as_secs()).unwrap_or(i64::MAX),
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Record `nonce` as seen at `now`.  Returns `false` if it was already
    /// present within the window.
    pub fn check_and_insert(&self, nonce: &str, now: i64) -> bool {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());

        let cutoff = now.saturating_sub(self.window_secs);
        let before = seen.len();
        seen.retain(|_, first_seen| *first_seen >= cutoff);
        if seen.len() != before {
            debug!(evicted = before - seen.len(), "evicted stale nonces");
        }

        if seen.contains_key(nonce) {
            return false;
        }
        seen.insert(nonce.to_string(), now);
        true
    }

    /// Whether `nonce` is currently recorded, without recording it.
    pub fn contains(&self, nonce: &str, now: i64) -> bool {
        let seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        let cutoff = now.saturating_sub(self.window_secs);
        seen.get(nonce).is_some_and(|first_seen| *first_seen >= cutoff)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
