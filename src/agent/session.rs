//! Process-lifetime session clock

use chrono::{DateTime, Utc};
use std::sync::OnceLock;

/// Records the first successful broker connection.
///
/// Set at most once per process; reconnects never reset it, so uptime keeps
/// counting from the first connect.
#[derive(Debug, Default)]
pub struct SessionClock {
    connected_since: OnceLock<DateTime<Utc>>,
}

impl SessionClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if this call set the timestamp
    pub fn mark_connected(&self, at: DateTime<Utc>) -> bool {
        self.connected_since.set(at).is_ok()
    }

    pub fn connected_since(&self) -> Option<DateTime<Utc>> {
        self.connected_since.get().copied()
    }

    pub fn uptime_s(&self, now: DateTime<Utc>) -> u64 {
        self.connected_since()
            .map(|since| (now - since).num_seconds().max(0) as u64)
            .unwrap_or(0)
    }
}
