//! Persistence backends for Agentry.
//!
//! Both backends implement `agentry_core::ChatStore`. Creation timestamps
//! are strictly increasing per process so "created before" filters never
//! confuse two records written in the same instant.

pub mod in_memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use in_memory::InMemoryStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

use chrono::{DateTime, Duration, Utc};
use std::sync::Mutex;

/// Hands out timestamps that never repeat or go backwards.
#[derive(Debug, Default)]
pub(crate) struct MonotonicClock {
    last: Mutex<Option<DateTime<Utc>>>,
}

impl MonotonicClock {
    pub(crate) fn now(&self) -> DateTime<Utc> {
        // microsecond resolution matches what the SQLite backend stores
        let now = truncate_micros(Utc::now());
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let next = match *last {
            Some(prev) if now <= prev => prev + Duration::microseconds(1),
            _ => now,
        };
        *last = Some(next);
        next
    }
}

pub(crate) fn truncate_micros(t: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(t.timestamp_micros()).unwrap_or(t)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_strictly_increasing() {
        let clock = MonotonicClock::default();
        let mut prev = clock.now();
        for _ in 0..1000 {
            let next = clock.now();
            assert!(next > prev);
            prev = next;
        }
    }
}
