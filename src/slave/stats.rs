use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Request counters, updated without the table lock.
///
/// A snapshot may be slightly out of step with the tables it was taken
/// alongside.
#[derive(Debug)]
pub struct Stats {
    requests_handled: AtomicU64,
    errors: AtomicU64,
    identity_errors: AtomicU64,
    address_errors: AtomicU64,
    start_time: DateTime<Utc>,
    started: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub requests_handled: u64,
    pub errors: u64,
    pub identity_errors: u64,
    pub address_errors: u64,
    pub start_time: DateTime<Utc>,
    pub uptime: Duration,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            requests_handled: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            identity_errors: AtomicU64::new(0),
            address_errors: AtomicU64::new(0),
            start_time: Utc::now(),
            started: Instant::now(),
        }
    }

    pub fn record_request(&self) {
        self.requests_handled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_identity_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        self.identity_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_address_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        self.address_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests_handled: self.requests_handled.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            identity_errors: self.identity_errors.load(Ordering::Relaxed),
            address_errors: self.address_errors.load(Ordering::Relaxed),
            start_time: self.start_time,
            uptime: self.started.elapsed(),
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_are_counted_per_kind_and_in_aggregate() {
        let stats = Stats::new();
        stats.record_request();
        stats.record_request();
        stats.record_identity_error();
        stats.record_address_error();
        stats.record_address_error();

        let snap = stats.snapshot();
        assert_eq!(snap.requests_handled, 2);
        assert_eq!(snap.errors, 3);
        assert_eq!(snap.identity_errors, 1);
        assert_eq!(snap.address_errors, 2);
    }

    #[test]
    fn start_time_is_fixed() {
        let stats = Stats::new();
        let first = stats.snapshot();
        stats.record_request();
        assert_eq!(stats.snapshot().start_time, first.start_time);
    }
}
