//! Cumulative counters, a rolling latency window, and hourly/daily
//! aggregate buckets (§3 Statistics, §4.7).

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use serde::Serialize;

const LATENCY_WINDOW: usize = 100;

#[derive(Default)]
pub struct Stats {
    received: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    latencies: Mutex<VecDeque<Duration>>,
    hourly: Mutex<BTreeMap<DateTime<Utc>, u64>>,
    daily: Mutex<BTreeMap<DateTime<Utc>, u64>>,
}

#[derive(Debug, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub pending: u64,
    pub mean_latency_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct StatsTotals {
    pub received: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_succeeded(&self, latency: Duration) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
        self.push_latency(latency);
        self.bump_bucket(Utc::now());
    }

    pub fn record_failed(&self, latency: Duration) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.push_latency(latency);
    }

    fn push_latency(&self, latency: Duration) {
        let mut window = self.latencies.lock().unwrap();
        window.push_back(latency);
        while window.len() > LATENCY_WINDOW {
            window.pop_front();
        }
    }

    fn bump_bucket(&self, at: DateTime<Utc>) {
        let hour = at.date_naive().and_hms_opt(at.hour(), 0, 0).unwrap().and_utc();
        *self.hourly.lock().unwrap().entry(hour).or_insert(0) += 1;
        let day = at.date_naive().and_hms_opt(0, 0, 0).unwrap().and_utc();
        *self.daily.lock().unwrap().entry(day).or_insert(0) += 1;
    }

    pub fn snapshot(&self, pending: u64) -> StatsSnapshot {
        let window = self.latencies.lock().unwrap();
        let mean_latency_ms = if window.is_empty() {
            0.0
        } else {
            let total: Duration = window.iter().sum();
            total.as_secs_f64() * 1000.0 / window.len() as f64
        };
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            pending,
            mean_latency_ms,
        }
    }

    pub fn totals(&self) -> StatsTotals {
        StatsTotals {
            received: self.received.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    /// Collapses hourly/daily buckets older than `retention_days` (§4.7's
    /// 5-minute aggregation task).
    pub fn prune_buckets(&self, retention_days: i64) {
        let horizon = Utc::now() - chrono::Duration::days(retention_days);
        self.hourly.lock().unwrap().retain(|ts, _| *ts >= horizon);
        self.daily.lock().unwrap().retain(|ts, _| *ts >= horizon);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_satisfy_the_accounting_invariant() {
        let stats = Stats::new();
        stats.record_received();
        stats.record_received();
        stats.record_succeeded(Duration::from_millis(5));
        let snapshot = stats.snapshot(1);
        assert_eq!(snapshot.received, 2);
        assert_eq!(snapshot.succeeded + snapshot.failed + snapshot.pending, snapshot.received);
    }

    #[test]
    fn latency_window_caps_at_100_samples() {
        let stats = Stats::new();
        for _ in 0..150 {
            stats.record_succeeded(Duration::from_millis(1));
        }
        assert_eq!(stats.latencies.lock().unwrap().len(), LATENCY_WINDOW);
    }
}
