//! Per-source-address sliding-window admission gate (§4.5).

use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;

const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
struct Bucket {
    http: Vec<Instant>,
    control: Vec<Instant>,
}

/// Tracks, per source address, the trailing-minute count of HTTP
/// admissions and control-channel upgrades.
pub struct RateLimitGate {
    buckets: DashMap<IpAddr, Bucket>,
    max_requests_per_minute: usize,
    max_connections_per_ip: usize,
    enabled: bool,
}

impl RateLimitGate {
    pub fn new(enabled: bool, max_requests_per_minute: usize, max_connections_per_ip: usize) -> Self {
        Self {
            buckets: DashMap::new(),
            max_requests_per_minute,
            max_connections_per_ip,
            enabled,
        }
    }

    /// Returns `true` if the HTTP request from `addr` is admitted, recording
    /// it in the window as a side effect.
    pub fn check_http(&self, addr: IpAddr) -> bool {
        if !self.enabled {
            return true;
        }
        let now = Instant::now();
        let mut bucket = self.buckets.entry(addr).or_default();
        prune(&mut bucket.http, now);
        if bucket.http.len() >= self.max_requests_per_minute {
            return false;
        }
        bucket.http.push(now);
        true
    }

    /// Returns `true` if a control-channel upgrade from `addr` is admitted.
    pub fn check_control(&self, addr: IpAddr) -> bool {
        if !self.enabled {
            return true;
        }
        let now = Instant::now();
        let mut bucket = self.buckets.entry(addr).or_default();
        prune(&mut bucket.control, now);
        if bucket.control.len() >= self.max_connections_per_ip {
            return false;
        }
        bucket.control.push(now);
        true
    }

    /// Drops buckets whose windows are both empty, bounding tracker size.
    pub fn prune_idle(&self) {
        let now = Instant::now();
        self.buckets.retain(|_, bucket| {
            prune(&mut bucket.http, now);
            prune(&mut bucket.control, now);
            !bucket.http.is_empty() || !bucket.control.is_empty()
        });
    }
}

fn prune(timestamps: &mut Vec<Instant>, now: Instant) {
    timestamps.retain(|t| now.duration_since(*t) < WINDOW);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    #[test]
    fn admits_exactly_the_configured_count() {
        let gate = RateLimitGate::new(true, 3, 10);
        assert!(gate.check_http(addr()));
        assert!(gate.check_http(addr()));
        assert!(gate.check_http(addr()));
        assert!(!gate.check_http(addr()));
    }

    #[test]
    fn disabled_gate_always_admits() {
        let gate = RateLimitGate::new(false, 1, 1);
        for _ in 0..10 {
            assert!(gate.check_http(addr()));
        }
    }

    #[test]
    fn http_and_control_counters_are_independent() {
        let gate = RateLimitGate::new(true, 1, 1);
        assert!(gate.check_http(addr()));
        assert!(!gate.check_http(addr()));
        assert!(gate.check_control(addr()));
        assert!(!gate.check_control(addr()));
    }

    #[test]
    fn prune_idle_is_a_no_op_on_a_fresh_bucket() {
        let gate = RateLimitGate::new(true, 1, 1);
        gate.check_http(addr());
        gate.prune_idle();
        assert_eq!(gate.buckets.len(), 1);
    }
}
