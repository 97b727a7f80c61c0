//! Bounded log ring plus dashboard fan-out (§4.7).

pub mod stats;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

pub use stats::Stats;

use crate::control::{EgressFrame, Sessions};

const RING_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Http,
    Control,
    Security,
    Server,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub at: DateTime<Utc>,
    pub severity: Severity,
    pub message: String,
}

pub struct ObservabilitySink {
    ring: Mutex<VecDeque<LogRecord>>,
    sessions: Arc<Sessions>,
    retention: chrono::Duration,
}

impl ObservabilitySink {
    pub fn new(sessions: Arc<Sessions>, retention_days: i64) -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(RING_CAPACITY)),
            sessions,
            retention: chrono::Duration::days(retention_days),
        }
    }

    pub fn log(&self, severity: Severity, message: impl Into<String>) {
        let record = LogRecord { at: Utc::now(), severity, message: message.into() };

        {
            let mut ring = self.ring.lock().unwrap();
            if ring.len() >= RING_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(record.clone());
        }

        let payload = serde_json::json!({
            "type": "log",
            "at": record.at,
            "severity": record.severity,
            "message": record.message,
        });
        self.sessions.broadcast_to_dashboards(EgressFrame::Observability(payload));
    }

    /// Drops ring entries older than the retention horizon (§4.7's 60 s
    /// maintenance task).
    pub fn prune_expired(&self) {
        let horizon = Utc::now() - self.retention;
        self.ring.lock().unwrap().retain(|r| r.at >= horizon);
    }

    pub fn recent(&self) -> Vec<LogRecord> {
        self.ring.lock().unwrap().iter().cloned().collect()
    }

    pub fn broadcast_status(&self, payload: serde_json::Value) {
        self.sessions.broadcast_to_dashboards(EgressFrame::Observability(payload));
    }
}

/// Spawns the two periodic maintenance tasks described in §4.7: a 60 s
/// ring-pruning task and a 5 min stats-bucket-trimming task. Both stop as
/// soon as `shutdown` is cancelled, rather than being aborted mid-tick.
pub fn spawn_maintenance_tasks(
    sink: Arc<ObservabilitySink>,
    stats: Arc<Stats>,
    stats_retention_days: i64,
    shutdown: CancellationToken,
) -> Vec<tokio::task::JoinHandle<()>> {
    let aggregation_sink = sink.clone();
    let pruning_shutdown = shutdown.clone();
    let pruning = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = interval.tick() => sink.prune_expired(),
                _ = pruning_shutdown.cancelled() => break,
            }
        }
    });

    let aggregation_shutdown = shutdown;
    let aggregation = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5 * 60));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    stats.prune_buckets(stats_retention_days);
                    let totals = stats.totals();
                    aggregation_sink.broadcast_status(serde_json::json!({"type": "stats", "totals": totals}));
                }
                _ = aggregation_shutdown.cancelled() => break,
            }
        }
    });

    vec![pruning, aggregation]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_evicts_oldest_past_capacity() {
        let sessions = Arc::new(Sessions::new());
        let sink = ObservabilitySink::new(sessions, 7);
        for i in 0..RING_CAPACITY + 10 {
            sink.log(Severity::Server, format!("entry {i}"));
        }
        let recent = sink.recent();
        assert_eq!(recent.len(), RING_CAPACITY);
        assert_eq!(recent.first().unwrap().message, "entry 10");
    }
}
