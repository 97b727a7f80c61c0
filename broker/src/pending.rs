//! The pending table: request id → in-flight request record (§4.1, §3).
//! Completion is a single atomic remove-by-id, so response delivery,
//! deadline expiry, and session-loss cancellation race safely against each
//! other — whichever caller removes the record wins.

use std::collections::HashSet;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::errors::Error;
use crate::types::{CapturedRequest, RequestId, Slug, StructuredResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    /// Waiting in a slug's queue for a binding to appear.
    Queued,
    /// Sent to a bound handler; awaiting its response.
    Forwarded,
}

pub enum PendingOutcome {
    Response(StructuredResponse),
    Failure(Error),
}

pub struct PendingRecord {
    pub slug: Slug,
    pub state: RecordState,
    pub birth: Instant,
    /// Present only while the record is still `Queued` (§3: "retained only
    /// while unforwarded").
    pub captured: Option<CapturedRequest>,
    reply_tx: Option<oneshot::Sender<PendingOutcome>>,
    deadline_handle: Option<JoinHandle<()>>,
}

impl PendingRecord {
    pub fn new(slug: Slug, captured: CapturedRequest, reply_tx: oneshot::Sender<PendingOutcome>) -> Self {
        Self {
            slug,
            state: RecordState::Queued,
            birth: Instant::now(),
            captured: Some(captured),
            reply_tx: Some(reply_tx),
            deadline_handle: None,
        }
    }
}

/// Keyed by request id, with a secondary per-slug index so cancellation and
/// draining touch only the k records of a given slug (§3).
#[derive(Default)]
pub struct PendingTable {
    records: DashMap<RequestId, PendingRecord>,
    by_slug: DashMap<Slug, HashSet<RequestId>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: RequestId, record: PendingRecord) {
        self.by_slug.entry(record.slug.clone()).or_default().insert(id);
        self.records.insert(id, record);
    }

    /// Replaces the deadline task for `id`, aborting whatever timer was
    /// previously registered. Used both at insertion and when a queued
    /// record transitions to forwarded with a new deadline (§4.3).
    pub fn set_deadline(&self, id: RequestId, handle: JoinHandle<()>) {
        if let Some(mut record) = self.records.get_mut(&id) {
            if let Some(old) = record.deadline_handle.replace(handle) {
                old.abort();
            }
        } else {
            handle.abort();
        }
    }

    /// Transitions a queued record to forwarded, handing back its captured
    /// request so the caller can frame it onto the control channel. The
    /// table stops retaining the captured request once this returns, per
    /// the data model's "retained only while unforwarded" rule.
    pub fn take_for_forwarding(&self, id: RequestId) -> Option<CapturedRequest> {
        let mut record = self.records.get_mut(&id)?;
        record.state = RecordState::Forwarded;
        record.captured.take()
    }

    #[cfg(test)]
    pub fn mark_forwarded(&self, id: RequestId) {
        let _ = self.take_for_forwarding(id);
    }

    /// The single race-safe completion path: removes the record, cancels
    /// its timer, and delivers the outcome to its reply sink exactly once.
    /// Returns the completed record's slug and the state it was in at the
    /// moment of completion, or `None` if some other caller already won
    /// the race to complete this id.
    pub fn complete(&self, id: RequestId, outcome: PendingOutcome) -> Option<(Slug, RecordState)> {
        let (_, record) = self.records.remove(&id)?;
        if let Some(mut set) = self.by_slug.get_mut(&record.slug) {
            set.remove(&id);
        }
        if let Some(handle) = record.deadline_handle {
            handle.abort();
        }
        let info = (record.slug, record.state);
        if let Some(tx) = record.reply_tx {
            let _ = tx.send(outcome);
        }
        Some(info)
    }

    pub fn ids_for_slug(&self, slug: &Slug) -> Vec<RequestId> {
        self.by_slug.get(slug).map(|s| s.iter().copied().collect()).unwrap_or_default()
    }

    pub fn state_of(&self, id: RequestId) -> Option<RecordState> {
        self.records.get(&id).map(|r| r.state)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn all_ids(&self) -> Vec<RequestId> {
        self.records.iter().map(|e| *e.key()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slug(s: &str) -> Slug {
        crate::validation::validate_slug(s).unwrap()
    }

    fn captured() -> CapturedRequest {
        CapturedRequest {
            method: "GET".to_string(),
            url: "/svc-a".to_string(),
            headers: Default::default(),
            body: String::new(),
        }
    }

    #[tokio::test]
    async fn complete_is_exactly_once() {
        let table = PendingTable::new();
        let id = RequestId::new();
        let (tx, rx) = tokio::sync::oneshot::channel();
        table.insert(id, PendingRecord::new(slug("svc-a"), captured(), tx));

        assert!(table.complete(id, PendingOutcome::Failure(Error::DeadlineExceeded)).is_some());
        assert!(table.complete(id, PendingOutcome::Failure(Error::DeadlineExceeded)).is_none());
        assert!(matches!(rx.await.unwrap(), PendingOutcome::Failure(Error::DeadlineExceeded)));
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn ids_for_slug_tracks_live_records_only() {
        let table = PendingTable::new();
        let id = RequestId::new();
        let (tx, _rx) = tokio::sync::oneshot::channel();
        table.insert(id, PendingRecord::new(slug("svc-b"), captured(), tx));
        assert_eq!(table.ids_for_slug(&slug("svc-b")), vec![id]);

        table.complete(id, PendingOutcome::Failure(Error::HandlerLost));
        assert!(table.ids_for_slug(&slug("svc-b")).is_empty());
    }

    #[tokio::test]
    async fn forwarding_drops_the_captured_request() {
        let table = PendingTable::new();
        let id = RequestId::new();
        let (tx, _rx) = tokio::sync::oneshot::channel();
        table.insert(id, PendingRecord::new(slug("svc-c"), captured(), tx));
        table.mark_forwarded(id);
        assert_eq!(table.state_of(id), Some(RecordState::Forwarded));
    }
}
