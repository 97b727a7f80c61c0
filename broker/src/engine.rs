//! The dispatch engine (§4.1): admission, forwarding, queueing, and the
//! three callbacks driven by the control channel. This is the only writer
//! of the slug registry and the pending table (§5).

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::control::{CloseReason, EgressFrame, SessionId, Sessions, frames::IngressFrame};
use crate::errors::{Error, Result};
use crate::observability::{ObservabilitySink, Severity, Stats};
use crate::pending::{PendingOutcome, PendingRecord, PendingTable, RecordState};
use crate::ratelimit::RateLimitGate;
use crate::registry::{Binding, SlugRegistry};
use crate::types::{CapturedRequest, RequestId, Slug, StructuredResponse};
use crate::validation;

pub struct Engine {
    registry: SlugRegistry,
    pending: PendingTable,
    rate_limit: RateLimitGate,
    sessions: Arc<Sessions>,
    sink: Arc<ObservabilitySink>,
    stats: Arc<Stats>,
    config: Config,
    shutting_down: AtomicBool,
}

impl Engine {
    pub fn new(config: Config) -> Arc<Self> {
        let sessions = Arc::new(Sessions::new());
        let sink = Arc::new(ObservabilitySink::new(sessions.clone(), config.observability_retention_days));
        let rate_limit = RateLimitGate::new(
            config.enable_rate_limit,
            config.max_requests_per_minute,
            config.max_connections_per_ip,
        );
        Arc::new(Self {
            registry: SlugRegistry::new(),
            pending: PendingTable::new(),
            rate_limit,
            sessions,
            sink,
            stats: Arc::new(Stats::new()),
            config,
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn sessions(&self) -> &Sessions {
        &self.sessions
    }

    pub fn sink(&self) -> &ObservabilitySink {
        &self.sink
    }

    pub fn sink_handle(&self) -> Arc<ObservabilitySink> {
        self.sink.clone()
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn stats_handle(&self) -> Arc<Stats> {
        self.stats.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn rate_limit(&self) -> &RateLimitGate {
        &self.rate_limit
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn bound_slugs(&self) -> Vec<String> {
        self.registry.bound_slugs()
    }

    // ---- admission / submission (§4.1 public contract: submit) ----

    /// Admits and dispatches one HTTP request, suspending until a response
    /// arrives, a deadline fires, or the handler is lost.
    pub async fn submit(self: &Arc<Self>, slug: Slug, captured: CapturedRequest, _source: IpAddr) -> Result<StructuredResponse> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::HandlerLost);
        }

        self.stats.record_received();
        let id = RequestId::new();
        let birth = Instant::now();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, PendingRecord::new(slug.clone(), captured, tx));

        match self.registry.binding_for(&slug) {
            Some(binding) => self.forward(id, &slug, binding.session_id).await,
            None => {
                self.registry.enqueue(&slug, id);
                let handle = self.spawn_deadline(id, self.config.queue_wait_deadline);
                self.pending.set_deadline(id, handle);
            }
        }

        let outcome = rx.await;
        let elapsed = birth.elapsed();
        match outcome {
            Ok(PendingOutcome::Response(response)) => {
                self.stats.record_succeeded(elapsed);
                Ok(response)
            }
            Ok(PendingOutcome::Failure(err)) => {
                self.stats.record_failed(elapsed);
                Err(err)
            }
            Err(_) => {
                // The sender was dropped without completing the record: only
                // possible during a shutdown race. Treat it like any other
                // handler loss.
                self.stats.record_failed(elapsed);
                Err(Error::HandlerLost)
            }
        }
    }

    /// Sends the forwarded-request frame for a record that is currently
    /// `Queued` (either freshly admitted or next in a drain), installing a
    /// forward deadline first. On send failure the record is completed as
    /// 500 immediately, matching §4.1/§4.3.
    async fn forward(self: &Arc<Self>, id: RequestId, slug: &Slug, session_id: SessionId) {
        let Some(captured) = self.pending.take_for_forwarding(id) else {
            return;
        };
        let handle = self.spawn_deadline(id, self.config.forward_deadline);
        self.pending.set_deadline(id, handle);

        let frame = EgressFrame::ForwardedRequest { slug: slug.to_string(), request_id: id, request: captured };
        if !self.sessions.send(session_id, frame).await {
            self.sink.log(Severity::Error, format!("failed to forward request {id} to {session_id}"));
            self.pending.complete(id, PendingOutcome::Failure(Error::ForwardFailed(session_id.to_string())));
        }
    }

    fn spawn_deadline(self: &Arc<Self>, id: RequestId, delay: Duration) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            engine.fire_deadline(id).await;
        })
    }

    async fn fire_deadline(self: &Arc<Self>, id: RequestId) {
        if let Some((slug, state)) = self.pending.complete(id, PendingOutcome::Failure(Error::DeadlineExceeded)) {
            if state == RecordState::Queued {
                self.registry.remove_from_queue(&slug, id);
            }
            self.sink.log(Severity::Error, format!("request {id} for slug '{slug}' deadline expired"));
        }
    }

    // ---- control-channel callbacks (§4.1) ----

    /// Decodes one ingress frame and dispatches it, returning an immediate
    /// reply frame to send back to the same session (registration ack,
    /// error hint), if any.
    pub async fn handle_ingress(self: &Arc<Self>, session_id: SessionId, raw: &str) -> Option<EgressFrame> {
        let frame = match crate::control::frames::decode_ingress(raw) {
            Ok(frame) => frame,
            Err(_) => return Some(EgressFrame::error_hint("Invalid message format")),
        };

        match frame {
            IngressFrame::Registration { slug } => match validation::validate_slug(&slug) {
                Ok(slug) => {
                    self.on_registration(session_id, slug.clone()).await;
                    Some(EgressFrame::registered(slug.to_string()))
                }
                Err(_) => Some(EgressFrame::error_hint("Invalid message format")),
            },
            IngressFrame::Response { slug, request_id, response } => {
                self.on_response(session_id, request_id, &slug, response).await;
                None
            }
            IngressFrame::DashboardAttach { .. } => {
                self.sessions.mark_dashboard(session_id);
                None
            }
        }
    }

    /// Binds `session_id` to `slug`, replacing and closing any prior
    /// binding first, then drains the slug's unforwarded queue (§4.2,
    /// §4.3).
    pub async fn on_registration(self: &Arc<Self>, session_id: SessionId, slug: Slug) {
        if let Some(old) = self.registry.binding_for(&slug) {
            self.sessions.close(old.session_id, CloseReason::Replaced);
        }

        self.registry.set_binding(slug.clone(), Binding { session_id, bound_at: Instant::now() });
        self.sink.log(Severity::Control, format!("session {session_id} registered for slug '{slug}'"));

        self.drain_queue(&slug, session_id).await;
    }

    /// Forwards queued records for `slug` against `session_id`, in
    /// admission order. The first forwarding failure aborts the drain and
    /// puts the remaining records back on the queue, untouched (§4.2,
    /// §4.3).
    async fn drain_queue(self: &Arc<Self>, slug: &Slug, session_id: SessionId) {
        let ids = self.registry.take_queue(slug);
        for (i, id) in ids.iter().enumerate() {
            self.forward(*id, slug, session_id).await;
            // A queued record may have already hit its wait deadline
            // concurrently with this drain, in which case `forward` found
            // nothing to send and this looks identical to a send failure:
            // either way the record is gone and draining should stop.
            if self.pending.state_of(*id) != Some(RecordState::Forwarded) {
                for remaining in &ids[i + 1..] {
                    self.registry.enqueue(slug, *remaining);
                }
                break;
            }
        }
    }

    /// Delivers a handler's response to the pending record it answers,
    /// provided the responding session is still the slug's current
    /// binding holder (§4.1, the strict resolution of the open question in
    /// the design notes). Stale responses are discarded and logged.
    pub async fn on_response(self: &Arc<Self>, session_id: SessionId, request_id: RequestId, slug: &str, response: StructuredResponse) {
        let Ok(slug) = validation::validate_slug(slug) else {
            self.sink.log(Severity::Error, format!("response for invalid slug from {session_id}"));
            return;
        };

        if !self.registry.is_bound_by(&slug, session_id) {
            self.sink.log(
                Severity::Error,
                format!("discarding response for '{slug}' from {session_id}: not the current binding holder"),
            );
            return;
        }

        if self.pending.complete(request_id, PendingOutcome::Response(response)).is_none() {
            self.sink.log(Severity::Error, format!("discarding response for unknown or completed request {request_id}"));
        }
    }

    /// Removes every binding still held by this session and cancels every
    /// record that had already been forwarded through each one, leaving
    /// unforwarded queued records intact for a future binding (§4.1).
    /// Nothing in the wire protocol stops a single session from registering
    /// more than one slug, so this clears all of them, not just one.
    pub async fn on_session_loss(self: &Arc<Self>, session_id: SessionId) {
        for slug in self.bound_slugs_for_session(session_id) {
            if !self.registry.remove_binding_if(&slug, session_id) {
                continue;
            }
            self.sink.log(Severity::Control, format!("session {session_id} lost, binding for '{slug}' cleared"));

            for id in self.pending.ids_for_slug(&slug) {
                if self.pending.state_of(id) == Some(RecordState::Forwarded) {
                    self.pending.complete(id, PendingOutcome::Failure(Error::HandlerLost));
                }
            }
        }
    }

    fn bound_slugs_for_session(&self, session_id: SessionId) -> Vec<Slug> {
        // The registry is keyed by slug, not by session, so finding every
        // slug a lost session held requires a scan over the live-binding
        // set; expected cardinality is small relative to request volume.
        self.registry
            .bindings_snapshot()
            .into_iter()
            .filter(|(_, b)| b.session_id == session_id)
            .map(|(slug, _)| slug)
            .collect()
    }

    // ---- shutdown (§5) ----

    /// Cancels every pending record with 503 and closes every open session,
    /// matching the cancellation policy in §5.
    pub async fn shutdown(self: &Arc<Self>) {
        self.shutting_down.store(true, Ordering::SeqCst);
        for id in self.pending.all_ids() {
            self.pending.complete(id, PendingOutcome::Failure(Error::HandlerLost));
        }
        self.sessions.close_all(CloseReason::ServerShuttingDown);
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use crate::control::WriterCommand;

    use super::*;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.forward_deadline = Duration::from_secs(30);
        config.queue_wait_deadline = Duration::from_secs(30);
        config
    }

    fn slug(s: &str) -> Slug {
        crate::validation::validate_slug(s).unwrap()
    }

    fn addr() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    fn captured(url: &str) -> CapturedRequest {
        CapturedRequest { method: "GET".to_string(), url: url.to_string(), headers: Default::default(), body: String::new() }
    }

    async fn expect_forwarded(rx: &mut tokio::sync::mpsc::Receiver<WriterCommand>) -> RequestId {
        match rx.recv().await.unwrap() {
            WriterCommand::Frame(EgressFrame::ForwardedRequest { request_id, .. }) => request_id,
            WriterCommand::Frame(_) => panic!("expected a forwarded-request frame, got a different frame kind"),
            WriterCommand::Close(_) => panic!("expected a forwarded-request frame, got a close command"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_forward_then_response() {
        let engine = Engine::new(test_config());
        let (session_id, mut rx) = engine.sessions().register_for_test();
        engine.on_registration(session_id, slug("svc-a")).await;

        let submitter = engine.clone();
        let submit = tokio::spawn(async move { submitter.submit(slug("svc-a"), captured("/svc-a"), addr()).await });

        let request_id = expect_forwarded(&mut rx).await;
        engine
            .on_response(
                session_id,
                request_id,
                "svc-a",
                StructuredResponse { status_code: Some(201), body: "ok".to_string(), ..Default::default() },
            )
            .await;

        let response = submit.await.unwrap().unwrap();
        assert_eq!(response.status(), 201);
        assert_eq!(response.body, "ok");
    }

    #[tokio::test(start_paused = true)]
    async fn queue_then_bind_drains_to_the_new_registration() {
        let engine = Engine::new(test_config());

        let submitter = engine.clone();
        let submit = tokio::spawn(async move { submitter.submit(slug("svc-b"), captured("/svc-b"), addr()).await });
        tokio::task::yield_now().await;
        assert_eq!(engine.pending_count(), 1);

        let (session_id, mut rx) = engine.sessions().register_for_test();
        engine.on_registration(session_id, slug("svc-b")).await;

        let request_id = expect_forwarded(&mut rx).await;
        engine.on_response(session_id, request_id, "svc-b", StructuredResponse::default()).await;

        let response = submit.await.unwrap().unwrap();
        assert_eq!(response.status(), 200);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_wait_deadline_returns_deadline_exceeded() {
        let mut config = test_config();
        config.queue_wait_deadline = Duration::from_millis(50);
        let engine = Engine::new(config);

        let result = engine.submit(slug("svc-c"), captured("/svc-c"), addr()).await;
        assert!(matches!(result, Err(Error::DeadlineExceeded)));
    }

    #[tokio::test(start_paused = true)]
    async fn handler_lost_mid_flight_fails_the_waiting_caller() {
        let engine = Engine::new(test_config());
        let (session_id, mut rx) = engine.sessions().register_for_test();
        engine.on_registration(session_id, slug("svc-d")).await;

        let submitter = engine.clone();
        let submit = tokio::spawn(async move { submitter.submit(slug("svc-d"), captured("/svc-d"), addr()).await });
        expect_forwarded(&mut rx).await;

        engine.on_session_loss(session_id).await;

        let result = submit.await.unwrap();
        assert!(matches!(result, Err(Error::HandlerLost)));
        assert!(engine.registry.binding_for(&slug("svc-d")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn replacement_closes_the_old_session_and_forwards_to_the_new_one() {
        let engine = Engine::new(test_config());
        let (session_a, mut rx_a) = engine.sessions().register_for_test();
        engine.on_registration(session_a, slug("svc-e")).await;

        let (session_b, mut rx_b) = engine.sessions().register_for_test();
        engine.on_registration(session_b, slug("svc-e")).await;

        match rx_a.recv().await.unwrap() {
            WriterCommand::Close(CloseReason::Replaced) => {}
            _ => panic!("replaced session should receive a Close(Replaced) command"),
        }

        let submitter = engine.clone();
        let submit = tokio::spawn(async move { submitter.submit(slug("svc-e"), captured("/svc-e"), addr()).await });
        let request_id = expect_forwarded(&mut rx_b).await;
        engine.on_response(session_b, request_id, "svc-e", StructuredResponse::default()).await;

        assert!(submit.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn session_loss_clears_every_slug_the_session_held() {
        let engine = Engine::new(test_config());
        let (session_id, _rx) = engine.sessions().register_for_test();
        engine.on_registration(session_id, slug("svc-f")).await;
        engine.on_registration(session_id, slug("svc-g")).await;

        engine.on_session_loss(session_id).await;

        assert!(engine.registry.binding_for(&slug("svc-f")).is_none());
        assert!(engine.registry.binding_for(&slug("svc-g")).is_none());
    }
}
