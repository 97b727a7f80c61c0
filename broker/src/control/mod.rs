//! The control-channel session: a bidirectional framed endpoint riding a
//! WebSocket upgrade at `/ws` (§4.4).

pub mod frames;

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use tokio::sync::mpsc;

pub use frames::{EgressFrame, IngressFrame};

use crate::engine::Engine;

/// Identifies one open control-channel session for the lifetime of the
/// process. Never reused, so a stale id can never be mistaken for a
/// different, later session holding the same slug.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    #[cfg(test)]
    pub(crate) fn from_raw(n: u64) -> Self {
        Self(n)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Reason a session's writer was told to close, surfaced to the reader
/// loop so it can send a close frame with matching semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Replaced,
    ServerShuttingDown,
}

pub(crate) enum WriterCommand {
    Frame(EgressFrame),
    Close(CloseReason),
}

struct SessionHandle {
    tx: mpsc::Sender<WriterCommand>,
    is_dashboard: bool,
}

/// Registry of open control-channel sessions, keyed by `SessionId`. Holds
/// only a best-effort sender per session: the dispatch engine never blocks
/// on a slow writer (§5, §9 backpressure).
#[derive(Default)]
pub struct Sessions {
    next_id: AtomicU64,
    sessions: DashMap<SessionId, SessionHandle>,
}

/// How long the engine will wait for a frame to be accepted by a session's
/// writer queue before giving up on it as backpressure (§4.4, §9).
const SEND_GRACE: Duration = Duration::from_millis(50);

impl Sessions {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self) -> (SessionId, mpsc::Receiver<WriterCommand>) {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(64);
        self.sessions.insert(id, SessionHandle { tx, is_dashboard: false });
        (id, rx)
    }

    /// Opens a session the same way an accepted WebSocket upgrade would,
    /// for engine-level tests that need a writer queue to read forwarded
    /// frames from without driving a real socket.
    #[cfg(test)]
    pub(crate) fn register_for_test(&self) -> (SessionId, mpsc::Receiver<WriterCommand>) {
        self.register()
    }

    pub fn mark_dashboard(&self, id: SessionId) {
        if let Some(mut handle) = self.sessions.get_mut(&id) {
            handle.is_dashboard = true;
        }
    }

    pub fn remove(&self, id: SessionId) {
        self.sessions.remove(&id);
    }

    /// Attempts to deliver `frame` to `id` within a small bounded time.
    /// Returns `false` on backpressure or a closed/unknown session; the
    /// caller completes the corresponding pending record as a failure.
    pub async fn send(&self, id: SessionId, frame: EgressFrame) -> bool {
        let Some(handle) = self.sessions.get(&id).map(|h| h.tx.clone()) else {
            return false;
        };
        tokio::time::timeout(SEND_GRACE, handle.send(WriterCommand::Frame(frame)))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    pub fn close(&self, id: SessionId, reason: CloseReason) {
        if let Some(handle) = self.sessions.get(&id) {
            let _ = handle.tx.try_send(WriterCommand::Close(reason));
        }
    }

    /// Closes every currently open session, used during shutdown (§5).
    pub fn close_all(&self, reason: CloseReason) {
        for entry in self.sessions.iter() {
            let _ = entry.tx.try_send(WriterCommand::Close(reason));
        }
    }

    /// Best-effort fan-out of an observability frame to every dashboard
    /// session. Drops on a slow or closed session (§4.7, §9).
    pub fn broadcast_to_dashboards(&self, frame: EgressFrame) {
        for entry in self.sessions.iter() {
            if entry.is_dashboard {
                let _ = entry.tx.try_send(WriterCommand::Frame(frame.clone()));
            }
        }
    }
}

/// Drives one accepted WebSocket connection: a reader task that decodes
/// frames and calls into the engine, and a writer loop on the same task
/// that drains the session's outgoing queue. Splitting reader and writer
/// into separate tokio tasks is unnecessary here because `axum`'s
/// `WebSocket` is itself a single `Sink + Stream`; we multiplex both
/// directions with `tokio::select!` instead.
pub async fn run_session(socket: WebSocket, engine: Arc<Engine>, source: IpAddr) {
    use futures::{SinkExt, StreamExt};

    let (mut sink, mut stream) = socket.split();
    let (id, mut writer_rx) = engine.sessions().register();
    tracing::debug!(severity = "control", %source, session = %id, "control channel opened");

    // The normal exit path below awaits cleanup directly; this guard only
    // fires if the loop panics, so a handler crash can't leave a stale
    // binding pointed at a dead session.
    let panic_engine = engine.clone();
    let _cleanup = scopeguard::guard_on_unwind((), move |_| {
        panic_engine.sessions().remove(id);
        let panic_engine = panic_engine.clone();
        tokio::spawn(async move { panic_engine.on_session_loss(id).await });
    });

    loop {
        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = engine.handle_ingress(id, &text).await {
                            if sink.send(Message::Text(reply.to_text().into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(_)) => break,
                }
            }
            command = writer_rx.recv() => {
                match command {
                    Some(WriterCommand::Frame(frame)) => {
                        if sink.send(Message::Text(frame.to_text().into())).await.is_err() {
                            break;
                        }
                    }
                    Some(WriterCommand::Close(reason)) => {
                        let close_reason = match reason {
                            CloseReason::Replaced => "replaced",
                            CloseReason::ServerShuttingDown => "server shutting down",
                        };
                        let _ = sink
                            .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                                code: axum::extract::ws::close_code::NORMAL,
                                reason: close_reason.into(),
                            })))
                            .await;
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    engine.sessions().remove(id);
    engine.on_session_loss(id).await;
    tracing::debug!(severity = "control", session = %id, "control channel closed");
}
