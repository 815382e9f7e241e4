//! Plumbing shared by responder and initiator sessions.
//!
//! A [`Connection`] owns the writer task, the keep-alive task, the state
//! watch channel and the cancellation scope of one duplex connection.
//! Role-specific sessions drive it: they pull [`Wake`] events and decide
//! what each inbound message means.

use std::sync::Arc;
use std::time::Duration;

use futures::{Sink, Stream, StreamExt};
use metrics::{counter, gauge, histogram};
use subwire_core::{
    CloseCode, CloseFrame, ConnectionId, Frame, ProtocolMessage, Role, TransportError,
};
use subwire_protocol::SubProtocol;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::errors::SessionError;
use crate::keepalive::{KeepAliveResult, KeepAliveTiming, Liveness, run_keep_alive};
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_PROTOCOL_VIOLATIONS_TOTAL,
};
use crate::outbound::{OutboundQueue, WriterEvent, outbound, run_writer};
use crate::registry::OperationRegistry;
use crate::state::ConnectionState;

/// Upper bound on waiting for queued frames to flush during teardown.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest close reason a WebSocket control frame can carry.
const MAX_CLOSE_REASON: usize = 123;

/// What woke the session loop.
pub(crate) enum Wake {
    Frame(Option<Result<Frame, TransportError>>),
    Writer(WriterEvent),
    KeepAlive(KeepAliveResult),
    HandshakeTimeout,
    Shutdown,
}

/// What the session loop does after handling a wake-up.
pub(crate) enum Flow {
    Continue,
    Close {
        code: CloseCode,
        reason: &'static str,
        notice: Option<ProtocolMessage>,
    },
    Fail {
        error: SessionError,
        notice: Option<ProtocolMessage>,
    },
    PeerClosed(Option<CloseFrame>),
}

impl Flow {
    pub(crate) fn fail(error: impl Into<SessionError>) -> Self {
        Self::Fail {
            error: error.into(),
            notice: None,
        }
    }
}

/// One live duplex connection.
pub(crate) struct Connection {
    pub(crate) id: ConnectionId,
    pub(crate) protocol: Arc<dyn SubProtocol>,
    pub(crate) config: SessionConfig,
    pub(crate) registry: Arc<OperationRegistry>,
    pub(crate) liveness: Arc<Liveness>,
    pub(crate) outbound: OutboundQueue,
    /// Parent of every operation token and of the keep-alive monitor.
    pub(crate) scope: CancellationToken,
    shutdown: CancellationToken,
    state: watch::Sender<ConnectionState>,
    writer: Option<JoinHandle<()>>,
    writer_events: mpsc::UnboundedReceiver<WriterEvent>,
    keep_alive: Option<JoinHandle<KeepAliveResult>>,
    opened_at: Instant,
}

/// Everything a session hands to [`Connection::start`].
pub(crate) struct ConnectionParts {
    pub id: ConnectionId,
    pub protocol: Arc<dyn SubProtocol>,
    pub config: SessionConfig,
    pub registry: Arc<OperationRegistry>,
    pub state: watch::Sender<ConnectionState>,
    pub shutdown: CancellationToken,
}

impl Connection {
    /// Spawn the writer over `sink` and start in `AwaitingInit`.
    pub(crate) fn start<Si>(parts: ConnectionParts, sink: Si) -> Self
    where
        Si: Sink<Frame, Error = TransportError> + Send + Unpin + 'static,
    {
        let ConnectionParts {
            id,
            protocol,
            config,
            registry,
            state,
            shutdown,
        } = parts;
        let (queue, lanes) = outbound(config.outbound_buffer);
        let (events_tx, writer_events) = mpsc::unbounded_channel();
        let writer = tokio::spawn(run_writer(
            sink,
            lanes,
            protocol.clone(),
            registry.clone(),
            events_tx,
        ));

        let role = role_label(protocol.role());
        counter!(WS_CONNECTIONS_TOTAL, "role" => role, "protocol" => protocol.name()).increment(1);
        gauge!(WS_CONNECTIONS_ACTIVE, "role" => role).increment(1.0);
        info!(connection_id = %id, protocol = protocol.name(), role, "connection opened");

        let scope = shutdown.child_token();
        Self {
            id,
            protocol,
            config,
            registry,
            liveness: Arc::new(Liveness::new()),
            outbound: queue,
            scope,
            shutdown,
            state,
            writer: Some(writer),
            writer_events,
            keep_alive: None,
            opened_at: Instant::now(),
        }
    }

    /// Current state.
    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Apply a legal transition; illegal ones are ignored.
    pub(crate) fn transition(&self, next: ConnectionState) -> bool {
        let id = &self.id;
        self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                debug!(connection_id = %id, from = %current, to = %next, "state transition");
                *current = next;
                true
            } else {
                false
            }
        })
    }

    /// Start the keep-alive monitor; called once on acknowledgment.
    pub(crate) fn start_keep_alive(&mut self) {
        if self.keep_alive.is_some() {
            return;
        }
        let timing = KeepAliveTiming {
            interval: self.config.keep_alive_interval,
            idle_timeout: self.config.idle_timeout,
            send_pings: self.config.send_pings,
        };
        self.keep_alive = Some(tokio::spawn(run_keep_alive(
            self.protocol.clone(),
            self.liveness.clone(),
            self.outbound.clone(),
            timing,
            self.scope.child_token(),
        )));
    }

    /// Wait for the next thing the session must react to.
    pub(crate) async fn wait<St>(&mut self, stream: &mut St, handshake_deadline: Option<Instant>) -> Wake
    where
        St: Stream<Item = Result<Frame, TransportError>> + Unpin,
    {
        tokio::select! {
            biased;
            () = self.shutdown.cancelled() => Wake::Shutdown,
            Some(event) = self.writer_events.recv() => Wake::Writer(event),
            result = keep_alive_finished(&mut self.keep_alive) => Wake::KeepAlive(result),
            () = sleep_until_opt(handshake_deadline) => Wake::HandshakeTimeout,
            frame = stream.next() => {
                if matches!(frame, Some(Ok(Frame::Text(_)))) {
                    self.liveness.touch();
                }
                Wake::Frame(frame)
            }
        }
    }

    /// Carry out a flow decision. Returns the session outcome once the
    /// connection is finished, `None` to keep looping.
    pub(crate) async fn apply(&mut self, flow: Flow) -> Option<Result<(), SessionError>> {
        match flow {
            Flow::Continue => None,
            Flow::Close {
                code,
                reason,
                notice,
            } => {
                self.close(code, reason, notice).await;
                Some(Ok(()))
            }
            Flow::Fail { error, notice } => {
                self.fail(&error, notice).await;
                Some(Err(error))
            }
            Flow::PeerClosed(frame) => Some(self.peer_closed(frame).await.map_or(Ok(()), Err)),
        }
    }

    /// Fail the connection: cancel every operation, optionally send a final
    /// notice, close with the error's code and wait for the flush.
    pub(crate) async fn fail(&mut self, error: &SessionError, notice: Option<ProtocolMessage>) {
        let code = error.close_code();
        if !self.transition(ConnectionState::Failed(code)) {
            return;
        }
        warn!(connection_id = %self.id, %code, error = %error, "connection failed");
        if matches!(error, SessionError::Protocol(_)) {
            counter!(WS_PROTOCOL_VIOLATIONS_TOTAL, "code" => code.to_string()).increment(1);
        }
        self.teardown();
        if matches!(error, SessionError::Transport(_)) {
            if let Some(writer) = self.writer.take() {
                writer.abort();
            }
            return;
        }
        if let Some(notice) = notice {
            let _ = self.outbound.send(notice).await;
        }
        let _ = self
            .outbound
            .close(CloseFrame::new(code, close_reason(&error.to_string())))
            .await;
        self.flush().await;
    }

    /// Close gracefully: `Closing`, cancel operations, flush, send the
    /// close frame, `Closed`.
    pub(crate) async fn close(&mut self, code: CloseCode, reason: &str, notice: Option<ProtocolMessage>) {
        if !self.transition(ConnectionState::Closing) {
            return;
        }
        info!(connection_id = %self.id, %code, reason, "closing connection");
        self.teardown();
        if let Some(notice) = notice {
            let _ = self.outbound.send(notice).await;
        }
        let _ = self
            .outbound
            .close(CloseFrame::new(code, close_reason(reason)))
            .await;
        self.flush().await;
        let _ = self.transition(ConnectionState::Closed);
    }

    /// React to a close frame from the peer by echoing it.
    ///
    /// Graceful codes end in `Closed`; anything else in `Failed`.
    pub(crate) async fn peer_closed(&mut self, frame: Option<CloseFrame>) -> Option<SessionError> {
        let (code, reason) = frame.map_or((CloseCode::NORMAL, String::new()), |f| (f.code, f.reason));
        debug!(connection_id = %self.id, %code, reason, "peer sent close frame");
        if code.is_graceful() {
            self.close(code, &reason, None).await;
            None
        } else {
            let _ = self.transition(ConnectionState::Failed(code));
            self.teardown();
            let _ = self.outbound.close(CloseFrame::new(code, close_reason(&reason))).await;
            self.flush().await;
            Some(SessionError::Closed { code, reason })
        }
    }

    fn teardown(&mut self) {
        self.scope.cancel();
        let cancelled = self.registry.cancel_all();
        if cancelled > 0 {
            debug!(connection_id = %self.id, cancelled, "cancelled active operations");
        }
        if let Some(keep_alive) = self.keep_alive.take() {
            keep_alive.abort();
        }
    }

    async fn flush(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if time::timeout(FLUSH_TIMEOUT, &mut writer).await.is_err() {
                warn!(connection_id = %self.id, "outbound flush timed out, aborting writer");
                writer.abort();
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.scope.cancel();
        let _ = self.registry.cancel_all();
        if let Some(keep_alive) = self.keep_alive.take() {
            keep_alive.abort();
        }
        let role = role_label(self.protocol.role());
        gauge!(WS_CONNECTIONS_ACTIVE, "role" => role).decrement(1.0);
        histogram!(WS_CONNECTION_DURATION_SECONDS, "role" => role)
            .record(self.opened_at.elapsed().as_secs_f64());
        info!(connection_id = %self.id, state = %self.state(), "connection finished");
    }
}

/// Metric/log label for a role.
pub(crate) fn role_label(role: Role) -> &'static str {
    match role {
        Role::Initiator => "initiator",
        Role::Responder => "responder",
    }
}

/// Truncate a close reason to fit a control frame, on a char boundary.
pub(crate) fn close_reason(reason: &str) -> String {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason.to_owned();
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_owned()
}

async fn keep_alive_finished(handle: &mut Option<JoinHandle<KeepAliveResult>>) -> KeepAliveResult {
    let Some(task) = handle.as_mut() else {
        return std::future::pending().await;
    };
    let result = task.await.unwrap_or(KeepAliveResult::Cancelled);
    *handle = None;
    result
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_reasons_untouched() {
        assert_eq!(close_reason("bye"), "bye");
    }

    #[test]
    fn long_reasons_truncated_on_char_boundary() {
        let reason = "é".repeat(100);
        let truncated = close_reason(&reason);
        assert!(truncated.len() <= MAX_CLOSE_REASON);
        assert!(reason.starts_with(&truncated));
    }

    #[test]
    fn role_labels() {
        assert_eq!(role_label(Role::Initiator), "initiator");
        assert_eq!(role_label(Role::Responder), "responder");
    }
}
