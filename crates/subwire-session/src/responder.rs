//! The responder (server) side of a connection.
//!
//! A [`ResponderSession`] waits for connection-init, asks the executor
//! whether to acknowledge it, then starts one result pipeline per accepted
//! subscribe. Inbound frames are handled strictly in arrival order.

use std::sync::Arc;

use futures::{Sink, Stream};
use metrics::counter;
use serde_json::json;
use subwire_core::{
    CloseCode, ConnectionId, DuplicateOperationPolicy, Frame, JsonMap, OperationId, ProtocolError,
    ProtocolMessage, Role, SubscribePayload, TransportError,
};
use subwire_protocol::SubProtocol;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::SessionConfig;
use crate::connection::{Connection, ConnectionParts, Flow, Wake};
use crate::errors::{RegistryError, Result};
use crate::executor::Executor;
use crate::keepalive::KeepAliveResult;
use crate::metrics::GRAPHQL_OPERATIONS_STARTED_TOTAL;
use crate::outbound::WriterEvent;
use crate::pipeline::run_pipeline;
use crate::registry::OperationRegistry;
use crate::state::ConnectionState;

/// Server side of one connection.
pub struct ResponderSession {
    id: ConnectionId,
    protocol: Arc<dyn SubProtocol>,
    executor: Arc<dyn Executor>,
    config: SessionConfig,
    registry: Arc<OperationRegistry>,
    state: watch::Sender<ConnectionState>,
    shutdown: CancellationToken,
}

impl ResponderSession {
    /// New session in `AwaitingInit`. `protocol` must be a responder adapter.
    pub fn new(
        protocol: Arc<dyn SubProtocol>,
        executor: Arc<dyn Executor>,
        config: SessionConfig,
    ) -> Self {
        debug_assert_eq!(protocol.role(), Role::Responder);
        let registry = Arc::new(OperationRegistry::with_limit(config.max_operations));
        let (state, _) = watch::channel(ConnectionState::AwaitingInit);
        Self {
            id: ConnectionId::new(),
            protocol,
            executor,
            config,
            registry,
            state,
            shutdown: CancellationToken::new(),
        }
    }

    /// Close with 1001 when `token` is cancelled.
    #[must_use]
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Connection id used in logs.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Watch the connection state.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Operations registered on this connection.
    pub fn registry(&self) -> Arc<OperationRegistry> {
        self.registry.clone()
    }

    /// Drive the connection until it closes.
    ///
    /// Returns `Ok(())` for graceful closes (either side) and the failure
    /// cause otherwise. The sink has been closed when this returns.
    #[instrument(skip_all, fields(connection_id = %self.id, protocol = self.protocol.name()))]
    pub async fn run<St, Si>(self, mut stream: St, sink: Si) -> Result<()>
    where
        St: Stream<Item = std::result::Result<Frame, TransportError>> + Unpin,
        Si: Sink<Frame, Error = TransportError> + Send + Unpin + 'static,
    {
        let Self {
            id,
            protocol,
            executor,
            config,
            registry,
            state,
            shutdown,
        } = self;
        let handshake_deadline = Instant::now() + config.handshake_timeout;
        let mut conn = Connection::start(
            ConnectionParts {
                id,
                protocol,
                config,
                registry,
                state,
                shutdown,
            },
            sink,
        );

        loop {
            let deadline =
                (conn.state() == ConnectionState::AwaitingInit).then_some(handshake_deadline);
            let flow = match conn.wait(&mut stream, deadline).await {
                Wake::Shutdown => Flow::Close {
                    code: CloseCode::GOING_AWAY,
                    reason: "server shutting down",
                    notice: None,
                },
                Wake::HandshakeTimeout => Flow::fail(ProtocolError::InitTimeout),
                Wake::KeepAlive(KeepAliveResult::TimedOut) => {
                    Flow::fail(ProtocolError::KeepAliveTimeout)
                }
                Wake::KeepAlive(_) => Flow::Continue,
                Wake::Writer(WriterEvent::Transport(e)) => Flow::fail(e),
                Wake::Writer(WriterEvent::Encode(e)) => Flow::fail(e),
                Wake::Frame(None) => Flow::fail(TransportError::Closed),
                Wake::Frame(Some(Err(e))) => Flow::fail(e),
                Wake::Frame(Some(Ok(Frame::Close(frame)))) => Flow::PeerClosed(frame),
                Wake::Frame(Some(Ok(Frame::Text(text)))) => {
                    handle_text(&mut conn, executor.as_ref(), &text).await
                }
            };
            if let Some(outcome) = conn.apply(flow).await {
                return outcome;
            }
        }
    }
}

async fn handle_text(conn: &mut Connection, executor: &dyn Executor, text: &str) -> Flow {
    let message = match conn.protocol.decode(text) {
        Ok(message) => message,
        Err(e) => return Flow::fail(e),
    };
    trace!(kind = %message.kind(), "received");

    match (conn.state(), message) {
        (ConnectionState::AwaitingInit, ProtocolMessage::ConnectionInit { payload }) => {
            accept_init(conn, executor, payload).await
        }
        (_, ProtocolMessage::ConnectionTerminate) => Flow::Close {
            code: CloseCode::NORMAL,
            reason: "terminated by client",
            notice: None,
        },
        (ConnectionState::AwaitingInit, other) => {
            Flow::fail(ProtocolError::NotAcknowledged(other.kind()))
        }
        (_, ProtocolMessage::ConnectionInit { .. }) => Flow::fail(ProtocolError::DuplicateInit),
        (_, ProtocolMessage::Subscribe { id, payload }) => {
            subscribe(conn, executor, id, payload).await
        }
        (_, ProtocolMessage::Complete { id }) => {
            if conn.registry.cancel(&id) {
                debug!(operation_id = %id, "operation cancelled by peer");
            } else {
                debug!(operation_id = %id, "complete for unknown operation ignored");
            }
            Flow::Continue
        }
        (_, ProtocolMessage::Ping { .. }) => {
            let _ = conn.outbound.send(ProtocolMessage::pong()).await;
            Flow::Continue
        }
        (_, ProtocolMessage::Pong { .. }) => Flow::Continue,
        (state, other) => Flow::fail(ProtocolError::Unexpected {
            kind: other.kind(),
            state: state.as_str(),
        }),
    }
}

async fn accept_init(
    conn: &mut Connection,
    executor: &dyn Executor,
    payload: Option<JsonMap>,
) -> Flow {
    match executor.accept_init(payload).await {
        Ok(ack) => {
            let _ = conn
                .outbound
                .send(ProtocolMessage::ConnectionAck {
                    payload: Some(ack.unwrap_or_default()),
                })
                .await;
            let _ = conn.transition(ConnectionState::Acknowledged);
            conn.start_keep_alive();
            info!(connection_id = %conn.id, "connection acknowledged");
            Flow::Continue
        }
        Err(reason) => {
            let notice = conn.protocol.init_rejection(&reason);
            Flow::Fail {
                error: ProtocolError::InitRejected(reason).into(),
                notice,
            }
        }
    }
}

async fn subscribe(
    conn: &mut Connection,
    executor: &dyn Executor,
    id: OperationId,
    payload: SubscribePayload,
) -> Flow {
    match conn.registry.register(id.clone(), &conn.scope) {
        Ok(ticket) => {
            counter!(GRAPHQL_OPERATIONS_STARTED_TOTAL, "protocol" => conn.protocol.name())
                .increment(1);
            debug!(
                operation_id = %id,
                operation_name = payload.operation_name.as_deref().unwrap_or(""),
                "operation started"
            );
            let stream = executor.execute(&id, payload, ticket.cancel.clone());
            let _ = tokio::spawn(run_pipeline(
                ticket,
                stream,
                conn.protocol.clone(),
                conn.registry.clone(),
                conn.outbound.clone(),
            ));
            Flow::Continue
        }
        Err(RegistryError::Duplicate(id)) => match conn.config.duplicate_operations {
            DuplicateOperationPolicy::FailConnection => {
                Flow::fail(ProtocolError::DuplicateOperation(id))
            }
            DuplicateOperationPolicy::Ignore => {
                warn!(operation_id = %id, "subscribe reuses an active id, ignored");
                Flow::Continue
            }
        },
        Err(RegistryError::LimitReached(limit)) => {
            warn!(operation_id = %id, limit, "operation limit reached, subscribe rejected");
            let message = format!("Operation limit of {limit} reached");
            reject(conn, id, message).await
        }
    }
}

/// Refuse a subscribe for a fresh id without disturbing the connection.
async fn reject(conn: &Connection, id: OperationId, message: String) -> Flow {
    let _ = conn
        .outbound
        .send(ProtocolMessage::Error {
            id,
            payload: vec![json!({ "message": message })],
        })
        .await;
    Flow::Continue
}
