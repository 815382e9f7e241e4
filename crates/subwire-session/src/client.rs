//! The initiator (client) side of a connection.
//!
//! [`Client::handshake`] sends connection-init and resolves once the
//! responder acknowledges. Each [`Subscription`] is a stream of results for
//! one operation; dropping it before the operation ends tells the responder
//! to stop. A background driver task owns the connection and routes inbound
//! results to their subscriptions.
//!
//! The driver never waits on a consumer. A subscription whose buffer is full
//! when a result arrives is cancelled and ends with
//! [`SubscriptionError::Overrun`], so one stalled stream cannot hold up its
//! siblings, keep-alive traffic or closing. A ping before the
//! acknowledgment is a protocol violation, as on the responder.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll, ready};

use futures::{Sink, Stream};
use metrics::counter;
use parking_lot::Mutex;
use serde_json::Value;
use subwire_core::{
    CloseCode, ConnectionId, ExecutionResult, Frame, JsonMap, OperationId, ProtocolError,
    ProtocolMessage, Role, SubProtocolKind, SubscribePayload, TransportError,
};
use subwire_protocol::SubProtocol;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::SessionConfig;
use crate::connection::{Connection, ConnectionParts, Flow, Wake};
use crate::errors::{Result, SessionError, SubscriptionError};
use crate::keepalive::KeepAliveResult;
use crate::metrics::GRAPHQL_OPERATIONS_STARTED_TOTAL;
use crate::outbound::{OutboundQueue, WriterEvent};
use crate::registry::{OperationRegistry, OperationState};
use crate::state::ConnectionState;

/// How many locally finished operation ids are remembered, so that late
/// messages for them are ignored instead of treated as violations.
const RETIRED_CAPACITY: usize = 1024;

/// One item of a subscription stream.
pub type SubscriptionItem = std::result::Result<ExecutionResult, SubscriptionError>;

/// Client side of one connection.
///
/// Dropping the client closes the connection; outstanding subscriptions
/// then end.
pub struct Client {
    shared: Arc<Shared>,
}

/// A route from an operation id to its subscription stream.
#[derive(Clone)]
struct Route {
    generation: u64,
    tx: mpsc::Sender<SubscriptionItem>,
    /// Final error yielded once the buffered items are drained.
    tail: Arc<Mutex<Option<SubscriptionError>>>,
}

impl Route {
    /// Deliver the last item of the stream without waiting.
    fn deliver_last(&self, error: SubscriptionError) {
        if let Err(mpsc::error::TrySendError::Full(Err(error))) = self.tx.try_send(Err(error)) {
            *self.tail.lock() = Some(error);
        }
    }
}

/// Recently finished ids, bounded, oldest evicted first.
#[derive(Default)]
struct Retired {
    order: VecDeque<OperationId>,
    ids: HashSet<OperationId>,
}

impl Retired {
    fn insert(&mut self, id: OperationId) {
        if !self.ids.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        if self.order.len() > RETIRED_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                let _ = self.ids.remove(&oldest);
            }
        }
    }

    fn remove(&mut self, id: &OperationId) {
        if self.ids.remove(id) {
            self.order.retain(|other| other != id);
        }
    }

    fn contains(&self, id: &OperationId) -> bool {
        self.ids.contains(id)
    }
}

/// State shared by the client handle, its subscriptions and the driver.
struct Shared {
    id: ConnectionId,
    protocol: Arc<dyn SubProtocol>,
    registry: Arc<OperationRegistry>,
    outbound: OutboundQueue,
    /// Connection scope; cancelled on teardown.
    scope: CancellationToken,
    /// Cancelled to request a graceful close.
    close: CancellationToken,
    state: watch::Receiver<ConnectionState>,
    routes: Mutex<HashMap<OperationId, Route>>,
    retired: Mutex<Retired>,
    failure: Mutex<Option<SessionError>>,
    next_id: AtomicU64,
    operation_buffer: usize,
    driver: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl Shared {
    fn is_acknowledged(&self) -> bool {
        *self.state.borrow() == ConnectionState::Acknowledged
    }

    fn not_connected(&self) -> SubscriptionError {
        match self.failure.lock().clone() {
            Some(failure) => SubscriptionError::Connection(failure),
            None => SubscriptionError::NotConnected,
        }
    }

    fn route(&self, id: &OperationId, generation: u64) -> Option<Route> {
        self.routes
            .lock()
            .get(id)
            .filter(|route| route.generation == generation)
            .cloned()
    }

    /// Drop the route for `id` and remember the id as finished.
    fn retire(&self, id: &OperationId) {
        let _ = self.routes.lock().remove(id);
        self.retired.lock().insert(id.clone());
    }

    /// A message addressed an id with no live operation.
    fn unknown(&self, id: OperationId) -> Flow {
        if self.retired.lock().contains(&id) {
            trace!(operation_id = %id, "message for finished operation ignored");
            Flow::Continue
        } else {
            Flow::fail(ProtocolError::UnknownOperation(id))
        }
    }

    /// Remember why the connection is going away, before it goes.
    fn record(&self, flow: &Flow) {
        let failure = match flow {
            Flow::Fail { error, .. } => error.clone(),
            Flow::PeerClosed(frame) => {
                let (code, reason) = frame
                    .as_ref()
                    .map_or((CloseCode::NORMAL, String::new()), |f| {
                        (f.code, f.reason.clone())
                    });
                SessionError::Closed { code, reason }
            }
            Flow::Continue | Flow::Close { .. } => return,
        };
        let mut slot = self.failure.lock();
        if slot.is_none() {
            *slot = Some(failure);
        }
    }

    /// End every outstanding subscription, delivering the connection
    /// failure (if any) as its last item.
    fn release_routes(&self) {
        let routes: Vec<Route> = self.routes.lock().drain().map(|(_, route)| route).collect();
        let Some(failure) = self.failure.lock().clone() else {
            return;
        };
        for route in routes {
            route.deliver_last(SubscriptionError::Connection(failure.clone()));
        }
    }
}

impl Client {
    /// Open a session over an established transport.
    ///
    /// Sends connection-init with `init_payload` and waits for the
    /// acknowledgment. Fails with the rejection, timeout or transport error
    /// if the handshake does not succeed.
    pub async fn handshake<St, Si>(
        stream: St,
        sink: Si,
        protocol: Arc<dyn SubProtocol>,
        config: SessionConfig,
        init_payload: Option<JsonMap>,
    ) -> Result<Self>
    where
        St: Stream<Item = std::result::Result<Frame, TransportError>> + Send + Unpin + 'static,
        Si: Sink<Frame, Error = TransportError> + Send + Unpin + 'static,
    {
        debug_assert_eq!(protocol.role(), Role::Initiator);
        let (state_tx, state_rx) = watch::channel(ConnectionState::AwaitingInit);
        let registry = Arc::new(OperationRegistry::with_limit(config.max_operations));
        let close = CancellationToken::new();
        let deadline = Instant::now() + config.handshake_timeout;
        let operation_buffer = config.operation_buffer;

        let conn = Connection::start(
            ConnectionParts {
                id: ConnectionId::new(),
                protocol: protocol.clone(),
                config,
                registry: registry.clone(),
                state: state_tx,
                shutdown: close.clone(),
            },
            sink,
        );
        let shared = Arc::new(Shared {
            id: conn.id.clone(),
            protocol,
            registry,
            outbound: conn.outbound.clone(),
            scope: conn.scope.clone(),
            close,
            state: state_rx,
            routes: Mutex::default(),
            retired: Mutex::default(),
            failure: Mutex::default(),
            next_id: AtomicU64::new(1),
            operation_buffer,
            driver: Mutex::default(),
        });

        // A dead writer surfaces as a transport failure in the driver.
        let _ = conn
            .outbound
            .send(ProtocolMessage::ConnectionInit {
                payload: init_payload,
            })
            .await;
        let driver = tokio::spawn(drive(conn, stream, shared.clone(), deadline));
        *shared.driver.lock() = Some(driver);

        let mut state = shared.state.clone();
        let settled = state
            .wait_for(|s| *s != ConnectionState::AwaitingInit)
            .await
            .map(|s| *s);
        if matches!(settled, Ok(ConnectionState::Acknowledged)) {
            return Ok(Self { shared });
        }
        shared.close.cancel();
        let failure = shared.failure.lock().clone();
        Err(failure.unwrap_or_else(|| SessionError::Closed {
            code: CloseCode::NORMAL,
            reason: "connection closed during handshake".into(),
        }))
    }

    /// Connection id used in logs.
    pub fn id(&self) -> &ConnectionId {
        &self.shared.id
    }

    /// Negotiated sub-protocol.
    pub fn protocol(&self) -> SubProtocolKind {
        self.shared.protocol.kind()
    }

    /// Watch the connection state.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.clone()
    }

    /// Number of subscriptions that have not ended yet.
    pub fn active_operations(&self) -> usize {
        self.shared.registry.len()
    }

    /// Start an operation under the next free numeric id.
    pub async fn subscribe(
        &self,
        request: SubscribePayload,
    ) -> std::result::Result<Subscription, SubscriptionError> {
        let next = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribe_with_id(OperationId::from_string(next.to_string()), request)
            .await
    }

    /// Start an operation under a caller-chosen id.
    ///
    /// Fails with [`SubscriptionError::DuplicateId`] while another
    /// subscription with the same id is active.
    #[instrument(skip_all, fields(connection_id = %self.shared.id, operation_id = %id))]
    pub async fn subscribe_with_id(
        &self,
        id: OperationId,
        request: SubscribePayload,
    ) -> std::result::Result<Subscription, SubscriptionError> {
        let shared = &self.shared;
        if !shared.is_acknowledged() {
            return Err(shared.not_connected());
        }
        let ticket = shared.registry.register(id.clone(), &shared.scope)?;
        let generation = ticket.generation;
        let (tx, rx) = mpsc::channel(shared.operation_buffer);
        let tail = Arc::new(Mutex::new(None));
        shared.retired.lock().remove(&id);
        let _ = shared.routes.lock().insert(
            id.clone(),
            Route {
                generation,
                tx,
                tail: tail.clone(),
            },
        );

        // Routes inserted after teardown began would never be released.
        let sent = !shared.scope.is_cancelled()
            && shared.outbound.send_control(ProtocolMessage::Subscribe {
                id: id.clone(),
                payload: request,
            });
        if !sent {
            let _ = shared
                .registry
                .finish(&id, generation, OperationState::Cancelled);
            let _ = shared.routes.lock().remove(&id);
            return Err(shared.not_connected());
        }

        counter!(GRAPHQL_OPERATIONS_STARTED_TOTAL, "protocol" => shared.protocol.name())
            .increment(1);
        debug!("subscribed");
        Ok(Subscription {
            id,
            generation,
            rx,
            tail,
            shared: shared.clone(),
        })
    }

    /// Close the connection gracefully and wait for the driver to finish.
    ///
    /// Returns the failure cause if the connection had already failed.
    pub async fn close(self) -> Result<()> {
        self.shared.close.cancel();
        let driver = self.shared.driver.lock().take();
        match driver {
            Some(driver) => driver.await.unwrap_or_else(|e| {
                Err(TransportError::Io(format!("session driver stopped: {e}")).into())
            }),
            None => Ok(()),
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shared.close.cancel();
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.shared.id)
            .field("protocol", &self.shared.protocol.name())
            .field("state", &*self.shared.state.borrow())
            .finish_non_exhaustive()
    }
}

/// Results of one operation.
///
/// Yields `Ok` for every next, `Err(Operation)` for operation errors and
/// `Err(Connection)` once if the connection fails. Ends after complete or
/// a terminal error, or after `Err(Overrun)` when it was not polled fast
/// enough.
pub struct Subscription {
    id: OperationId,
    generation: u64,
    rx: mpsc::Receiver<SubscriptionItem>,
    tail: Arc<Mutex<Option<SubscriptionError>>>,
    shared: Arc<Shared>,
}

impl Subscription {
    /// Operation id.
    pub fn id(&self) -> &OperationId {
        &self.id
    }
}

impl Stream for Subscription {
    type Item = SubscriptionItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match ready!(self.rx.poll_recv(cx)) {
            Some(item) => Poll::Ready(Some(item)),
            None => Poll::Ready(self.tail.lock().take().map(Err)),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let shared = &self.shared;
        if !shared
            .registry
            .finish(&self.id, self.generation, OperationState::Cancelled)
        {
            return;
        }
        shared.retire(&self.id);
        if shared.is_acknowledged() {
            debug!(operation_id = %self.id, "subscription dropped, sending complete");
            let _ = shared.outbound.send_control(ProtocolMessage::Complete {
                id: self.id.clone(),
            });
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

// ── Driver ──

async fn drive<St>(
    mut conn: Connection,
    mut stream: St,
    shared: Arc<Shared>,
    handshake_deadline: Instant,
) -> Result<()>
where
    St: Stream<Item = std::result::Result<Frame, TransportError>> + Unpin,
{
    let outcome = loop {
        let deadline =
            (conn.state() == ConnectionState::AwaitingInit).then_some(handshake_deadline);
        let flow = match conn.wait(&mut stream, deadline).await {
            Wake::Shutdown => Flow::Close {
                code: CloseCode::NORMAL,
                reason: "client closed",
                notice: conn.protocol.terminate_message(),
            },
            Wake::HandshakeTimeout => Flow::fail(ProtocolError::AckTimeout),
            Wake::KeepAlive(KeepAliveResult::TimedOut) => Flow::fail(ProtocolError::KeepAliveTimeout),
            Wake::KeepAlive(_) => Flow::Continue,
            Wake::Writer(WriterEvent::Transport(e)) => Flow::fail(e),
            Wake::Writer(WriterEvent::Encode(e)) => Flow::fail(e),
            Wake::Frame(None) => Flow::fail(TransportError::Closed),
            Wake::Frame(Some(Err(e))) => Flow::fail(e),
            Wake::Frame(Some(Ok(Frame::Close(frame)))) => Flow::PeerClosed(frame),
            Wake::Frame(Some(Ok(Frame::Text(text)))) => handle_text(&mut conn, &shared, &text).await,
        };
        shared.record(&flow);
        if let Some(outcome) = conn.apply(flow).await {
            break outcome;
        }
    };
    shared.release_routes();
    outcome
}

async fn handle_text(conn: &mut Connection, shared: &Shared, text: &str) -> Flow {
    let message = match conn.protocol.decode(text) {
        Ok(message) => message,
        Err(e) => return Flow::fail(e),
    };
    trace!(kind = %message.kind(), "received");

    match (conn.state(), message) {
        (ConnectionState::AwaitingInit, ProtocolMessage::ConnectionAck { .. }) => {
            let _ = conn.transition(ConnectionState::Acknowledged);
            conn.start_keep_alive();
            info!(connection_id = %conn.id, "connection acknowledged");
            Flow::Continue
        }
        (_, ProtocolMessage::ConnectionError { payload }) => {
            Flow::fail(ProtocolError::InitRejected(rejection_reason(&payload)))
        }
        (_, ProtocolMessage::KeepAlive | ProtocolMessage::Pong { .. }) => Flow::Continue,
        (ConnectionState::Acknowledged, ProtocolMessage::Ping { .. }) => {
            let _ = conn.outbound.send(ProtocolMessage::pong()).await;
            Flow::Continue
        }
        (ConnectionState::Acknowledged, ProtocolMessage::Next { id, payload }) => {
            on_next(conn, shared, id, payload)
        }
        (ConnectionState::Acknowledged, message @ ProtocolMessage::Error { .. }) => {
            on_error(conn, shared, message)
        }
        (ConnectionState::Acknowledged, ProtocolMessage::Complete { id }) => {
            on_complete(conn, shared, id)
        }
        (state, other) => Flow::fail(ProtocolError::Unexpected {
            kind: other.kind(),
            state: state.as_str(),
        }),
    }
}

fn on_next(conn: &Connection, shared: &Shared, id: OperationId, payload: ExecutionResult) -> Flow {
    let Some(generation) = conn.registry.generation(&id) else {
        return shared.unknown(id);
    };
    let _ = conn.registry.mark_streaming(&id, generation);
    if let Some(route) = shared.route(&id, generation) {
        forward(conn, shared, &id, &route, Ok(payload));
    }
    Flow::Continue
}

fn on_error(conn: &Connection, shared: &Shared, message: ProtocolMessage) -> Flow {
    let terminal = conn.protocol.is_terminal(&message);
    let ProtocolMessage::Error { id, payload } = message else {
        return Flow::Continue;
    };
    let Some(generation) = conn.registry.generation(&id) else {
        return shared.unknown(id);
    };
    let Some(route) = shared.route(&id, generation) else {
        return Flow::Continue;
    };
    let error = SubscriptionError::Operation(payload);
    if !terminal {
        forward(conn, shared, &id, &route, Err(error));
    } else if conn.registry.finish(&id, generation, OperationState::Errored) {
        route.deliver_last(error);
        shared.retire(&id);
    }
    Flow::Continue
}

/// Hand one item to a subscription without waiting. A full buffer cancels
/// the operation: the responder is told to stop and the stream ends with
/// [`SubscriptionError::Overrun`] after the items it already holds.
fn forward(
    conn: &Connection,
    shared: &Shared,
    id: &OperationId,
    route: &Route,
    item: SubscriptionItem,
) {
    match route.tx.try_send(item) {
        // A closed receiver means the subscription was dropped; its drop
        // already told the responder.
        Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            if !conn
                .registry
                .finish(id, route.generation, OperationState::Cancelled)
            {
                return;
            }
            warn!(
                operation_id = %id,
                capacity = shared.operation_buffer,
                "subscription fell behind, cancelling"
            );
            *route.tail.lock() = Some(SubscriptionError::Overrun(shared.operation_buffer));
            shared.retire(id);
            let _ = conn
                .outbound
                .send_control(ProtocolMessage::Complete { id: id.clone() });
        }
    }
}

fn on_complete(conn: &Connection, shared: &Shared, id: OperationId) -> Flow {
    let Some(generation) = conn.registry.generation(&id) else {
        return shared.unknown(id);
    };
    if conn
        .registry
        .finish(&id, generation, OperationState::Completed)
    {
        shared.retire(&id);
    }
    Flow::Continue
}

/// Human-readable reason from a legacy `connection_error` payload.
fn rejection_reason(payload: &Value) -> String {
    match payload {
        Value::Null => "connection rejected".to_owned(),
        Value::String(reason) => reason.clone(),
        other => other
            .get("message")
            .and_then(Value::as_str)
            .map_or_else(|| other.to_string(), str::to_owned),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Executor;
    use crate::responder::ResponderSession;
    use crate::testing::{BROKEN, FOREVER, Peer, SLOW, TICKS, TestExecutor, duplex, scripted};
    use assert_matches::assert_matches;
    use futures::StreamExt;
    use serde_json::json;
    use std::time::Duration;
    use subwire_core::LegacyErrorPolicy;
    use subwire_protocol::build_adapter;

    fn adapter(kind: SubProtocolKind, role: Role) -> Arc<dyn SubProtocol> {
        build_adapter(kind, role, LegacyErrorPolicy::default())
    }

    fn quiet() -> SessionConfig {
        SessionConfig {
            keep_alive_interval: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(120),
            ..SessionConfig::default()
        }
    }

    fn ticks(count: u64) -> SubscribePayload {
        let mut variables = JsonMap::new();
        let _ = variables.insert("count".into(), json!(count));
        SubscribePayload::new(TICKS).with_variables(variables)
    }

    struct Pair {
        client: Client,
        executor: Arc<TestExecutor>,
        responder: JoinHandle<Result<()>>,
    }

    /// A client connected to a responder session over an in-memory pipe.
    async fn pair(kind: SubProtocolKind, init_payload: Option<JsonMap>) -> Result<Pair> {
        let (near, far) = duplex();
        let executor = Arc::new(TestExecutor::default());
        let session = ResponderSession::new(
            adapter(kind, Role::Responder),
            executor.clone() as Arc<dyn Executor>,
            quiet(),
        );
        let responder = tokio::spawn(session.run(far.stream, far.sink));
        let client = Client::handshake(
            near.stream,
            near.sink,
            adapter(kind, Role::Initiator),
            quiet(),
            init_payload,
        )
        .await?;
        Ok(Pair {
            client,
            executor,
            responder,
        })
    }

    /// A client whose responder is driven by hand; the handshake is done.
    async fn scripted_pair(kind: SubProtocolKind) -> (Client, Peer) {
        scripted_pair_with(kind, quiet()).await
    }

    async fn scripted_pair_with(kind: SubProtocolKind, config: SessionConfig) -> (Client, Peer) {
        let (mut peer, stream, sink) = scripted();
        let handshake = tokio::spawn(Client::handshake(
            stream,
            sink,
            adapter(kind, Role::Initiator),
            config,
            None,
        ));
        assert_eq!(peer.recv_json().await["type"], "connection_init");
        peer.send(r#"{"type":"connection_ack"}"#);
        (handshake.await.unwrap().unwrap(), peer)
    }

    async fn next_item(subscription: &mut Subscription) -> Option<SubscriptionItem> {
        tokio::time::timeout(Duration::from_secs(5), subscription.next())
            .await
            .expect("timed out waiting for a subscription item")
    }

    // ── Against a responder session ──

    #[tokio::test]
    async fn receives_every_result_then_ends() {
        for kind in SubProtocolKind::ALL {
            let pair = pair(kind, None).await.unwrap();
            assert_eq!(pair.client.protocol(), kind);
            let subscription = pair.client.subscribe(ticks(3)).await.unwrap();
            assert_eq!(subscription.id().as_str(), "1");

            let items: Vec<SubscriptionItem> = subscription.collect().await;
            let ticks: Vec<Value> = items
                .into_iter()
                .map(|item| item.unwrap().data.unwrap()["ticks"].clone())
                .collect();
            assert_eq!(ticks, vec![json!(1), json!(2), json!(3)]);
            assert_eq!(pair.client.active_operations(), 0);

            assert_eq!(pair.client.close().await, Ok(()));
            assert_eq!(pair.responder.await.unwrap(), Ok(()));
        }
    }

    #[tokio::test]
    async fn terminal_error_ends_the_stream() {
        for kind in SubProtocolKind::ALL {
            let pair = pair(kind, None).await.unwrap();
            let mut subscription = pair
                .client
                .subscribe(SubscribePayload::new(BROKEN))
                .await
                .unwrap();
            assert_matches!(next_item(&mut subscription).await, Some(Ok(_)));
            assert_eq!(
                next_item(&mut subscription).await,
                Some(Err(SubscriptionError::Operation(vec![json!({ "message": "boom" })])))
            );
            assert_eq!(next_item(&mut subscription).await, None);
        }
    }

    #[tokio::test]
    async fn dropping_a_subscription_cancels_it_remotely() {
        for kind in SubProtocolKind::ALL {
            let pair = pair(kind, None).await.unwrap();
            let mut subscription = pair
                .client
                .subscribe(SubscribePayload::new(FOREVER))
                .await
                .unwrap();
            assert_matches!(next_item(&mut subscription).await, Some(Ok(_)));
            assert_eq!(pair.client.active_operations(), 1);

            drop(subscription);
            assert_eq!(pair.client.active_operations(), 0);
            let token = pair.executor.token("1");
            tokio::time::timeout(Duration::from_secs(5), token.cancelled())
                .await
                .expect("responder never saw the cancellation");
        }
    }

    #[tokio::test]
    async fn concurrent_subscriptions_are_independent() {
        let pair = pair(SubProtocolKind::Current, None).await.unwrap();
        let slow = pair.client.subscribe(SubscribePayload::new(SLOW)).await.unwrap();
        let fast = pair.client.subscribe(ticks(2)).await.unwrap();
        let (slow, fast): (Vec<_>, Vec<_>) = futures::join!(slow.collect(), fast.collect());
        assert_eq!(slow.len(), 3);
        assert_eq!(fast.len(), 2);
        assert!(slow.iter().chain(fast.iter()).all(std::result::Result::is_ok));
    }

    #[tokio::test]
    async fn duplicate_local_id_is_refused() {
        let pair = pair(SubProtocolKind::Current, None).await.unwrap();
        let _first = pair
            .client
            .subscribe_with_id("a".into(), SubscribePayload::new(FOREVER))
            .await
            .unwrap();
        assert_matches!(
            pair.client
                .subscribe_with_id("a".into(), SubscribePayload::new(FOREVER))
                .await,
            Err(SubscriptionError::DuplicateId(id)) if id.as_str() == "a"
        );
    }

    #[tokio::test]
    async fn rejected_init_surfaces_as_handshake_error() {
        let mut payload = JsonMap::new();
        let _ = payload.insert("token".into(), json!("bad"));

        let err = pair(SubProtocolKind::Current, Some(payload.clone()))
            .await
            .err()
            .unwrap();
        assert_eq!(
            err,
            SessionError::Closed {
                code: CloseCode::FORBIDDEN,
                reason: "connection init rejected: invalid token".into(),
            }
        );

        let err = pair(SubProtocolKind::Legacy, Some(payload)).await.err().unwrap();
        assert_eq!(
            err,
            SessionError::Protocol(ProtocolError::InitRejected("invalid token".into()))
        );
    }

    // ── Against a scripted responder ──

    #[tokio::test(start_paused = true)]
    async fn missing_ack_times_out() {
        let (mut peer, stream, sink) = scripted();
        let handshake = tokio::spawn(Client::handshake(
            stream,
            sink,
            adapter(SubProtocolKind::Current, Role::Initiator),
            quiet(),
            None,
        ));
        assert_eq!(peer.recv_json().await["type"], "connection_init");
        assert_eq!(peer.recv_close().await.code, CloseCode::CONNECTION_ACK_TIMEOUT);
        assert_eq!(
            handshake.await.unwrap().err(),
            Some(SessionError::Protocol(ProtocolError::AckTimeout))
        );
    }

    #[tokio::test]
    async fn next_for_unknown_operation_fails_connection() {
        let (client, mut peer) = scripted_pair(SubProtocolKind::Current).await;
        peer.send(r#"{"type":"next","id":"9","payload":{"data":{}}}"#);
        assert_eq!(peer.recv_close().await.code, CloseCode::BAD_REQUEST);
        assert_eq!(
            client.close().await,
            Err(SessionError::Protocol(ProtocolError::UnknownOperation("9".into())))
        );
    }

    #[tokio::test]
    async fn late_messages_for_dropped_subscription_are_ignored() {
        let (client, mut peer) = scripted_pair(SubProtocolKind::Current).await;
        let subscription = client.subscribe(SubscribePayload::new(FOREVER)).await.unwrap();
        assert_eq!(peer.recv_json().await["type"], "subscribe");
        drop(subscription);
        assert_eq!(peer.recv_json().await, json!({ "type": "complete", "id": "1" }));

        peer.send(r#"{"type":"next","id":"1","payload":{"data":{}}}"#);
        peer.send(r#"{"type":"ping"}"#);
        assert_eq!(peer.recv_json().await, json!({ "type": "pong" }));
        assert_eq!(*client.state().borrow(), ConnectionState::Acknowledged);
    }

    #[tokio::test]
    async fn stalled_subscription_does_not_hold_up_siblings() {
        let config = SessionConfig {
            operation_buffer: 1,
            ..quiet()
        };
        let (client, mut peer) = scripted_pair_with(SubProtocolKind::Current, config).await;
        let mut stalled = client.subscribe(SubscribePayload::new(FOREVER)).await.unwrap();
        let mut sibling = client.subscribe(SubscribePayload::new(FOREVER)).await.unwrap();
        assert_eq!(peer.recv_json().await["id"], "1");
        assert_eq!(peer.recv_json().await["id"], "2");

        for n in 1..=3 {
            peer.send_json(&json!({ "type": "next", "id": "1", "payload": { "data": { "n": n } } }));
        }
        peer.send(r#"{"type":"next","id":"2","payload":{"data":{"n":1}}}"#);
        peer.send(r#"{"type":"ping"}"#);

        assert_eq!(peer.recv_json().await, json!({ "type": "complete", "id": "1" }));
        assert_eq!(peer.recv_json().await, json!({ "type": "pong" }));
        assert_matches!(next_item(&mut sibling).await, Some(Ok(_)));

        assert_matches!(next_item(&mut stalled).await, Some(Ok(_)));
        assert_eq!(
            next_item(&mut stalled).await,
            Some(Err(SubscriptionError::Overrun(1)))
        );
        assert_eq!(next_item(&mut stalled).await, None);
        assert_eq!(client.active_operations(), 1);

        drop(sibling);
        tokio::time::timeout(Duration::from_secs(5), client.close())
            .await
            .expect("close waited on a stalled subscription")
            .unwrap();
    }

    #[tokio::test]
    async fn reused_id_is_sent_after_its_own_complete() {
        let (client, mut peer) = scripted_pair(SubProtocolKind::Current).await;
        let first = client
            .subscribe_with_id("x".into(), SubscribePayload::new(FOREVER))
            .await
            .unwrap();
        assert_eq!(peer.recv_json().await["type"], "subscribe");

        drop(first);
        let _second = client
            .subscribe_with_id("x".into(), SubscribePayload::new(TICKS))
            .await
            .unwrap();
        assert_eq!(peer.recv_json().await, json!({ "type": "complete", "id": "x" }));
        let resubscribe = peer.recv_json().await;
        assert_eq!(resubscribe["type"], "subscribe");
        assert_eq!(resubscribe["payload"]["query"], TICKS);
    }

    #[tokio::test]
    async fn ping_before_ack_fails_the_handshake() {
        let (mut peer, stream, sink) = scripted();
        let handshake = tokio::spawn(Client::handshake(
            stream,
            sink,
            adapter(SubProtocolKind::Current, Role::Initiator),
            quiet(),
            None,
        ));
        assert_eq!(peer.recv_json().await["type"], "connection_init");
        peer.send(r#"{"type":"ping"}"#);
        assert_eq!(peer.recv_close().await.code, CloseCode::BAD_REQUEST);
        assert_matches!(
            handshake.await.unwrap().err(),
            Some(SessionError::Protocol(ProtocolError::Unexpected { .. }))
        );
    }

    #[tokio::test]
    async fn legacy_unsubscribe_sends_stop() {
        let (client, mut peer) = scripted_pair(SubProtocolKind::Legacy).await;
        let subscription = client.subscribe(SubscribePayload::new(FOREVER)).await.unwrap();
        assert_eq!(peer.recv_json().await["type"], "start");
        drop(subscription);
        assert_eq!(peer.recv_json().await, json!({ "type": "stop", "id": "1" }));

        drop(client);
        assert_eq!(
            peer.recv_json().await,
            json!({ "type": "connection_terminate" })
        );
        assert_eq!(peer.recv_close().await.code, CloseCode::NORMAL);
    }

    #[tokio::test]
    async fn server_close_reaches_open_subscriptions() {
        let (client, mut peer) = scripted_pair(SubProtocolKind::Current).await;
        let mut subscription = client.subscribe(SubscribePayload::new(FOREVER)).await.unwrap();
        assert_eq!(peer.recv_json().await["type"], "subscribe");

        peer.send_close(CloseCode::GOING_AWAY, "restarting");
        let expected = SessionError::Closed {
            code: CloseCode::GOING_AWAY,
            reason: "restarting".into(),
        };
        assert_eq!(
            next_item(&mut subscription).await,
            Some(Err(SubscriptionError::Connection(expected.clone())))
        );
        assert_eq!(next_item(&mut subscription).await, None);
        assert_eq!(
            client.subscribe(SubscribePayload::new(TICKS)).await.err(),
            Some(SubscriptionError::Connection(expected))
        );
    }

    #[tokio::test]
    async fn operation_error_without_terminal_keeps_legacy_stream_open() {
        let (client, mut peer) = scripted_pair(SubProtocolKind::Legacy).await;
        let mut subscription = client.subscribe(SubscribePayload::new(FOREVER)).await.unwrap();
        assert_eq!(peer.recv_json().await["type"], "start");

        peer.send(r#"{"type":"error","id":"1","payload":[{"message":"bad","path":["a"]}]}"#);
        peer.send(r#"{"type":"data","id":"1","payload":{"data":{"a":1}}}"#);
        assert_matches!(
            next_item(&mut subscription).await,
            Some(Err(SubscriptionError::Operation(_)))
        );
        assert_matches!(next_item(&mut subscription).await, Some(Ok(_)));
        peer.send(r#"{"type":"complete","id":"1"}"#);
        assert_eq!(next_item(&mut subscription).await, None);
    }

    #[test]
    fn rejection_reason_prefers_message() {
        assert_eq!(
            rejection_reason(&json!({ "message": "bad token" })),
            "bad token"
        );
        assert_eq!(rejection_reason(&json!("nope")), "nope");
        assert_eq!(rejection_reason(&Value::Null), "connection rejected");
        assert_eq!(rejection_reason(&json!({ "code": 7 })), r#"{"code":7}"#);
    }

    #[test]
    fn retired_ids_are_bounded() {
        let mut retired = Retired::default();
        for i in 0..=RETIRED_CAPACITY {
            retired.insert(OperationId::from_string(i.to_string()));
        }
        assert!(!retired.contains(&"0".into()));
        assert!(retired.contains(&"1".into()));
        assert_eq!(retired.order.len(), RETIRED_CAPACITY);

        retired.remove(&"1".into());
        assert!(!retired.contains(&"1".into()));
        assert_eq!(retired.order.len(), RETIRED_CAPACITY - 1);
    }
}
