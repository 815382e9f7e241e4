//! In-memory transport, a scripted peer and a test executor.

use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc as fmpsc;
use futures::{SinkExt, StreamExt, stream};
use parking_lot::Mutex;
use serde_json::{Value, json};
use subwire_core::{
    CloseCode, CloseFrame, ExecutionResult, Frame, JsonMap, OperationId, SubscribePayload,
    TransportError,
};
use tokio_util::sync::CancellationToken;

use crate::executor::{Executor, InitDecision, OperationFailure, ResultStream};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) type FrameStream =
    stream::Map<fmpsc::UnboundedReceiver<Frame>, fn(Frame) -> Result<Frame, TransportError>>;
pub(crate) type FrameSink = futures::sink::SinkMapErr<
    fmpsc::UnboundedSender<Frame>,
    fn(fmpsc::SendError) -> TransportError,
>;

fn wrap(frame: Frame) -> Result<Frame, TransportError> {
    Ok(frame)
}

fn closed(_: fmpsc::SendError) -> TransportError {
    TransportError::Closed
}

/// One direction of an in-memory connection.
pub(crate) fn pipe() -> (FrameSink, FrameStream) {
    let (tx, rx) = fmpsc::unbounded();
    let closed: fn(fmpsc::SendError) -> TransportError = closed;
    let wrap: fn(Frame) -> Result<Frame, TransportError> = wrap;
    (tx.sink_map_err(closed), rx.map(wrap))
}

/// One end of an in-memory connection.
pub(crate) struct End {
    pub stream: FrameStream,
    pub sink: FrameSink,
}

/// Two connected ends.
pub(crate) fn duplex() -> (End, End) {
    let (a_sink, b_stream) = pipe();
    let (b_sink, a_stream) = pipe();
    (
        End {
            stream: a_stream,
            sink: a_sink,
        },
        End {
            stream: b_stream,
            sink: b_sink,
        },
    )
}

/// A hand-driven peer speaking raw JSON to a session under test.
pub(crate) struct Peer {
    tx: fmpsc::UnboundedSender<Frame>,
    rx: fmpsc::UnboundedReceiver<Frame>,
}

/// A peer plus the transport halves to hand to the session.
pub(crate) fn scripted() -> (Peer, FrameStream, FrameSink) {
    let (tx, session_rx) = fmpsc::unbounded::<Frame>();
    let (session_tx, rx) = fmpsc::unbounded::<Frame>();
    let closed: fn(fmpsc::SendError) -> TransportError = closed;
    let wrap: fn(Frame) -> Result<Frame, TransportError> = wrap;
    (
        Peer { tx, rx },
        session_rx.map(wrap),
        session_tx.sink_map_err(closed),
    )
}

impl Peer {
    pub(crate) fn send(&self, text: &str) {
        self.tx.unbounded_send(Frame::text(text)).unwrap();
    }

    pub(crate) fn send_json(&self, value: &Value) {
        self.send(&value.to_string());
    }

    pub(crate) fn send_close(&self, code: CloseCode, reason: &str) {
        self.tx.unbounded_send(Frame::close(code, reason)).unwrap();
    }

    /// Drop the connection without a close frame.
    pub(crate) fn hang_up(&self) {
        self.tx.close_channel();
    }

    /// Next frame the session wrote, `None` once its sink is closed.
    pub(crate) async fn next_frame(&mut self) -> Option<Frame> {
        tokio::time::timeout(RECV_TIMEOUT, self.rx.next())
            .await
            .expect("timed out waiting for a frame")
    }

    pub(crate) async fn recv_json(&mut self) -> Value {
        match self.next_frame().await {
            Some(Frame::Text(text)) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected a text frame, got {other:?}"),
        }
    }

    /// Skip text frames until the close frame arrives.
    pub(crate) async fn recv_close(&mut self) -> CloseFrame {
        loop {
            match self.next_frame().await {
                Some(Frame::Text(_)) => {}
                Some(Frame::Close(Some(frame))) => return frame,
                other => panic!("expected a close frame, got {other:?}"),
            }
        }
    }

    /// Complete the handshake of a graphql-transport-ws responder.
    pub(crate) async fn init(&mut self) {
        self.send(r#"{"type":"connection_init"}"#);
        assert_eq!(
            self.recv_json().await,
            json!({ "type": "connection_ack", "payload": {} })
        );
    }

    pub(crate) fn subscribe(&self, id: &str, query: &str) {
        self.send_json(&json!({
            "type": "subscribe",
            "id": id,
            "payload": { "query": query },
        }));
    }
}

pub(crate) const TICKS: &str = "subscription { ticks }";
pub(crate) const FOREVER: &str = "subscription { forever }";
pub(crate) const BROKEN: &str = "subscription { broken }";
pub(crate) const SLOW: &str = "subscription { slow }";

/// Executor with canned operations; records every cancellation token.
#[derive(Default)]
pub(crate) struct TestExecutor {
    pub tokens: Mutex<Vec<(OperationId, CancellationToken)>>,
}

impl TestExecutor {
    pub(crate) fn token(&self, id: &str) -> CancellationToken {
        self.tokens
            .lock()
            .iter()
            .rev()
            .find(|(op, _)| op.as_str() == id)
            .map(|(_, token)| token.clone())
            .expect("operation was never executed")
    }
}

fn tick(n: u64) -> Result<ExecutionResult, OperationFailure> {
    Ok(ExecutionResult::data(json!({ "ticks": n })))
}

#[async_trait]
impl Executor for TestExecutor {
    async fn accept_init(&self, payload: Option<JsonMap>) -> InitDecision {
        match payload
            .as_ref()
            .and_then(|p| p.get("token"))
            .and_then(Value::as_str)
        {
            Some("bad") => Err("invalid token".into()),
            Some(token) => {
                let mut ack = JsonMap::new();
                let _ = ack.insert("user".into(), json!(token));
                Ok(Some(ack))
            }
            None => Ok(None),
        }
    }

    fn execute(
        &self,
        id: &OperationId,
        request: SubscribePayload,
        cancel: CancellationToken,
    ) -> ResultStream {
        self.tokens.lock().push((id.clone(), cancel));
        let count = request
            .variables
            .as_ref()
            .and_then(|v| v.get("count"))
            .and_then(Value::as_u64)
            .unwrap_or(3);
        match request.query.as_str() {
            TICKS => stream::iter((1..=count).map(tick)).boxed(),
            FOREVER => stream::iter([tick(1)]).chain(stream::pending()).boxed(),
            BROKEN => stream::iter([tick(1), Err(OperationFailure::message("boom"))]).boxed(),
            SLOW => async_stream::stream! {
                for n in 1..=count {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    yield tick(n);
                }
            }
            .boxed(),
            other => stream::iter([Err(OperationFailure::message(format!(
                "unknown query: {other}"
            )))])
            .boxed(),
        }
    }
}
