//! The execution-engine boundary on the responder side.
//!
//! The session never interprets queries. It hands each accepted subscribe to
//! an [`Executor`] and drains the returned stream.

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::{Value, json};
use subwire_core::{ExecutionResult, JsonMap, OperationId, SubscribePayload};
use tokio_util::sync::CancellationToken;

/// Lazy result sequence of one operation.
///
/// Dropping the stream releases the producer.
pub type ResultStream = BoxStream<'static, Result<ExecutionResult, OperationFailure>>;

/// An operation-scoped failure, sent to the peer verbatim as an "error".
#[derive(Clone, Debug, PartialEq)]
pub struct OperationFailure {
    /// GraphQL error objects.
    pub errors: Vec<Value>,
}

impl OperationFailure {
    /// Failure carrying the given error objects.
    pub fn new(errors: Vec<Value>) -> Self {
        Self { errors }
    }

    /// Failure with a single `{"message": ...}` error.
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            errors: vec![json!({ "message": message.into() })],
        }
    }
}

impl fmt::Display for OperationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} operation error(s)", self.errors.len())
    }
}

impl std::error::Error for OperationFailure {}

/// Outcome of the connection-init hook: an optional ack payload, or the
/// rejection reason.
pub type InitDecision = Result<Option<JsonMap>, String>;

/// Executes accepted operations for a responder session.
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    /// Decide whether to acknowledge a connection-init.
    ///
    /// The default accepts every init with an empty ack payload.
    async fn accept_init(&self, _payload: Option<JsonMap>) -> InitDecision {
        Ok(None)
    }

    /// Start executing an operation.
    ///
    /// `cancel` fires when the peer unsubscribes or the connection closes;
    /// producers should stop promptly. The stream is dropped either way.
    fn execute(
        &self,
        id: &OperationId,
        request: SubscribePayload,
        cancel: CancellationToken,
    ) -> ResultStream;
}
