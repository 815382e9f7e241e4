//! Session, registry and subscription errors.

use serde_json::Value;
use subwire_core::{CloseCode, OperationId, ProtocolError, TransportError};
use thiserror::Error;

/// Why a connection ended abnormally.
///
/// Cloneable so the same cause can be delivered to every outstanding
/// subscription on the connection.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    /// Protocol violation or timeout detected locally.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The underlying transport failed or vanished.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The peer closed the connection.
    #[error("connection closed by peer ({code}): {reason}")]
    Closed {
        /// Close code sent by the peer.
        code: CloseCode,
        /// Close reason sent by the peer.
        reason: String,
    },
}

impl SessionError {
    /// Close code describing this failure.
    #[must_use]
    pub fn close_code(&self) -> CloseCode {
        match self {
            Self::Protocol(e) => e.close_code(),
            Self::Transport(_) => CloseCode::INTERNAL_SERVER_ERROR,
            Self::Closed { code, .. } => *code,
        }
    }
}

/// Result type for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Rejections from the operation registry.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The id belongs to an operation that has not terminated yet.
    #[error("operation {0} is already active")]
    Duplicate(OperationId),

    /// The connection already runs its maximum number of operations.
    #[error("operation limit of {0} reached")]
    LimitReached(usize),
}

/// An item error on an initiator-side subscription stream.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum SubscriptionError {
    /// The responder reported an operation error; payload is verbatim.
    #[error("operation failed: {}", summarize(.0))]
    Operation(Vec<Value>),

    /// The connection failed; every outstanding subscription gets the same cause.
    #[error("connection failed: {0}")]
    Connection(SessionError),

    /// The requested id is already used by an active subscription.
    #[error("operation id {0} is already active")]
    DuplicateId(OperationId),

    /// The connection already runs its maximum number of operations.
    #[error("operation limit of {0} reached")]
    TooManyOperations(usize),

    /// The consumer fell behind by more than the buffer holds; the
    /// operation was cancelled.
    #[error("subscription buffer of {0} results overflowed")]
    Overrun(usize),

    /// The connection is no longer accepting operations.
    #[error("connection is closed")]
    NotConnected,
}

impl From<RegistryError> for SubscriptionError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Duplicate(id) => Self::DuplicateId(id),
            RegistryError::LimitReached(limit) => Self::TooManyOperations(limit),
        }
    }
}

fn summarize(errors: &[Value]) -> String {
    let messages: Vec<&str> = errors
        .iter()
        .filter_map(|e| e.get("message").and_then(Value::as_str))
        .collect();
    if messages.is_empty() {
        format!("{} error(s)", errors.len())
    } else {
        messages.join("; ")
    }
}
