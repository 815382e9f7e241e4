//! Protocol-neutral message union.
//!
//! Both sub-protocols decode into and encode from [`ProtocolMessage`]. The
//! union is a superset: the legacy vocabulary contributes
//! [`ProtocolMessage::KeepAlive`], [`ProtocolMessage::ConnectionError`] and
//! [`ProtocolMessage::ConnectionTerminate`], the current vocabulary
//! contributes ping/pong. Which variants exist on the wire is decided by the
//! adapter, never by the session.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::OperationId;

/// JSON object used for auxiliary payloads and variables.
pub type JsonMap = serde_json::Map<String, Value>;

/// Payload of a subscribe (legacy: `start`) message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribePayload {
    /// GraphQL document text.
    pub query: String,
    /// Variable values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<JsonMap>,
    /// Operation to run when the document holds several.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
    /// Protocol extensions (persisted queries and the like).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<JsonMap>,
}

impl SubscribePayload {
    /// Payload with just a query.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            variables: None,
            operation_name: None,
            extensions: None,
        }
    }

    /// Attach variables.
    #[must_use]
    pub fn with_variables(mut self, variables: JsonMap) -> Self {
        self.variables = Some(variables);
        self
    }

    /// Attach an operation name.
    #[must_use]
    pub fn with_operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }
}

/// One execution result carried by a next (legacy: `data`) message.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Result data; absent when execution produced none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Field errors that accompanied this result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<Value>>,
    /// Response extensions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<JsonMap>,
}

impl ExecutionResult {
    /// Result carrying only data.
    pub fn data(data: Value) -> Self {
        Self {
            data: Some(data),
            errors: None,
            extensions: None,
        }
    }

    /// Attach field errors.
    #[must_use]
    pub fn with_errors(mut self, errors: Vec<Value>) -> Self {
        self.errors = Some(errors);
        self
    }
}

/// Discriminant of a [`ProtocolMessage`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// `connection_init`
    ConnectionInit,
    /// `connection_ack`
    ConnectionAck,
    /// Legacy `connection_error`.
    ConnectionError,
    /// Legacy `connection_terminate`.
    ConnectionTerminate,
    /// Legacy `ka`.
    KeepAlive,
    /// `ping`
    Ping,
    /// `pong`
    Pong,
    /// `subscribe` / legacy `start`.
    Subscribe,
    /// `next` / legacy `data`.
    Next,
    /// `error`
    Error,
    /// `complete` / legacy `stop`.
    Complete,
}

impl MessageKind {
    /// Normalized, protocol-neutral name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConnectionInit => "connection-init",
            Self::ConnectionAck => "connection-ack",
            Self::ConnectionError => "connection-error",
            Self::ConnectionTerminate => "connection-terminate",
            Self::KeepAlive => "keep-alive",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Subscribe => "subscribe",
            Self::Next => "next",
            Self::Error => "error",
            Self::Complete => "complete",
        }
    }

    /// Whether messages of this kind are addressed to one operation.
    #[must_use]
    pub fn is_operation_scoped(self) -> bool {
        matches!(
            self,
            Self::Subscribe | Self::Next | Self::Error | Self::Complete
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded protocol message.
#[derive(Clone, Debug, PartialEq)]
pub enum ProtocolMessage {
    /// Initiator opens the handshake.
    ConnectionInit {
        /// Auxiliary payload (auth tokens and the like).
        payload: Option<JsonMap>,
    },
    /// Responder accepts the handshake.
    ConnectionAck {
        /// Auxiliary payload.
        payload: Option<JsonMap>,
    },
    /// Legacy responder refuses the handshake.
    ConnectionError {
        /// Error description, any JSON.
        payload: Value,
    },
    /// Legacy initiator asks for a graceful close.
    ConnectionTerminate,
    /// Legacy unidirectional keep-alive.
    KeepAlive,
    /// Liveness probe.
    Ping {
        /// Auxiliary payload.
        payload: Option<JsonMap>,
    },
    /// Liveness answer.
    Pong {
        /// Auxiliary payload.
        payload: Option<JsonMap>,
    },
    /// Start an operation.
    Subscribe {
        /// Operation id chosen by the initiator.
        id: OperationId,
        /// Query, variables and operation name.
        payload: SubscribePayload,
    },
    /// One result of an operation.
    Next {
        /// Operation id.
        id: OperationId,
        /// Execution result.
        payload: ExecutionResult,
    },
    /// Operation failure, passed through verbatim from the execution engine.
    Error {
        /// Operation id.
        id: OperationId,
        /// GraphQL error objects.
        payload: Vec<Value>,
    },
    /// End of an operation (either direction).
    Complete {
        /// Operation id.
        id: OperationId,
    },
}

impl ProtocolMessage {
    /// The message's discriminant.
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::ConnectionInit { .. } => MessageKind::ConnectionInit,
            Self::ConnectionAck { .. } => MessageKind::ConnectionAck,
            Self::ConnectionError { .. } => MessageKind::ConnectionError,
            Self::ConnectionTerminate => MessageKind::ConnectionTerminate,
            Self::KeepAlive => MessageKind::KeepAlive,
            Self::Ping { .. } => MessageKind::Ping,
            Self::Pong { .. } => MessageKind::Pong,
            Self::Subscribe { .. } => MessageKind::Subscribe,
            Self::Next { .. } => MessageKind::Next,
            Self::Error { .. } => MessageKind::Error,
            Self::Complete { .. } => MessageKind::Complete,
        }
    }

    /// Operation id for operation-scoped messages.
    #[must_use]
    pub fn operation_id(&self) -> Option<&OperationId> {
        match self {
            Self::Subscribe { id, .. }
            | Self::Next { id, .. }
            | Self::Error { id, .. }
            | Self::Complete { id } => Some(id),
            _ => None,
        }
    }

    /// Shorthand for a payload-less ping.
    #[must_use]
    pub fn ping() -> Self {
        Self::Ping { payload: None }
    }

    /// Shorthand for a payload-less pong.
    #[must_use]
    pub fn pong() -> Self {
        Self::Pong { payload: None }
    }
}
