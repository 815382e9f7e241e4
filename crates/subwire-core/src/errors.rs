//! Wire-level protocol violations and the close codes they map to.
//!
//! Every [`ProtocolError`] is fatal to the connection it occurred on. The
//! session closes the socket with [`ProtocolError::close_code`] and the
//! error's display string as the close reason. Operation-scoped failures are
//! not protocol errors; they travel as "error" messages instead.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::OperationId;
use crate::message::MessageKind;

/// WebSocket close code sent when a connection is torn down.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CloseCode(pub u16);

impl CloseCode {
    /// Graceful close.
    pub const NORMAL: Self = Self(1000);
    /// Endpoint is going away (server shutdown).
    pub const GOING_AWAY: Self = Self(1001);
    /// Keep-alive deadline elapsed without traffic.
    pub const KEEP_ALIVE_TIMEOUT: Self = Self(1011);
    /// Malformed or unexpected message.
    pub const BAD_REQUEST: Self = Self(4400);
    /// Operation attempted before the handshake completed.
    pub const UNAUTHORIZED: Self = Self(4401);
    /// Connection init rejected by the init handler.
    pub const FORBIDDEN: Self = Self(4403);
    /// No sub-protocol in common.
    pub const SUBPROTOCOL_NOT_ACCEPTABLE: Self = Self(4406);
    /// Initiator never sent connection-init in time.
    pub const CONNECTION_INIT_TIMEOUT: Self = Self(4408);
    /// Subscribe reused an id that is still active.
    pub const SUBSCRIBER_ALREADY_EXISTS: Self = Self(4409);
    /// A second connection-init on an acknowledged connection.
    pub const TOO_MANY_INIT_REQUESTS: Self = Self(4429);
    /// The initiator terminated the connection on purpose.
    pub const TERMINATED: Self = Self(4499);
    /// Unexpected failure on the responder.
    pub const INTERNAL_SERVER_ERROR: Self = Self(4500);
    /// Responder never acknowledged connection-init in time.
    pub const CONNECTION_ACK_TIMEOUT: Self = Self(4504);

    /// Numeric value.
    #[must_use]
    pub fn as_u16(self) -> u16 {
        self.0
    }

    /// Whether this code denotes an orderly shutdown rather than a failure.
    #[must_use]
    pub fn is_graceful(self) -> bool {
        matches!(self, Self::NORMAL | Self::GOING_AWAY | Self::TERMINATED)
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        Self(code)
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A violation of the negotiated sub-protocol.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame is not valid JSON or lacks a required field.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// The `type` field names a message this sub-protocol does not define.
    #[error("unknown message type '{0}'")]
    UnknownMessageType(String),

    /// The message exists in the internal union but not in this sub-protocol.
    #[error("{kind} is not supported by {protocol}")]
    Unsupported {
        /// Kind of the offending message.
        kind: MessageKind,
        /// Sub-protocol name.
        protocol: &'static str,
    },

    /// The message is valid but not allowed in the current state or role.
    #[error("unexpected {kind} while {state}")]
    Unexpected {
        /// Kind of the offending message.
        kind: MessageKind,
        /// Connection state the message arrived in.
        state: &'static str,
    },

    /// A message other than connection-init arrived before acknowledgment.
    #[error("{0} received before connection was acknowledged")]
    NotAcknowledged(MessageKind),

    /// A second connection-init arrived after acknowledgment.
    #[error("too many initialisation requests")]
    DuplicateInit,

    /// Subscribe reused the id of a still-active operation.
    #[error("subscriber for {0} already exists")]
    DuplicateOperation(OperationId),

    /// A per-operation message referenced an id with no live operation.
    #[error("no active operation with id {0}")]
    UnknownOperation(OperationId),

    /// The connection-init payload was refused.
    #[error("connection init rejected: {0}")]
    InitRejected(String),

    /// No connection-init arrived before the handshake deadline.
    #[error("connection initialisation timeout")]
    InitTimeout,

    /// No connection-ack arrived before the handshake deadline.
    #[error("connection acknowledgement timeout")]
    AckTimeout,

    /// No traffic arrived within the keep-alive idle timeout.
    #[error("keep-alive timeout")]
    KeepAliveTimeout,

    /// An outbound message could not be encoded.
    #[error("failed to encode message: {0}")]
    Encode(String),
}

impl ProtocolError {
    /// Close code used when this violation tears down the connection.
    #[must_use]
    pub fn close_code(&self) -> CloseCode {
        match self {
            Self::Malformed(_)
            | Self::UnknownMessageType(_)
            | Self::Unsupported { .. }
            | Self::Unexpected { .. }
            | Self::UnknownOperation(_) => CloseCode::BAD_REQUEST,
            Self::NotAcknowledged(_) => CloseCode::UNAUTHORIZED,
            Self::DuplicateInit => CloseCode::TOO_MANY_INIT_REQUESTS,
            Self::DuplicateOperation(_) => CloseCode::SUBSCRIBER_ALREADY_EXISTS,
            Self::InitRejected(_) => CloseCode::FORBIDDEN,
            Self::InitTimeout => CloseCode::CONNECTION_INIT_TIMEOUT,
            Self::AckTimeout => CloseCode::CONNECTION_ACK_TIMEOUT,
            Self::KeepAliveTimeout => CloseCode::KEEP_ALIVE_TIMEOUT,
            Self::Encode(_) => CloseCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether this is a timeout rather than a message-level violation.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::InitTimeout | Self::AckTimeout | Self::KeepAliveTimeout
        )
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        Self::Malformed(e.to_string())
    }
}

/// Result type for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_codes_match_wire_values() {
        assert_eq!(ProtocolError::Malformed("x".into()).close_code().as_u16(), 4400);
        assert_eq!(
            ProtocolError::NotAcknowledged(MessageKind::Subscribe).close_code(),
            CloseCode::UNAUTHORIZED
        );
        assert_eq!(ProtocolError::DuplicateInit.close_code().as_u16(), 4429);
        assert_eq!(
            ProtocolError::DuplicateOperation("3".into()).close_code().as_u16(),
            4409
        );
        assert_eq!(ProtocolError::InitRejected("no".into()).close_code().as_u16(), 4403);
        assert_eq!(ProtocolError::InitTimeout.close_code().as_u16(), 4408);
        assert_eq!(ProtocolError::AckTimeout.close_code().as_u16(), 4504);
        assert_eq!(ProtocolError::KeepAliveTimeout.close_code().as_u16(), 1011);
    }

    #[test]
    fn duplicate_operation_display() {
        let err = ProtocolError::DuplicateOperation("3".into());
        assert_eq!(err.to_string(), "subscriber for 3 already exists");
    }

    #[test]
    fn unsupported_display_names_protocol() {
        let err = ProtocolError::Unsupported {
            kind: MessageKind::Ping,
            protocol: "graphql-ws",
        };
        assert_eq!(err.to_string(), "ping is not supported by graphql-ws");
    }

    #[test]
    fn timeouts_are_flagged() {
        assert!(ProtocolError::InitTimeout.is_timeout());
        assert!(ProtocolError::KeepAliveTimeout.is_timeout());
        assert!(!ProtocolError::DuplicateInit.is_timeout());
    }

    #[test]
    fn json_error_becomes_malformed() {
        let json_err = serde_json::from_str::<serde_json::Value>("{bad").unwrap_err();
        let err: ProtocolError = json_err.into();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn graceful_codes() {
        assert!(CloseCode::NORMAL.is_graceful());
        assert!(CloseCode::TERMINATED.is_graceful());
        assert!(!CloseCode::BAD_REQUEST.is_graceful());
        assert_eq!(CloseCode::from(4500), CloseCode::INTERNAL_SERVER_ERROR);
    }
}
