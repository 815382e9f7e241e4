//! Frames exchanged with the underlying duplex transport.
//!
//! The byte-level framing belongs to the WebSocket library. Sessions only
//! see text frames and a final close frame, and report transport failures
//! through [`TransportError`].

use thiserror::Error;

use crate::errors::CloseCode;

/// Close code and reason carried by a close frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseFrame {
    /// Close code.
    pub code: CloseCode,
    /// Human-readable reason (truncated by the transport if too long).
    pub reason: String,
}

impl CloseFrame {
    /// Build a close frame.
    pub fn new(code: CloseCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// One frame read from or written to the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// A text frame holding one protocol message.
    Text(String),
    /// Close handshake. `None` when the peer closed without a code.
    Close(Option<CloseFrame>),
}

impl Frame {
    /// Text frame from anything string-like.
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    /// Close frame with code and reason.
    pub fn close(code: CloseCode, reason: impl Into<String>) -> Self {
        Self::Close(Some(CloseFrame::new(code, reason)))
    }
}

/// Failure of the underlying transport.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The socket was closed or reset underneath the session.
    #[error("connection closed")]
    Closed,
    /// Any other I/O or WebSocket failure.
    #[error("transport failure: {0}")]
    Io(String),
}
