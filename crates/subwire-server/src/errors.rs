//! Server and client-connector error types.

use subwire_session::SessionError;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Failures starting or running the responder server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Binding or serving the listener failed.
    #[error("server I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The Prometheus recorder could not be installed.
    #[error("failed to install metrics recorder: {0}")]
    Metrics(String),
}

/// Failures opening a client connection.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The URL or handshake request could not be built.
    #[error("invalid request: {0}")]
    Request(String),
    /// The WebSocket handshake failed (including HTTP rejections).
    #[error("websocket connect failed: {0}")]
    Connect(Box<tungstenite::Error>),
    /// The server answered without selecting a sub-protocol.
    #[error("server did not select a sub-protocol")]
    NoSubProtocol,
    /// The server selected a sub-protocol that was not offered.
    #[error("server selected unsupported sub-protocol '{0}'")]
    UnsupportedSubProtocol(String),
    /// The GraphQL-over-WebSocket handshake failed.
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl From<tungstenite::Error> for ClientError {
    fn from(err: tungstenite::Error) -> Self {
        Self::Connect(Box::new(err))
    }
}

/// Result type for client-connector operations.
pub type Result<T> = std::result::Result<T, ClientError>;
