//! Connection-level state, published on a watch channel.

use std::fmt;

use subwire_core::CloseCode;

/// Connection state.
///
/// `AwaitingInit → Acknowledged → Closing → Closed`, plus the absorbing
/// `Failed` reachable from any state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake not yet completed.
    AwaitingInit,
    /// Handshake completed; operations may run.
    Acknowledged,
    /// Graceful shutdown in progress.
    Closing,
    /// Closed gracefully.
    Closed,
    /// Torn down by a violation, timeout or transport failure.
    Failed(CloseCode),
}

impl ConnectionState {
    /// Whether no further transitions are possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed(_))
    }

    /// Whether `self → next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Closed | Self::Failed(_), _) => false,
            (_, Self::Failed(_)) => true,
            (Self::AwaitingInit, Self::Acknowledged | Self::Closing)
            | (Self::Acknowledged, Self::Closing)
            | (Self::Closing, Self::Closed) => true,
            _ => false,
        }
    }

    /// Short name used in logs and error messages.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AwaitingInit => "awaiting_init",
            Self::Acknowledged => "acknowledged",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(code) => write!(f, "failed ({code})"),
            other => f.write_str(other.as_str()),
        }
    }
}
