//! Per-connection roles and policy knobs.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Which end of the connection this session plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Opens the connection, sends connection-init and subscribes (client).
    Initiator,
    /// Accepts the connection, acknowledges and executes (server).
    Responder,
}

impl Role {
    /// The opposite role.
    #[must_use]
    pub fn peer(self) -> Self {
        match self {
            Self::Initiator => Self::Responder,
            Self::Responder => Self::Initiator,
        }
    }
}

/// The two supported sub-protocols, named as negotiated in
/// `Sec-WebSocket-Protocol`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubProtocolKind {
    /// subscriptions-transport-ws vocabulary (`start`/`data`/`stop`/`ka`).
    #[serde(rename = "graphql-ws")]
    Legacy,
    /// graphql-ws vocabulary (`subscribe`/`next`/`ping`/`pong`).
    #[serde(rename = "graphql-transport-ws")]
    Current,
}

impl SubProtocolKind {
    /// Every supported sub-protocol, most preferred first.
    pub const ALL: [Self; 2] = [Self::Current, Self::Legacy];

    /// Name used during negotiation.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Legacy => "graphql-ws",
            Self::Current => "graphql-transport-ws",
        }
    }

    /// Parse a negotiated name (case-insensitive, surrounding whitespace ignored).
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL
            .into_iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for SubProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How the legacy sub-protocol decides whether an "error" ends its operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegacyErrorPolicy {
    /// Terminal unless every error object carries a `path`, i.e. is a field
    /// error raised while the stream was already producing.
    #[default]
    PayloadShape,
    /// Every error ends the operation, as in the current sub-protocol.
    AlwaysTerminal,
}

/// What a responder does when a subscribe reuses an active id.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateOperationPolicy {
    /// Close the connection with 4409.
    #[default]
    FailConnection,
    /// Drop the offending subscribe unanswered; the existing operation keeps
    /// its id and its stream.
    Ignore,
}
