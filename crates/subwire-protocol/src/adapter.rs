//! The sub-protocol adapter capability.
//!
//! A session holds exactly one `Arc<dyn SubProtocol>`, chosen at
//! construction from the negotiated protocol name. Everything that differs
//! between the two vocabularies (message names, field layout, direction
//! rules, keep-alive style, error terminality) lives behind this trait so the
//! session never branches on the protocol name.

use std::fmt;
use std::sync::Arc;

use subwire_core::{LegacyErrorPolicy, ProtocolMessage, Result, Role, SubProtocolKind};

use crate::current::CurrentProtocol;
use crate::legacy::LegacyProtocol;

/// How a sub-protocol keeps idle connections alive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeepAliveStyle {
    /// Either role may ping; any inbound traffic resets the idle timer.
    PingPong,
    /// The responder emits unidirectional keep-alives; only the initiator
    /// enforces the idle timeout.
    ResponderKeepAlive,
}

/// Message vocabulary and handshake rules of one sub-protocol, bound to the
/// role of the local end.
pub trait SubProtocol: Send + Sync + fmt::Debug {
    /// Which sub-protocol this is.
    fn kind(&self) -> SubProtocolKind;

    /// Role of the local end; decides which messages may be received.
    fn role(&self) -> Role;

    /// Negotiated name.
    fn name(&self) -> &'static str {
        self.kind().name()
    }

    /// Decode one text frame received from the peer.
    ///
    /// Fails for malformed JSON, unknown message types, and messages the
    /// peer's role may not send.
    fn decode(&self, frame: &str) -> Result<ProtocolMessage>;

    /// Encode a message for sending to the peer.
    ///
    /// Fails for messages this vocabulary has no representation for.
    fn encode(&self, message: &ProtocolMessage) -> Result<String>;

    /// Whether `message` ends the stream of the operation it addresses.
    fn is_terminal(&self, message: &ProtocolMessage) -> bool;

    /// Keep-alive convention of this sub-protocol.
    fn keep_alive_style(&self) -> KeepAliveStyle;

    /// Message the local end sends on every keep-alive tick, if any.
    ///
    /// `send_pings` only matters for ping/pong protocols; legacy responders
    /// always send `ka` and legacy initiators never send anything.
    fn keep_alive_message(&self, send_pings: bool) -> Option<ProtocolMessage> {
        match (self.keep_alive_style(), self.role()) {
            (KeepAliveStyle::PingPong, _) => send_pings.then(ProtocolMessage::ping),
            (KeepAliveStyle::ResponderKeepAlive, Role::Responder) => {
                Some(ProtocolMessage::KeepAlive)
            }
            (KeepAliveStyle::ResponderKeepAlive, Role::Initiator) => None,
        }
    }

    /// Whether the local end enforces the idle timeout.
    fn enforces_idle_timeout(&self) -> bool {
        match self.keep_alive_style() {
            KeepAliveStyle::PingPong => true,
            KeepAliveStyle::ResponderKeepAlive => self.role() == Role::Initiator,
        }
    }

    /// Message sent before closing when connection-init is rejected.
    fn init_rejection(&self, _reason: &str) -> Option<ProtocolMessage> {
        None
    }

    /// Message an initiator sends before a graceful close.
    fn terminate_message(&self) -> Option<ProtocolMessage> {
        None
    }
}

/// Construct the adapter for `kind` acting as `role`.
pub fn build_adapter(
    kind: SubProtocolKind,
    role: Role,
    legacy_errors: LegacyErrorPolicy,
) -> Arc<dyn SubProtocol> {
    match kind {
        SubProtocolKind::Legacy => Arc::new(LegacyProtocol::new(role, legacy_errors)),
        SubProtocolKind::Current => Arc::new(CurrentProtocol::new(role)),
    }
}
