//! `graphql-transport-ws`: the current sub-protocol.
//!
//! Vocabulary: `connection_init`, `connection_ack`, `ping`, `pong`,
//! `subscribe`, `next`, `error`, `complete`. Ping/pong may flow in either
//! direction; `error` always ends its operation; `complete` is sent by the
//! initiator to unsubscribe and by the responder to end a stream.

use serde_json::Value;
use subwire_core::{MessageKind, ProtocolError, ProtocolMessage, Result, Role, SubProtocolKind};

use crate::adapter::{KeepAliveStyle, SubProtocol};
use crate::wire::{self, Envelope};

const CONNECTION_INIT: &str = "connection_init";
const CONNECTION_ACK: &str = "connection_ack";
const PING: &str = "ping";
const PONG: &str = "pong";
const SUBSCRIBE: &str = "subscribe";
const NEXT: &str = "next";
const ERROR: &str = "error";
const COMPLETE: &str = "complete";

/// Adapter for `graphql-transport-ws`.
#[derive(Clone, Debug)]
pub struct CurrentProtocol {
    role: Role,
}

impl CurrentProtocol {
    /// Adapter for the given local role.
    pub fn new(role: Role) -> Self {
        Self { role }
    }

    /// Whether the peer's role may send `kind`.
    fn peer_may_send(&self, kind: MessageKind) -> bool {
        match (self.role.peer(), kind) {
            (_, MessageKind::Ping | MessageKind::Pong | MessageKind::Complete) => true,
            (Role::Initiator, MessageKind::ConnectionInit | MessageKind::Subscribe) => true,
            (
                Role::Responder,
                MessageKind::ConnectionAck | MessageKind::Next | MessageKind::Error,
            ) => true,
            _ => false,
        }
    }

    fn decode_envelope(mut env: Envelope) -> Result<ProtocolMessage> {
        let wire_type = env.kind.clone();
        let message = match wire_type.as_str() {
            CONNECTION_INIT => ProtocolMessage::ConnectionInit {
                payload: env.optional_map()?,
            },
            CONNECTION_ACK => ProtocolMessage::ConnectionAck {
                payload: env.optional_map()?,
            },
            PING => ProtocolMessage::Ping {
                payload: env.optional_map()?,
            },
            PONG => ProtocolMessage::Pong {
                payload: env.optional_map()?,
            },
            SUBSCRIBE => ProtocolMessage::Subscribe {
                id: env.require_id()?,
                payload: env.subscribe_payload()?,
            },
            NEXT => ProtocolMessage::Next {
                id: env.require_id()?,
                payload: env.result_payload()?,
            },
            ERROR => {
                let id = env.require_id()?;
                match env.required_payload()? {
                    Value::Array(errors) => ProtocolMessage::Error {
                        id,
                        payload: errors,
                    },
                    _ => {
                        return Err(ProtocolError::Malformed(
                            "'error' payload must be an array of errors".into(),
                        ));
                    }
                }
            }
            COMPLETE => ProtocolMessage::Complete {
                id: env.require_id()?,
            },
            other => return Err(ProtocolError::UnknownMessageType(other.to_owned())),
        };
        Ok(message)
    }
}

impl SubProtocol for CurrentProtocol {
    fn kind(&self) -> SubProtocolKind {
        SubProtocolKind::Current
    }

    fn role(&self) -> Role {
        self.role
    }

    fn decode(&self, frame: &str) -> Result<ProtocolMessage> {
        let message = Self::decode_envelope(wire::parse(frame)?)?;
        if !self.peer_may_send(message.kind()) {
            return Err(ProtocolError::Unexpected {
                kind: message.kind(),
                state: match self.role {
                    Role::Initiator => "acting as initiator",
                    Role::Responder => "acting as responder",
                },
            });
        }
        Ok(message)
    }

    fn encode(&self, message: &ProtocolMessage) -> Result<String> {
        match message {
            ProtocolMessage::ConnectionInit { payload } => {
                wire::write(CONNECTION_INIT, None, wire::map_value(payload.as_ref()))
            }
            ProtocolMessage::ConnectionAck { payload } => {
                wire::write(CONNECTION_ACK, None, wire::map_value(payload.as_ref()))
            }
            ProtocolMessage::Ping { payload } => {
                wire::write(PING, None, wire::map_value(payload.as_ref()))
            }
            ProtocolMessage::Pong { payload } => {
                wire::write(PONG, None, wire::map_value(payload.as_ref()))
            }
            ProtocolMessage::Subscribe { id, payload } => {
                wire::write(SUBSCRIBE, Some(id), Some(wire::to_value(payload)?))
            }
            ProtocolMessage::Next { id, payload } => {
                wire::write(NEXT, Some(id), Some(wire::to_value(payload)?))
            }
            ProtocolMessage::Error { id, payload } => {
                wire::write(ERROR, Some(id), Some(Value::Array(payload.clone())))
            }
            ProtocolMessage::Complete { id } => wire::write(COMPLETE, Some(id), None),
            ProtocolMessage::ConnectionError { .. }
            | ProtocolMessage::ConnectionTerminate
            | ProtocolMessage::KeepAlive => Err(ProtocolError::Unsupported {
                kind: message.kind(),
                protocol: SubProtocolKind::Current.name(),
            }),
        }
    }

    fn is_terminal(&self, message: &ProtocolMessage) -> bool {
        matches!(
            message,
            ProtocolMessage::Complete { .. } | ProtocolMessage::Error { .. }
        )
    }

    fn keep_alive_style(&self) -> KeepAliveStyle {
        KeepAliveStyle::PingPong
    }
}
