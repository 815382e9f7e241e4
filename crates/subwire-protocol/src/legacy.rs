//! `graphql-ws`: the legacy subscriptions-transport-ws sub-protocol.
//!
//! Vocabulary: `connection_init`, `connection_ack`, `connection_error`, `ka`,
//! `connection_terminate`, `start`, `data`, `error`, `complete`, `stop`.
//! There is no ping/pong; the responder emits `ka` on a fixed interval.
//! The initiator ends an operation with `stop`, the responder with
//! `complete`; both decode to [`ProtocolMessage::Complete`].

use serde_json::Value;
use subwire_core::{
    LegacyErrorPolicy, MessageKind, ProtocolError, ProtocolMessage, Result, Role,
    SubProtocolKind,
};

use crate::adapter::{KeepAliveStyle, SubProtocol};
use crate::wire::{self, Envelope};

const CONNECTION_INIT: &str = "connection_init";
const CONNECTION_ACK: &str = "connection_ack";
const CONNECTION_ERROR: &str = "connection_error";
const CONNECTION_TERMINATE: &str = "connection_terminate";
const KEEP_ALIVE: &str = "ka";
const START: &str = "start";
const DATA: &str = "data";
const ERROR: &str = "error";
const COMPLETE: &str = "complete";
const STOP: &str = "stop";

/// Adapter for `graphql-ws`.
#[derive(Clone, Debug)]
pub struct LegacyProtocol {
    role: Role,
    errors: LegacyErrorPolicy,
}

impl LegacyProtocol {
    /// Adapter for the given local role and error-terminality policy.
    pub fn new(role: Role, errors: LegacyErrorPolicy) -> Self {
        Self { role, errors }
    }

    /// Error-terminality policy in effect.
    pub fn error_policy(&self) -> LegacyErrorPolicy {
        self.errors
    }

    /// Whether an error payload ends its operation under `policy`.
    ///
    /// With [`LegacyErrorPolicy::PayloadShape`], errors that all carry a
    /// `path` are field errors raised by a stream that keeps producing; any
    /// error without a `path` (or an empty list) is a request-level failure.
    pub fn error_is_fatal(policy: LegacyErrorPolicy, errors: &[Value]) -> bool {
        match policy {
            LegacyErrorPolicy::AlwaysTerminal => true,
            LegacyErrorPolicy::PayloadShape => {
                errors.is_empty() || errors.iter().any(|e| e.get("path").is_none())
            }
        }
    }

    fn decode_envelope(&self, mut env: Envelope) -> Result<ProtocolMessage> {
        let wire_type = env.kind.clone();
        let message = match (self.role, wire_type.as_str()) {
            (Role::Responder, CONNECTION_INIT) => ProtocolMessage::ConnectionInit {
                payload: env.optional_map()?,
            },
            (Role::Responder, START) => ProtocolMessage::Subscribe {
                id: env.require_id()?,
                payload: env.subscribe_payload()?,
            },
            (Role::Responder, STOP) => ProtocolMessage::Complete {
                id: env.require_id()?,
            },
            (Role::Responder, CONNECTION_TERMINATE) => ProtocolMessage::ConnectionTerminate,
            (Role::Initiator, CONNECTION_ACK) => ProtocolMessage::ConnectionAck {
                payload: env.optional_map()?,
            },
            (Role::Initiator, CONNECTION_ERROR) => ProtocolMessage::ConnectionError {
                payload: env.payload.take().unwrap_or(Value::Null),
            },
            (Role::Initiator, KEEP_ALIVE) => ProtocolMessage::KeepAlive,
            (Role::Initiator, DATA) => ProtocolMessage::Next {
                id: env.require_id()?,
                payload: env.result_payload()?,
            },
            (Role::Initiator, ERROR) => {
                let id = env.require_id()?;
                let payload = match env.required_payload()? {
                    Value::Array(errors) => errors,
                    single @ Value::Object(_) => vec![single],
                    _ => {
                        return Err(ProtocolError::Malformed(
                            "'error' payload must be an error object or a list of them".into(),
                        ));
                    }
                };
                ProtocolMessage::Error { id, payload }
            }
            (Role::Initiator, COMPLETE) => ProtocolMessage::Complete {
                id: env.require_id()?,
            },
            (
                _,
                CONNECTION_INIT | START | STOP | CONNECTION_TERMINATE | CONNECTION_ACK
                | CONNECTION_ERROR | KEEP_ALIVE | DATA | ERROR | COMPLETE,
            ) => {
                return Err(ProtocolError::Unexpected {
                    kind: kind_of(&wire_type),
                    state: match self.role {
                        Role::Initiator => "acting as initiator",
                        Role::Responder => "acting as responder",
                    },
                });
            }
            (_, other) => return Err(ProtocolError::UnknownMessageType(other.to_owned())),
        };
        Ok(message)
    }
}

/// Protocol-neutral kind of a known legacy message type.
fn kind_of(wire_type: &str) -> MessageKind {
    match wire_type {
        CONNECTION_INIT => MessageKind::ConnectionInit,
        CONNECTION_ACK => MessageKind::ConnectionAck,
        CONNECTION_ERROR => MessageKind::ConnectionError,
        CONNECTION_TERMINATE => MessageKind::ConnectionTerminate,
        KEEP_ALIVE => MessageKind::KeepAlive,
        START => MessageKind::Subscribe,
        DATA => MessageKind::Next,
        ERROR => MessageKind::Error,
        _ => MessageKind::Complete,
    }
}

impl SubProtocol for LegacyProtocol {
    fn kind(&self) -> SubProtocolKind {
        SubProtocolKind::Legacy
    }

    fn role(&self) -> Role {
        self.role
    }

    fn decode(&self, frame: &str) -> Result<ProtocolMessage> {
        self.decode_envelope(wire::parse(frame)?)
    }

    fn encode(&self, message: &ProtocolMessage) -> Result<String> {
        match message {
            ProtocolMessage::ConnectionInit { payload } => {
                wire::write(CONNECTION_INIT, None, wire::map_value(payload.as_ref()))
            }
            ProtocolMessage::ConnectionAck { payload } => {
                wire::write(CONNECTION_ACK, None, wire::map_value(payload.as_ref()))
            }
            ProtocolMessage::ConnectionError { payload } => {
                wire::write(CONNECTION_ERROR, None, Some(payload.clone()))
            }
            ProtocolMessage::ConnectionTerminate => wire::write(CONNECTION_TERMINATE, None, None),
            ProtocolMessage::KeepAlive => wire::write(KEEP_ALIVE, None, None),
            ProtocolMessage::Subscribe { id, payload } => {
                wire::write(START, Some(id), Some(wire::to_value(payload)?))
            }
            ProtocolMessage::Next { id, payload } => {
                wire::write(DATA, Some(id), Some(wire::to_value(payload)?))
            }
            ProtocolMessage::Error { id, payload } => {
                wire::write(ERROR, Some(id), Some(Value::Array(payload.clone())))
            }
            ProtocolMessage::Complete { id } => {
                let wire_type = match self.role {
                    Role::Initiator => STOP,
                    Role::Responder => COMPLETE,
                };
                wire::write(wire_type, Some(id), None)
            }
            ProtocolMessage::Ping { .. } | ProtocolMessage::Pong { .. } => {
                Err(ProtocolError::Unsupported {
                    kind: message.kind(),
                    protocol: SubProtocolKind::Legacy.name(),
                })
            }
        }
    }

    fn is_terminal(&self, message: &ProtocolMessage) -> bool {
        match message {
            ProtocolMessage::Complete { .. } => true,
            ProtocolMessage::Error { payload, .. } => Self::error_is_fatal(self.errors, payload),
            _ => false,
        }
    }

    fn keep_alive_style(&self) -> KeepAliveStyle {
        KeepAliveStyle::ResponderKeepAlive
    }

    fn init_rejection(&self, reason: &str) -> Option<ProtocolMessage> {
        Some(ProtocolMessage::ConnectionError {
            payload: serde_json::json!({ "message": reason }),
        })
    }

    fn terminate_message(&self) -> Option<ProtocolMessage> {
        (self.role == Role::Initiator).then_some(ProtocolMessage::ConnectionTerminate)
    }
}
