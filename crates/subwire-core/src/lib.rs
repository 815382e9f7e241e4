//! # subwire-core
//!
//! Foundation types shared by every subwire crate:
//!
//! - [`ProtocolMessage`]: the protocol-neutral message union both sub-protocols map onto
//! - [`OperationId`] / [`ConnectionId`]: branded identifiers
//! - [`ProtocolError`] and [`CloseCode`]: wire-level violations and the close codes they map to
//! - [`Frame`]: the text/close frames a session reads from and writes to its transport
//! - [`Role`], [`SubProtocolKind`], [`LegacyErrorPolicy`], [`DuplicateOperationPolicy`]:
//!   per-connection roles and policy knobs

#![deny(unsafe_code)]

pub mod errors;
pub mod ids;
pub mod message;
pub mod policy;
pub mod transport;

pub use errors::{CloseCode, ProtocolError, Result};
pub use ids::{ConnectionId, OperationId};
pub use message::{ExecutionResult, JsonMap, MessageKind, ProtocolMessage, SubscribePayload};
pub use policy::{DuplicateOperationPolicy, LegacyErrorPolicy, Role, SubProtocolKind};
pub use transport::{CloseFrame, Frame, TransportError};
