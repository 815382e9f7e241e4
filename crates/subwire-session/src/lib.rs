//! # subwire-session
//!
//! Per-connection protocol engine for GraphQL over WebSocket.
//!
//! - [`ResponderSession`]: server side; handshake, operation dispatch to an
//!   [`Executor`], keep-alive, graceful and failure shutdown
//! - [`Client`] / [`Subscription`]: initiator side; handshake, one result
//!   stream per operation, complete-on-drop
//! - [`OperationRegistry`]: live operations keyed by id, with generations so
//!   a reused id never receives a stale operation's messages
//! - Result pipelines: one task per operation, one value in flight, exactly
//!   one terminal message
//! - Keep-alive monitor: pings or `ka` messages plus the idle timeout
//!
//! Sessions are transport-agnostic: they read a `Stream` of
//! [`Frame`](subwire_core::Frame)s and write to a `Sink` of them.

#![deny(unsafe_code)]

mod client;
pub mod config;
mod connection;
pub mod errors;
pub mod executor;
pub mod keepalive;
pub mod metrics;
mod outbound;
mod pipeline;
pub mod registry;
mod responder;
pub mod state;

#[cfg(test)]
mod testing;

pub use client::{Client, Subscription, SubscriptionItem};
pub use config::SessionConfig;
pub use errors::{RegistryError, Result, SessionError, SubscriptionError};
pub use executor::{Executor, InitDecision, OperationFailure, ResultStream};
pub use keepalive::{KeepAliveResult, Liveness};
pub use pipeline::PipelineOutcome;
pub use registry::{OperationRegistry, OperationState, OperationTicket};
pub use responder::ResponderSession;
pub use state::ConnectionState;
