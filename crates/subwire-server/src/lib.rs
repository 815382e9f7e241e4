//! # subwire-server
//!
//! Network surfaces for subwire sessions.
//!
//! - [`SubwireServer`]: axum router with the WebSocket upgrade endpoint
//!   (sub-protocol negotiation, connection cap), `/health` and `/metrics`
//! - [`connect`]: open a [`Client`](subwire_session::Client) over
//!   `tokio-tungstenite`, picking the adapter from the server's answer
//! - Graceful shutdown: every session closes with "going away"
//! - [`TickerExecutor`]: the `subscription { ticks }` demo executor

#![deny(unsafe_code)]

pub mod config;
pub mod connect;
pub mod connections;
pub mod errors;
pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod ticker;
pub mod transport;

pub use config::ServerConfig;
pub use connect::connect;
pub use errors::{ClientError, ServerError};
pub use server::{AppState, ServerHandle, SubwireServer};
pub use shutdown::ShutdownCoordinator;
pub use ticker::TickerExecutor;
