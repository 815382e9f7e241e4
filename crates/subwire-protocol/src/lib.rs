//! # subwire-protocol
//!
//! Message vocabularies of the two GraphQL-over-WebSocket sub-protocols.
//!
//! - [`SubProtocol`]: the adapter capability (`decode` / `encode` /
//!   `is_terminal` / keep-alive style) the session is written against
//! - [`LegacyProtocol`]: `graphql-ws` (subscriptions-transport-ws)
//! - [`CurrentProtocol`]: `graphql-transport-ws`
//! - [`negotiate`]: pick a sub-protocol from a `Sec-WebSocket-Protocol` offer

#![deny(unsafe_code)]

pub mod adapter;
pub mod current;
pub mod legacy;
pub mod negotiate;
mod wire;

pub use adapter::{KeepAliveStyle, SubProtocol, build_adapter};
pub use current::CurrentProtocol;
pub use legacy::LegacyProtocol;
pub use negotiate::{negotiate, offer_header};
pub use subwire_core::SubProtocolKind;
