//! Per-session configuration.

use std::time::Duration;

use subwire_core::DuplicateOperationPolicy;
use subwire_settings::ProtocolSettings;

/// Timeouts, buffer sizes and policies of one session.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Deadline for connection-init (responder) or connection-ack (initiator).
    pub handshake_timeout: Duration,
    /// Interval between keep-alive messages.
    pub keep_alive_interval: Duration,
    /// Maximum time without inbound traffic.
    pub idle_timeout: Duration,
    /// Whether to send pings under ping/pong sub-protocols.
    pub send_pings: bool,
    /// Capacity of the outbound frame queue.
    pub outbound_buffer: usize,
    /// Capacity of each initiator-side subscription stream.
    pub operation_buffer: usize,
    /// Maximum concurrently active operations.
    pub max_operations: Option<usize>,
    /// Responder behaviour for a subscribe that reuses an active id.
    pub duplicate_operations: DuplicateOperationPolicy,
}

impl SessionConfig {
    /// Build from loaded protocol settings.
    pub fn from_settings(settings: &ProtocolSettings) -> Self {
        Self {
            handshake_timeout: settings.handshake_timeout(),
            keep_alive_interval: settings.keep_alive_interval(),
            idle_timeout: settings.idle_timeout(),
            send_pings: settings.send_pings,
            outbound_buffer: settings.outbound_buffer.max(1),
            operation_buffer: settings.operation_buffer.max(1),
            max_operations: settings.max_operations,
            duplicate_operations: settings.duplicate_operation_policy,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_settings(&ProtocolSettings::default())
    }
}
