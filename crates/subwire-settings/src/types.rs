//! Settings types.
//!
//! Every struct deserializes with `camelCase` keys and fills missing fields
//! from its [`Default`] impl, so a partial `settings.json` is always valid.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use subwire_core::{DuplicateOperationPolicy, LegacyErrorPolicy, SubProtocolKind};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubwireSettings {
    /// HTTP / WebSocket listener settings.
    pub server: ServerSettings,
    /// Sub-protocol, handshake and keep-alive settings.
    pub protocol: ProtocolSettings,
    /// Log output settings.
    pub logging: LoggingSettings,
}

impl SubwireSettings {
    /// Reject combinations that would make a session unusable.
    pub fn validate(&self) -> Result<()> {
        self.server.validate()?;
        self.protocol.validate()
    }
}

// ── Server ──────────────────────────────────────────────────────────────────

/// Listener settings for the responder server.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port (0 picks an ephemeral port).
    pub port: u16,
    /// Path of the WebSocket upgrade route.
    pub path: String,
    /// Maximum number of concurrently open connections.
    pub max_connections: usize,
    /// How long shutdown waits for sessions to close, in milliseconds.
    pub shutdown_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4000,
            path: "/graphql".to_string(),
            max_connections: 1024,
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl ServerSettings {
    /// Shutdown grace period.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if !self.path.starts_with('/') {
            return Err(SettingsError::InvalidValue(format!(
                "server.path must start with '/', got '{}'",
                self.path
            )));
        }
        if self.max_connections == 0 {
            return Err(SettingsError::InvalidValue(
                "server.maxConnections must be positive".into(),
            ));
        }
        Ok(())
    }
}

// ── Protocol ────────────────────────────────────────────────────────────────

/// Per-connection protocol behaviour, shared by both roles.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProtocolSettings {
    /// Enabled sub-protocols, most preferred first.
    pub protocols: Vec<SubProtocolKind>,
    /// Deadline for connection-init (responder) or connection-ack (initiator).
    pub handshake_timeout_ms: u64,
    /// Interval between keep-alive messages.
    pub keep_alive_interval_ms: u64,
    /// Maximum time without inbound traffic before the connection fails.
    pub idle_timeout_ms: u64,
    /// Whether the local end sends pings under `graphql-transport-ws`.
    pub send_pings: bool,
    /// Capacity of the outbound frame queue.
    pub outbound_buffer: usize,
    /// Capacity of each initiator-side subscription stream.
    pub operation_buffer: usize,
    /// Maximum concurrently active operations per connection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_operations: Option<usize>,
    /// How legacy "error" messages are classified.
    pub legacy_error_policy: LegacyErrorPolicy,
    /// What a responder does when a subscribe reuses an active id.
    pub duplicate_operation_policy: DuplicateOperationPolicy,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            protocols: SubProtocolKind::ALL.to_vec(),
            handshake_timeout_ms: 3_000,
            keep_alive_interval_ms: 15_000,
            idle_timeout_ms: 45_000,
            send_pings: true,
            outbound_buffer: 256,
            operation_buffer: 32,
            max_operations: None,
            legacy_error_policy: LegacyErrorPolicy::default(),
            duplicate_operation_policy: DuplicateOperationPolicy::default(),
        }
    }
}

impl ProtocolSettings {
    /// Handshake deadline.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Keep-alive tick interval.
    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    /// Idle timeout.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.protocols.is_empty() {
            return Err(SettingsError::InvalidValue(
                "protocol.protocols must name at least one sub-protocol".into(),
            ));
        }
        for (name, value) in [
            ("handshakeTimeoutMs", self.handshake_timeout_ms),
            ("keepAliveIntervalMs", self.keep_alive_interval_ms),
            ("idleTimeoutMs", self.idle_timeout_ms),
        ] {
            if value == 0 {
                return Err(SettingsError::InvalidValue(format!(
                    "protocol.{name} must be positive"
                )));
            }
        }
        if self.idle_timeout_ms <= self.keep_alive_interval_ms {
            return Err(SettingsError::InvalidValue(format!(
                "protocol.idleTimeoutMs ({}) must exceed keepAliveIntervalMs ({})",
                self.idle_timeout_ms, self.keep_alive_interval_ms
            )));
        }
        if self.outbound_buffer == 0 || self.operation_buffer == 0 {
            return Err(SettingsError::InvalidValue(
                "protocol buffers must be positive".into(),
            ));
        }
        Ok(())
    }
}

// ── Logging ─────────────────────────────────────────────────────────────────

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let s = SubwireSettings::default();
        assert_eq!(s.server.port, 4000);
        assert_eq!(s.server.path, "/graphql");
        assert_eq!(s.protocol.protocols, SubProtocolKind::ALL.to_vec());
        assert_eq!(s.protocol.handshake_timeout(), Duration::from_secs(3));
        assert_eq!(s.protocol.keep_alive_interval(), Duration::from_secs(15));
        assert_eq!(s.protocol.idle_timeout(), Duration::from_secs(45));
        assert!(s.protocol.max_operations.is_none());
        assert_eq!(s.logging.level, "info");
        assert!(s.validate().is_ok());
    }

    #[test]
    fn camel_case_keys() {
        let json = serde_json::to_value(SubwireSettings::default()).unwrap();
        assert_eq!(json["protocol"]["keepAliveIntervalMs"], 15_000);
        assert_eq!(json["protocol"]["legacyErrorPolicy"], "payload_shape");
        assert_eq!(json["server"]["maxConnections"], 1024);
        assert!(json["protocol"].get("maxOperations").is_none());
    }

    #[test]
    fn partial_protocol_section() {
        let s: ProtocolSettings =
            serde_json::from_str(r#"{"protocols": ["graphql-ws"], "sendPings": false}"#).unwrap();
        assert_eq!(s.protocols, vec![SubProtocolKind::Legacy]);
        assert!(!s.send_pings);
        assert_eq!(s.idle_timeout_ms, 45_000);
    }

    #[test]
    fn validate_rejects_empty_protocols() {
        let mut s = SubwireSettings::default();
        s.protocol.protocols.clear();
        assert!(matches!(s.validate(), Err(SettingsError::InvalidValue(_))));
    }

    #[test]
    fn validate_rejects_idle_below_interval() {
        let mut s = SubwireSettings::default();
        s.protocol.idle_timeout_ms = 10_000;
        let err = s.validate().unwrap_err();
        assert!(err.to_string().contains("idleTimeoutMs"));
    }

    #[test]
    fn validate_rejects_relative_path() {
        let mut s = SubwireSettings::default();
        s.server.path = "graphql".into();
        assert!(s.validate().is_err());
    }
}
