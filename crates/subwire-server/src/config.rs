//! Server configuration.

use std::time::Duration;

use subwire_core::{LegacyErrorPolicy, SubProtocolKind};
use subwire_session::SessionConfig;
use subwire_settings::SubwireSettings;

/// Configuration for the responder server.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Host to bind.
    pub host: String,
    /// Port to bind (`0` for auto-assign).
    pub port: u16,
    /// Path of the WebSocket upgrade route.
    pub path: String,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// How long shutdown waits for sessions to close.
    pub shutdown_timeout: Duration,
    /// Accepted sub-protocols, most preferred first.
    pub protocols: Vec<SubProtocolKind>,
    /// Terminality of legacy "error" messages.
    pub legacy_errors: LegacyErrorPolicy,
    /// Per-connection session settings.
    pub session: SessionConfig,
}

impl ServerConfig {
    /// Build from loaded settings.
    pub fn from_settings(settings: &SubwireSettings) -> Self {
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            path: settings.server.path.clone(),
            max_connections: settings.server.max_connections,
            shutdown_timeout: settings.server.shutdown_timeout(),
            protocols: settings.protocol.protocols.clone(),
            legacy_errors: settings.protocol.legacy_error_policy,
            session: SessionConfig::from_settings(&settings.protocol),
        }
    }
}

impl Default for ServerConfig {
    /// Settings defaults on an ephemeral port.
    fn default() -> Self {
        Self {
            port: 0,
            ..Self::from_settings(&SubwireSettings::default())
        }
    }
}
