//! Metric names recorded by sessions.
//!
//! Recording goes through the `metrics` facade; without an installed
//! recorder every call is a no-op.

/// Connections opened total (counter, labels: role, protocol).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// Currently open connections (gauge, labels: role).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Connection lifetime in seconds (histogram, labels: role).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Protocol violations and timeouts that failed a connection (counter, labels: code).
pub const WS_PROTOCOL_VIOLATIONS_TOTAL: &str = "ws_protocol_violations_total";
/// Operations accepted total (counter, labels: protocol).
pub const GRAPHQL_OPERATIONS_STARTED_TOTAL: &str = "graphql_operations_started_total";
/// Operations finished total (counter, labels: outcome, protocol).
pub const GRAPHQL_OPERATIONS_FINISHED_TOTAL: &str = "graphql_operations_finished_total";
