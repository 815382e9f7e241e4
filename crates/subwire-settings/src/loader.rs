//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`SubwireSettings::default()`]
//! 2. If `~/.subwire/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `SUBWIRE_*` environment variable overrides (highest priority)
//! 4. Validate the result
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use subwire_core::SubProtocolKind;
use tracing::debug;

use crate::errors::Result;
use crate::types::SubwireSettings;

/// Resolve the path to the settings file (`~/.subwire/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".subwire").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<SubwireSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON or the merged result fails validation, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<SubwireSettings> {
    let defaults = serde_json::to_value(SubwireSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: SubwireSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment variable overrides to loaded settings.
///
/// Invalid values are ignored with a warning (falling back to file/default).
pub fn apply_env_overrides(settings: &mut SubwireSettings) {
    // ── Server settings ─────────────────────────────────────────────
    if let Some(v) = read_env_string("SUBWIRE_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read_env_u16("SUBWIRE_PORT", 0, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = read_env_string("SUBWIRE_PATH") {
        settings.server.path = v;
    }
    if let Some(v) = read_env_usize("SUBWIRE_MAX_CONNECTIONS", 1, 1_000_000) {
        settings.server.max_connections = v;
    }
    if let Some(v) = read_env_u64("SUBWIRE_SHUTDOWN_TIMEOUT_MS", 0, 600_000) {
        settings.server.shutdown_timeout_ms = v;
    }

    // ── Protocol settings ───────────────────────────────────────────
    if let Some(v) = read_env_protocols("SUBWIRE_PROTOCOLS") {
        settings.protocol.protocols = v;
    }
    if let Some(v) = read_env_u64("SUBWIRE_HANDSHAKE_TIMEOUT_MS", 100, 600_000) {
        settings.protocol.handshake_timeout_ms = v;
    }
    if let Some(v) = read_env_u64("SUBWIRE_KEEP_ALIVE_INTERVAL_MS", 100, 3_600_000) {
        settings.protocol.keep_alive_interval_ms = v;
    }
    if let Some(v) = read_env_u64("SUBWIRE_IDLE_TIMEOUT_MS", 100, 3_600_000) {
        settings.protocol.idle_timeout_ms = v;
    }
    if let Some(v) = read_env_bool("SUBWIRE_SEND_PINGS") {
        settings.protocol.send_pings = v;
    }
    if let Some(v) = read_env_usize("SUBWIRE_MAX_OPERATIONS", 1, 1_000_000) {
        settings.protocol.max_operations = Some(v);
    }

    // ── Logging settings ────────────────────────────────────────────
    if let Some(v) = read_env_string("SUBWIRE_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_env_bool("SUBWIRE_LOG_JSON") {
        settings.logging.json = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a comma-separated list of sub-protocol names.
///
/// Every entry must be a known name and at least one must be present;
/// duplicates are dropped keeping the first occurrence.
pub fn parse_protocols(val: &str) -> Option<Vec<SubProtocolKind>> {
    let mut out = Vec::new();
    for name in val.split(',').filter(|s| !s.trim().is_empty()) {
        let kind = SubProtocolKind::from_name(name)?;
        if !out.contains(&kind) {
            out.push(kind);
        }
    }
    (!out.is_empty()).then_some(out)
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u16(name: &str, min: u16, max: u16) -> Option<u16> {
    let val = std::env::var(name).ok()?;
    let result = parse_u16_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

fn read_env_usize(name: &str, min: usize, max: usize) -> Option<usize> {
    let val = std::env::var(name).ok()?;
    let result = parse_usize_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
    }
    result
}

fn read_env_protocols(name: &str) -> Option<Vec<SubProtocolKind>> {
    let val = std::env::var(name).ok()?;
    let result = parse_protocols(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid sub-protocol list env var, ignoring");
    }
    result
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
