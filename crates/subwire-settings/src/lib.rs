//! # subwire-settings
//!
//! Layered configuration for subwire servers and clients.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`SubwireSettings::default()`]
//! 2. **User file**: `~/.subwire/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `SUBWIRE_*` overrides (highest priority)

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;

use std::sync::OnceLock;

/// Global settings singleton.
static SETTINGS: OnceLock<SubwireSettings> = OnceLock::new();

/// Get the global settings instance.
///
/// On first call, loads settings from `~/.subwire/settings.json` with env var
/// overrides. If loading fails, returns compiled defaults.
pub fn get_settings() -> &'static SubwireSettings {
    SETTINGS.get_or_init(|| load_settings().unwrap_or_default())
}

/// Initialize the global settings with a specific value.
///
/// Returns the provided settings back if the global was already initialized.
#[allow(clippy::result_large_err)]
pub fn init_settings(settings: SubwireSettings) -> std::result::Result<(), SubwireSettings> {
    SETTINGS.set(settings)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
