//! # subwire
//!
//! Demo server binary: loads settings, installs logging and metrics, and
//! serves `subscription { ticks }` over both GraphQL WebSocket sub-protocols
//! until Ctrl-C.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use subwire_server::{ServerConfig, SubwireServer, TickerExecutor};
use subwire_settings::SubwireSettings;

/// GraphQL-over-WebSocket ticker server.
#[derive(Parser, Debug)]
#[command(name = "subwire", about = "GraphQL-over-WebSocket ticker server")]
struct Cli {
    /// Settings file (defaults to `~/.subwire/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Log filter directive (overrides settings).
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    json: bool,

    /// Values per ticker subscription unless the `count` variable is set.
    #[arg(long, default_value = "10")]
    tick_count: u64,

    /// Milliseconds between ticks unless the `intervalMs` variable is set.
    #[arg(long, default_value = "1000")]
    tick_interval_ms: u64,

    /// Require `{"token": ...}` in connection-init.
    #[arg(long)]
    token: Option<String>,
}

impl Cli {
    /// Apply flag overrides on top of loaded settings.
    fn apply(&self, settings: &mut SubwireSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        if self.json {
            settings.logging.json = true;
        }
    }

    fn executor(&self) -> TickerExecutor {
        let ticker = TickerExecutor::new(
            self.tick_count,
            Duration::from_millis(self.tick_interval_ms),
        );
        match &self.token {
            Some(token) => ticker.with_token(token.clone()),
            None => ticker,
        }
    }
}

/// Load settings from the file named on the command line (or the default
/// path), then apply flag overrides.
fn resolve_settings(args: &Cli) -> Result<SubwireSettings> {
    let path = args
        .settings
        .clone()
        .unwrap_or_else(subwire_settings::settings_path);
    let mut settings = subwire_settings::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    args.apply(&mut settings);
    settings.validate().context("Invalid settings")?;
    Ok(settings)
}

fn build_server(args: &Cli, settings: &SubwireSettings) -> SubwireServer {
    SubwireServer::new(
        ServerConfig::from_settings(settings),
        Arc::new(args.executor()),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let settings = resolve_settings(&args)?;

    subwire_logging::init(&settings.logging.level, settings.logging.json);
    let metrics = subwire_server::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;

    let server = build_server(&args, &settings).with_metrics(metrics);
    let handle = server.listen().await.context("Failed to bind server")?;
    tracing::info!(
        protocols = ?settings.protocol.protocols,
        "subwire listening on {}",
        handle.ws_url()
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    handle.shutdown().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults() {
        let cli = Cli::parse_from(["subwire"]);
        assert_eq!(cli.host, None);
        assert_eq!(cli.port, None);
        assert!(!cli.json);
        assert_eq!(cli.tick_count, 10);
        assert_eq!(cli.tick_interval_ms, 1000);
        assert_eq!(cli.token, None);
    }

    #[test]
    fn flags_override_settings() {
        let cli = Cli::parse_from([
            "subwire",
            "--host",
            "0.0.0.0",
            "--port",
            "8080",
            "--log-level",
            "debug",
            "--json",
        ]);
        let mut settings = SubwireSettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.logging.level, "debug");
        assert!(settings.logging.json);
    }

    #[test]
    fn absent_flags_keep_settings() {
        let cli = Cli::parse_from(["subwire"]);
        let mut settings = SubwireSettings::default();
        settings.server.port = 4321;
        cli.apply(&mut settings);
        assert_eq!(settings.server.port, 4321);
        assert!(!settings.logging.json);
    }

    #[test]
    fn settings_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server":{"path":"/subscriptions","port":0}}"#).unwrap();

        let cli = Cli::parse_from(["subwire", "--settings", path.to_str().unwrap()]);
        let settings = resolve_settings(&cli).unwrap();
        assert_eq!(settings.server.path, "/subscriptions");
    }

    #[test]
    fn invalid_settings_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();

        let cli = Cli::parse_from(["subwire", "--settings", path.to_str().unwrap()]);
        let err = resolve_settings(&cli).unwrap_err();
        assert!(err.to_string().contains("Failed to load settings"));
    }

    #[tokio::test]
    async fn built_server_serves_health() {
        let cli = Cli::parse_from(["subwire", "--port", "0"]);
        let mut settings = SubwireSettings::default();
        cli.apply(&mut settings);

        let handle = build_server(&cli, &settings).listen().await.unwrap();
        let url = format!("http://{}/health", handle.addr());
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");
        handle.shutdown().await;
    }
}
