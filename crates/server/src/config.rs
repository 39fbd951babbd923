use std::path::Path;

use anyhow::{Context, Result};
use gateway_protocol::GatewayConfig;

/// Load configuration from a TOML file at the given path, falling back
/// to defaults if the file doesn't exist, then apply environment
/// overrides the same way `--port` on the command line overrides both.
pub fn load_config(path: &Path) -> Result<GatewayConfig> {
    let mut config = if !path.exists() {
        tracing::warn!(
            "Config file not found at {}, using defaults",
            path.display()
        );
        GatewayConfig::default()
    } else {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: GatewayConfig =
            toml::from_str(&contents).with_context(|| "Failed to parse config TOML")?;

        tracing::info!("Loaded config from {}", path.display());
        config
    };

    apply_env_overrides(&mut config);
    Ok(config)
}

/// Environment variables override whatever the TOML file (or its
/// defaults) set. Malformed values are logged and otherwise ignored
/// rather than failing startup.
fn apply_env_overrides(config: &mut GatewayConfig) {
    if let Some(n) = env_parsed("MAX_SESSIONS") {
        config.session.max_sessions = n;
    }
    if let Some(n) = env_parsed("SESSION_TIMEOUT_MS") {
        config.session.session_timeout_ms = n;
    }
    if let Some(n) = env_parsed("PERMISSION_TIMEOUT_MS") {
        config.session.permission_timeout_ms = n;
    }
    if let Some(n) = env_parsed("QUESTION_TIMEOUT_MS") {
        config.session.question_timeout_ms = n;
    }
    if let Some(n) = env_parsed("TERMINAL_IDLE_MS") {
        config.session.terminal_idle_ms = n;
    }
    if let Ok(v) = std::env::var("SESSION_SECRET") {
        config.server.session_secret = Some(v);
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    match std::env::var(key) {
        Ok(v) => match v.parse() {
            Ok(parsed) => Some(parsed),
            Err(_) => {
                tracing::warn!("Ignoring {key}={v:?}: not a valid value");
                None
            }
        },
        Err(_) => None,
    }
}
