use serde::{Deserialize, Serialize};

/// Top-level configuration for the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// HTTPS port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Path to TLS certificate (auto-generated self-signed if absent).
    pub tls_cert: Option<String>,
    /// Path to TLS key (auto-generated self-signed if absent).
    pub tls_key: Option<String>,
    /// Secret used to verify the externally-signed session cookie
    /// (`base64(JSON{username,exp}).hmacSHA256(secret,json)`).
    pub session_secret: Option<String>,
    /// Directory holding the SQLite store, self-signed cert material,
    /// and any other runtime state.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Path to static web client assets served as a fallback route.
    #[serde(default = "default_web_root")]
    pub web_root: String,
    /// Require an authenticated identity for `/metrics` (default: true).
    #[serde(default = "default_true")]
    pub metrics_require_auth: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Maximum concurrent sessions per process.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: u32,
    /// Idle timeout before `IdleSweep` terminates a session.
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
    /// Timeout for `permissionRequest` round-trips.
    #[serde(default = "default_permission_timeout_ms")]
    pub permission_timeout_ms: u64,
    /// Timeout for `askUserQuestion` round-trips.
    #[serde(default = "default_question_timeout_ms")]
    pub question_timeout_ms: u64,
    /// Idle timeout before the Terminal Manager destroys a PTY.
    #[serde(default = "default_terminal_idle_ms")]
    pub terminal_idle_ms: u64,
    /// Whether to seed a new session's transcript with a bootstrap
    /// prompt asking the agent to summarize the project. A product
    /// choice, not a correctness requirement.
    #[serde(default = "default_true")]
    pub bootstrap_prompt: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Executable to spawn as the agent subprocess.
    #[serde(default = "default_agent_command")]
    pub command: String,
    /// Maximum consecutive restart attempts after a crash before the
    /// Supervisor gives up and enters `dead`.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            session: SessionConfig::default(),
            agent: AgentConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            tls_cert: None,
            tls_key: None,
            session_secret: None,
            data_dir: default_data_dir(),
            web_root: default_web_root(),
            metrics_require_auth: default_true(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            session_timeout_ms: default_session_timeout_ms(),
            permission_timeout_ms: default_permission_timeout_ms(),
            question_timeout_ms: default_question_timeout_ms(),
            terminal_idle_ms: default_terminal_idle_ms(),
            bootstrap_prompt: default_true(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            max_restarts: default_max_restarts(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8443
}
fn default_data_dir() -> String {
    "/var/lib/gateway".to_string()
}
fn default_web_root() -> String {
    "web/dist".to_string()
}
fn default_true() -> bool {
    true
}
fn default_max_sessions() -> u32 {
    5
}
fn default_session_timeout_ms() -> u64 {
    3_600_000
}
fn default_permission_timeout_ms() -> u64 {
    60_000
}
fn default_question_timeout_ms() -> u64 {
    120_000
}
fn default_terminal_idle_ms() -> u64 {
    1_800_000
}
fn default_agent_command() -> String {
    "claude".to_string()
}
fn default_max_restarts() -> u32 {
    3
}

impl GatewayConfig {
    /// Validate the configuration, collecting `"ERROR: ..."` (fatal)
    /// and `"WARNING: ..."` (advisory) strings. The caller decides
    /// whether to abort based on the prefix.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut problems = Vec::new();

        if self.server.port == 0 {
            problems.push("ERROR: server.port must not be 0".to_string());
        }
        match (&self.server.tls_cert, &self.server.tls_key) {
            (Some(_), None) | (None, Some(_)) => {
                problems.push(
                    "ERROR: server.tls_cert and server.tls_key must both be set or both absent"
                        .to_string(),
                );
            }
            (Some(cert), Some(key)) => {
                if !std::path::Path::new(cert).exists() {
                    problems.push(format!("ERROR: server.tls_cert not found: {cert}"));
                }
                if !std::path::Path::new(key).exists() {
                    problems.push(format!("ERROR: server.tls_key not found: {key}"));
                }
            }
            (None, None) => {}
        }
        if self.server.session_secret.is_none() {
            problems.push(
                "WARNING: server.session_secret not set; a random secret will be generated and persisted, invalidating cookies signed by the external login endpoint with a different secret".to_string(),
            );
        }
        if self.server.data_dir.trim().is_empty() {
            problems.push("ERROR: server.data_dir must not be empty".to_string());
        }

        if self.session.max_sessions == 0 {
            problems.push("ERROR: session.max_sessions must be at least 1".to_string());
        }
        if self.session.session_timeout_ms != 0 && self.session.session_timeout_ms < 60_000 {
            problems.push(
                "WARNING: session.session_timeout_ms below 60000 may evict sessions mid-use"
                    .to_string(),
            );
        }
        if self.session.permission_timeout_ms == 0 {
            problems.push("ERROR: session.permission_timeout_ms must be positive".to_string());
        }
        if self.session.question_timeout_ms == 0 {
            problems.push("ERROR: session.question_timeout_ms must be positive".to_string());
        }
        if self.session.terminal_idle_ms == 0 {
            problems.push("ERROR: session.terminal_idle_ms must be positive".to_string());
        }

        if self.agent.command.trim().is_empty() {
            problems.push("ERROR: agent.command must not be empty".to_string());
        }
        if self.agent.max_restarts == 0 {
            problems.push(
                "WARNING: agent.max_restarts is 0; a crashed agent will never be respawned"
                    .to_string(),
            );
        }

        let has_error = problems.iter().any(|p| p.starts_with("ERROR"));
        if has_error {
            Err(problems)
        } else {
            for p in &problems {
                tracing::warn!("{p}");
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_from_empty_toml() {
        let config: GatewayConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 8443);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.session.max_sessions, 5);
        assert_eq!(config.session.session_timeout_ms, 3_600_000);
        assert_eq!(config.session.permission_timeout_ms, 60_000);
        assert_eq!(config.session.question_timeout_ms, 120_000);
        assert_eq!(config.session.terminal_idle_ms, 1_800_000);
        assert_eq!(config.agent.command, "claude");
        assert_eq!(config.agent.max_restarts, 3);
    }

    #[test]
    fn default_trait_matches_toml_defaults() {
        let from_toml: GatewayConfig = toml::from_str("").unwrap();
        let from_default = GatewayConfig::default();
        assert_eq!(from_toml.server.port, from_default.server.port);
        assert_eq!(
            from_toml.session.max_sessions,
            from_default.session.max_sessions
        );
        assert_eq!(from_toml.agent.command, from_default.agent.command);
    }

    #[test]
    fn partial_config_merges_with_defaults() {
        let toml_str = r#"
            [server]
            port = 9443

            [session]
            max_sessions = 20
        "#;
        let config: GatewayConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.port, 9443);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.session.max_sessions, 20);
        assert_eq!(config.session.session_timeout_ms, 3_600_000);
    }

    #[test]
    fn validate_accepts_defaults() {
        let config = GatewayConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_port() {
        let mut config = GatewayConfig::default();
        config.server.port = 0;
        let errs = config.validate().unwrap_err();
        assert!(errs.iter().any(|e| e.contains("port")));
    }

    #[test]
    fn validate_rejects_mismatched_tls_pair() {
        let mut config = GatewayConfig::default();
        config.server.tls_cert = Some("/tmp/cert.pem".to_string());
        config.server.tls_key = None;
        let errs = config.validate().unwrap_err();
        assert!(errs.iter().any(|e| e.contains("tls_cert and server.tls_key")));
    }

    #[test]
    fn validate_rejects_zero_max_sessions() {
        let mut config = GatewayConfig::default();
        config.session.max_sessions = 0;
        let errs = config.validate().unwrap_err();
        assert!(errs.iter().any(|e| e.contains("max_sessions")));
    }

    #[test]
    fn validate_rejects_empty_agent_command() {
        let mut config = GatewayConfig::default();
        config.agent.command = "".to_string();
        let errs = config.validate().unwrap_err();
        assert!(errs.iter().any(|e| e.contains("agent.command")));
    }

    #[test]
    fn validate_warns_on_missing_session_secret_but_does_not_fail() {
        let config = GatewayConfig::default();
        assert!(config.server.session_secret.is_none());
        assert!(config.validate().is_ok());
    }
}
