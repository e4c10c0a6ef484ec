//! agentgate configuration management

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Maximum accepted request body, in bytes (50 KB)
pub const DEFAULT_BODY_LIMIT: usize = 50 * 1024;

/// Default gateway request timeout, in milliseconds
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

/// Main agentgate configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentGateConfig {
    /// Gateway server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Agent process configuration
    #[serde(default)]
    pub agents: AgentsConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AgentGateConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the configuration to use at startup.
    ///
    /// An explicit path must exist. Without one, the default location
    /// (`<config_dir>/agentgate/config.toml`) is used when present.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        match default_config_path() {
            Some(path) if path.exists() => Self::from_file(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Reject values the gateway cannot operate with
    pub fn validate(&self) -> Result<()> {
        if self.server.body_limit_bytes == 0 {
            return Err(Error::Config("server.body_limit_bytes must be > 0".to_string()));
        }
        if self.server.request_timeout_ms == 0 {
            return Err(Error::Config(
                "server.request_timeout_ms must be > 0".to_string(),
            ));
        }
        if matches!(&self.server.token, Some(token) if token.is_empty()) {
            return Err(Error::Config("server.token must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Default configuration file location
pub fn default_config_path() -> Option<PathBuf> {
    dirs_next::config_dir().map(|dir| dir.join("agentgate").join("config.toml"))
}

/// Gateway server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Bearer token for protected handlers and `/server/*` routes.
    /// A random token is generated at startup when unset.
    pub token: Option<String>,

    /// Maximum request body / WebSocket frame size in bytes
    pub body_limit_bytes: usize,

    /// Default per-request handler timeout in milliseconds
    pub request_timeout_ms: u64,

    /// Allowed CORS origins (empty = mirror any origin)
    pub cors_origins: Vec<String>,

    /// Expose non-public error details to callers
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3003,
            token: None,
            body_limit_bytes: DEFAULT_BODY_LIMIT,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            cors_origins: Vec::new(),
            dev_mode: false,
        }
    }
}

impl ServerConfig {
    /// Default request timeout as a `Duration`
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Fill in a random token when none is set, returning the new token
    pub fn ensure_token(&mut self) -> Option<String> {
        if self.token.as_deref().is_some_and(|token| !token.is_empty()) {
            return None;
        }
        let token = crate::token::generate_token();
        self.token = Some(token.clone());
        Some(token)
    }
}

/// Agent process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    /// Worker executable (None = the running agentgate binary)
    pub command: Option<PathBuf>,

    /// Worker arguments (defaults to `["worker"]` when `command` is unset)
    pub args: Vec<String>,

    /// Relaunch attempts after an unexpected exit
    pub max_restarts: u32,

    /// Grace period between a shutdown request and a forced kill
    pub stop_timeout_ms: u64,

    /// How long a freshly spawned worker has to answer its first ping
    pub ready_timeout_ms: u64,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            max_restarts: 3,
            stop_timeout_ms: 5_000,
            ready_timeout_ms: 10_000,
        }
    }
}

impl AgentsConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    /// Resolve the worker program and its arguments
    pub fn worker_command(&self) -> Result<(PathBuf, Vec<String>)> {
        match &self.command {
            Some(command) => Ok((command.clone(), self.args.clone())),
            None => {
                let exe = std::env::current_exe().map_err(|e| {
                    Error::Config(format!("Cannot resolve agentgate executable: {}", e))
                })?;
                let args = if self.args.is_empty() {
                    vec!["worker".to_string()]
                } else {
                    self.args.clone()
                };
                Ok((exe, args))
            }
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human readable
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Output format
    pub format: LogFormat,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AgentGateConfig::default();
        assert_eq!(config.server.port, 3003);
        assert_eq!(config.server.body_limit_bytes, 51_200);
        assert_eq!(config.server.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.agents.max_restarts, 3);
        assert!(config.server.token.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config = AgentGateConfig::from_toml(
            r#"
            [server]
            port = 9000
            token = "secret"

            [logging]
            format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.token.as_deref(), Some("secret"));
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.agents.stop_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_empty_token_rejected() {
        let result = AgentGateConfig::from_toml("[server]\ntoken = \"\"\n");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_ensure_token() {
        let mut server = ServerConfig::default();
        let generated = server.ensure_token().unwrap();
        assert_eq!(server.token.as_deref(), Some(generated.as_str()));
        assert!(server.ensure_token().is_none());

        let mut server = ServerConfig {
            token: Some("fixed".to_string()),
            ..ServerConfig::default()
        };
        assert!(server.ensure_token().is_none());
        assert_eq!(server.token.as_deref(), Some("fixed"));
    }

    #[test]
    fn test_invalid_toml_rejected() {
        let result = AgentGateConfig::from_toml("[server\nport = ");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[agents]\nmax_restarts = 0\n").unwrap();

        let config = AgentGateConfig::load(Some(&path)).unwrap();
        assert_eq!(config.agents.max_restarts, 0);
    }

    #[test]
    fn test_load_missing_explicit_path() {
        let result = AgentGateConfig::load(Some(Path::new("/nonexistent/agentgate.toml")));
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[test]
    fn test_worker_command_explicit() {
        let agents = AgentsConfig {
            command: Some(PathBuf::from("/usr/bin/agent")),
            args: vec!["--stdio".to_string()],
            ..Default::default()
        };
        let (program, args) = agents.worker_command().unwrap();
        assert_eq!(program, PathBuf::from("/usr/bin/agent"));
        assert_eq!(args, vec!["--stdio".to_string()]);
    }

    #[test]
    fn test_worker_command_defaults_to_self() {
        let (_program, args) = AgentsConfig::default().worker_command().unwrap();
        assert_eq!(args, vec!["worker".to_string()]);
    }

    #[test]
    fn test_round_trip_toml() {
        let config = AgentGateConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed = AgentGateConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.server.port, config.server.port);
    }
}
