//! MCP client configuration loading and validation.
//!
//! Reads an optional `mcp-client.yaml` and applies environment overrides.
//! Every field has a default, so an empty file (or no file) is a valid
//! configuration.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use super::errors::McpError;

/// Config file name searched for upward from the working directory.
pub const CONFIG_FILE_NAME: &str = "mcp-client.yaml";

/// Environment variable pointing directly at a config file.
pub const CONFIG_PATH_ENV: &str = "PLAYGROUND_CONFIG";

const STDIO_SCHEME: &str = "stdio://";

// ─── Public Types ────────────────────────────────────────────────────────────

/// How the client reaches the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Child process, newline-delimited JSON over stdin/stdout.
    Stdio,
    /// Accepted in config for compatibility; rejected at validation.
    #[serde(alias = "ws")]
    WebSocket,
}

impl TransportKind {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "stdio" => Some(Self::Stdio),
            "websocket" | "ws" => Some(Self::WebSocket),
            _ => None,
        }
    }
}

/// Runtime configuration for one MCP server connection.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct McpClientConfig {
    /// Master switch. `MCP_ENABLED` overrides it when set.
    pub enabled: bool,
    /// `stdio://<path>`; a bare path is accepted too.
    pub server_url: String,
    pub server_type: TransportKind,
    /// Interpreter the server script is launched with.
    pub runtime: String,
    /// Extra arguments appended after the server path.
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    /// Working directory for the server process (inherits ours if unset).
    pub working_dir: Option<PathBuf>,
    /// Name stamped on catalog entries and log lines.
    pub server_name: String,
    /// Category given to every discovered tool, used for relevance scoring.
    pub category: Option<String>,
    pub client_name: String,
    pub client_version: String,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub request_timeout_ms: u64,
    pub init_timeout_ms: u64,
    pub call_timeout_ms: u64,
}

impl Default for McpClientConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            server_url: "stdio://./mcp-server/server.js".to_string(),
            server_type: TransportKind::Stdio,
            runtime: "node".to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            server_name: "playground".to_string(),
            category: Some("basic".to_string()),
            client_name: "chatbot-playground".to_string(),
            client_version: "1.0.0".to_string(),
            max_retries: 5,
            retry_delay_ms: 5_000,
            request_timeout_ms: 30_000,
            init_timeout_ms: 30_000,
            call_timeout_ms: 30_000,
        }
    }
}

impl McpClientConfig {
    /// Parse a YAML config file.
    pub fn load(path: &Path) -> Result<Self, McpError> {
        let text = std::fs::read_to_string(path).map_err(|e| McpError::ConfigError {
            reason: format!("failed to read {}: {e}", path.display()),
        })?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self, McpError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text).map_err(|e| McpError::ConfigError {
            reason: format!("invalid MCP client config: {e}"),
        })
    }

    /// Resolve the effective configuration: file (if any), then environment.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, McpError> {
        let path = match explicit {
            Some(p) => Some(p.to_path_buf()),
            None => std::env::current_dir().ok().and_then(|cwd| find_config_path(&cwd)),
        };

        let mut config = match path {
            Some(p) => {
                tracing::info!(path = %p.display(), "loading MCP client config");
                Self::load(&p)?
            }
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply `MCP_ENABLED`, `MCP_SERVER_URL`, `MCP_SERVER_TYPE`, `MCP_RUNTIME`.
    ///
    /// The lookup is injected so tests never touch process environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(enabled) = lookup("MCP_ENABLED") {
            self.enabled = enabled.trim() == "true";
        }
        if let Some(url) = lookup("MCP_SERVER_URL") {
            self.server_url = url;
        }
        if let Some(kind) = lookup("MCP_SERVER_TYPE") {
            match TransportKind::parse(&kind) {
                Some(kind) => self.server_type = kind,
                None => tracing::warn!(value = %kind, "ignoring unknown MCP_SERVER_TYPE"),
            }
        }
        if let Some(runtime) = lookup("MCP_RUNTIME") {
            self.runtime = runtime;
        }
    }

    /// Reject configurations the client cannot run.
    pub fn validate(&self) -> Result<(), McpError> {
        if self.server_type == TransportKind::WebSocket {
            return Err(McpError::ConfigError {
                reason: "WebSocket MCP connection not supported".into(),
            });
        }
        if self.runtime.trim().is_empty() {
            return Err(McpError::ConfigError {
                reason: "runtime must not be empty".into(),
            });
        }
        if self.server_path_raw().is_empty() {
            return Err(McpError::ConfigError {
                reason: "server_url does not name a server script".into(),
            });
        }
        for (name, ms) in [
            ("request_timeout_ms", self.request_timeout_ms),
            ("init_timeout_ms", self.init_timeout_ms),
            ("call_timeout_ms", self.call_timeout_ms),
        ] {
            if ms == 0 {
                return Err(McpError::ConfigError {
                    reason: format!("{name} must be greater than zero"),
                });
            }
        }
        Ok(())
    }

    fn server_path_raw(&self) -> &str {
        self.server_url
            .strip_prefix(STDIO_SCHEME)
            .unwrap_or(&self.server_url)
            .trim()
    }

    /// The server script path, resolved against `base` when relative.
    pub fn server_path(&self, base: &Path) -> PathBuf {
        let raw = Path::new(self.server_path_raw());
        if raw.is_absolute() {
            raw.to_path_buf()
        } else {
            base.join(raw)
        }
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the config file.
///
/// `PLAYGROUND_CONFIG` wins when it names an existing file; otherwise search
/// upward from `start` for `mcp-client.yaml`.
pub fn find_config_path(start: &Path) -> Option<PathBuf> {
    if let Ok(explicit) = std::env::var(CONFIG_PATH_ENV) {
        let candidate = PathBuf::from(explicit);
        if candidate.is_file() {
            return Some(candidate);
        }
        tracing::warn!(path = %candidate.display(), "{CONFIG_PATH_ENV} does not point at a file");
    }

    let mut dir = Some(start);
    while let Some(current) = dir {
        let candidate = current.join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            return Some(candidate);
        }
        dir = current.parent();
    }
    None
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = McpClientConfig::default();
        assert!(config.enabled);
        assert_eq!(config.runtime, "node");
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.retry_delay(), Duration::from_secs(5));
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = McpClientConfig::from_yaml(
            "server_url: stdio://../mcp-servers/simple-tools/server.js\nmax_retries: 2\n",
        )
        .unwrap();
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.runtime, "node");
        assert_eq!(config.call_timeout_ms, 30_000);
    }

    #[test]
    fn test_empty_yaml_is_default() {
        let config = McpClientConfig::from_yaml("  \n").unwrap();
        assert_eq!(config.server_name, "playground");
    }

    #[test]
    fn test_invalid_yaml_is_config_error() {
        let err = McpClientConfig::from_yaml("max_retries: [oops").unwrap_err();
        assert!(matches!(err, McpError::ConfigError { .. }));
    }

    #[test]
    fn test_server_path_strips_scheme_and_resolves() {
        let config = McpClientConfig::default();
        let path = config.server_path(Path::new("/srv/playground"));
        assert_eq!(path, PathBuf::from("/srv/playground/./mcp-server/server.js"));

        let absolute = McpClientConfig {
            server_url: "/opt/tools/server.js".into(),
            ..McpClientConfig::default()
        };
        assert_eq!(
            absolute.server_path(Path::new("/ignored")),
            PathBuf::from("/opt/tools/server.js")
        );
    }

    #[test]
    fn test_env_overrides() {
        let mut config = McpClientConfig::default();
        config.apply_env_overrides(|key| match key {
            "MCP_ENABLED" => Some("false".into()),
            "MCP_SERVER_URL" => Some("stdio:///tmp/server.js".into()),
            "MCP_RUNTIME" => Some("bun".into()),
            _ => None,
        });
        assert!(!config.enabled);
        assert_eq!(config.server_url, "stdio:///tmp/server.js");
        assert_eq!(config.runtime, "bun");
    }

    #[test]
    fn test_websocket_rejected() {
        let mut config = McpClientConfig::default();
        config.apply_env_overrides(|key| (key == "MCP_SERVER_TYPE").then(|| "websocket".into()));
        assert_eq!(config.server_type, TransportKind::WebSocket);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("WebSocket"));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = McpClientConfig {
            call_timeout_ms: 0,
            ..McpClientConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_find_config_path_searches_upward() {
        let root = tempfile::tempdir().unwrap();
        let nested = root.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(root.path().join(CONFIG_FILE_NAME), "max_retries: 1\n").unwrap();

        let found = find_config_path(&nested).unwrap();
        assert_eq!(found, root.path().join(CONFIG_FILE_NAME));
        assert_eq!(McpClientConfig::load(&found).unwrap().max_retries, 1);
    }
}
