//! Agent configuration
//!
//! Values come from built-in defaults, then a TOML file (explicit `--config`
//! or the first file on the search path), then `HYDRA_*` environment
//! variables. The merged result is validated before anything connects.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::coordinator::ConnectionConfig;
use crate::error::{Error, Result};
use crate::protocol::EngineRevision;
use crate::relay::{parse_method, DispatcherConfig, HttpTargetOptions};

/// Main agent configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Identity and credential
    pub agent: AgentSettings,

    /// Coordinator connection settings
    pub coordinator: CoordinatorSettings,

    /// Target service settings
    pub target: TargetSettings,

    /// Relay dispatch settings
    pub relay: RelaySettings,

    /// Logging configuration
    pub logging: LoggingSettings,
}

/// Agent identity settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Fixed agent identifier (a UUID is generated per process if not set)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Registration token presented to the coordinator
    pub token: String,
}

/// Coordinator connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorSettings {
    /// Coordinator address (http, https, ws or wss).
    ///
    /// A path in the address is the Engine.IO mount path (default
    /// `/socket.io/`), not a Socket.IO namespace; the agent always joins
    /// the root namespace.
    pub url: String,

    /// Engine.IO protocol revision (3 or 4)
    pub engine_revision: EngineRevision,

    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,

    /// Reconnect after the channel is lost
    pub reconnect: bool,

    /// Initial reconnection interval in milliseconds
    pub reconnect_interval_ms: u64,

    /// Maximum reconnection interval in milliseconds
    pub max_reconnect_interval_ms: u64,

    /// Maximum reconnection attempts (0 = infinite)
    pub max_reconnect_attempts: u32,

    /// Event queue capacity
    pub event_queue_size: usize,

    /// Extra query parameters for the handshake
    pub query: BTreeMap<String, String>,
}

/// Target service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetSettings {
    /// Base URL that request paths are appended to
    pub base_url: String,

    /// Method used when a request names none
    pub default_method: String,

    /// Request timeout in milliseconds (0 = none)
    pub timeout_ms: u64,

    /// Skip TLS certificate verification
    pub accept_invalid_certs: bool,
}

/// Relay dispatch settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Maximum concurrent outbound calls (0 = unbounded)
    pub max_in_flight: usize,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Log file path (empty = no file logging)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Number of rotated daily log files to keep
    pub max_files: u32,

    /// Enable JSON formatted logging
    pub json_format: bool,
}

// Default implementations

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:8888".to_string(),
            engine_revision: EngineRevision::V4,
            connect_timeout_ms: 20000,
            reconnect: true,
            reconnect_interval_ms: 1000,
            max_reconnect_interval_ms: 30000,
            max_reconnect_attempts: 0, // Infinite
            event_queue_size: 256,
            query: BTreeMap::new(),
        }
    }
}

impl Default for TargetSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8888/x".to_string(),
            default_method: "POST".to_string(),
            timeout_ms: 0,
            accept_invalid_certs: false,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            max_files: 5,
            json_format: false,
        }
    }
}

impl AgentConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::default();

        // 1. Load from config file if it exists
        if let Some(path) = Self::find_config_file(config_path)? {
            debug!(path = %path.display(), "Loading configuration file");
            let content = fs::read_to_string(&path).map_err(|e| Error::ReadFile {
                path: path.clone(),
                source: e,
            })?;
            config = Self::parse(&content)?;
            info!(path = %path.display(), "Configuration loaded from file");
        }

        // 2. Apply environment variable overrides
        config.apply_env_overrides();

        // 3. Expand paths
        config.expand_paths();

        // 4. Validate
        config.validate()?;

        Ok(config)
    }

    /// Parse TOML configuration content
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::ConfigSyntax {
            message: e.message().to_string(),
            source: Some(e),
        })
    }

    /// Find the configuration file to use
    fn find_config_file(explicit_path: Option<&str>) -> Result<Option<PathBuf>> {
        // If explicit path provided, use it (error if not found)
        if let Some(path) = explicit_path {
            let path = PathBuf::from(expand_path(path));
            if path.exists() {
                return Ok(Some(path));
            }
            return Err(Error::missing_config(path));
        }

        let search_paths = [
            // Current directory
            PathBuf::from("hydra-agent.toml"),
            PathBuf::from("config.toml"),
            // User config directory
            dirs::config_dir()
                .map(|p| p.join("hydra").join("agent.toml"))
                .unwrap_or_default(),
            // Home directory
            dirs::home_dir()
                .map(|p| p.join(".hydra").join("agent.toml"))
                .unwrap_or_default(),
            // System config (Linux)
            PathBuf::from("/etc/hydra/agent.toml"),
        ];

        for path in &search_paths {
            if !path.as_os_str().is_empty() && path.exists() {
                debug!(path = %path.display(), "Found configuration file");
                return Ok(Some(path.clone()));
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(None)
    }

    /// Apply `HYDRA_*` environment overrides on top of the file values
    fn apply_env_overrides(&mut self) {
        if let Ok(id) = std::env::var("HYDRA_AGENT_ID") {
            self.agent.id = Some(id);
        }
        env_override("TOKEN", &mut self.agent.token);

        let coordinator = &mut self.coordinator;
        env_override("COORDINATOR_URL", &mut coordinator.url);
        env_override("ENGINE_REVISION", &mut coordinator.engine_revision);
        env_override("CONNECT_TIMEOUT_MS", &mut coordinator.connect_timeout_ms);
        env_flag("RECONNECT", &mut coordinator.reconnect);
        env_override("RECONNECT_INTERVAL_MS", &mut coordinator.reconnect_interval_ms);
        env_override("MAX_RECONNECT_INTERVAL_MS", &mut coordinator.max_reconnect_interval_ms);
        env_override("MAX_RECONNECT_ATTEMPTS", &mut coordinator.max_reconnect_attempts);
        env_override("EVENT_QUEUE_SIZE", &mut coordinator.event_queue_size);

        let target = &mut self.target;
        env_override("TARGET_URL", &mut target.base_url);
        env_override("TARGET_METHOD", &mut target.default_method);
        env_override("TARGET_TIMEOUT_MS", &mut target.timeout_ms);
        env_flag("TARGET_INSECURE", &mut target.accept_invalid_certs);

        env_override("MAX_IN_FLIGHT", &mut self.relay.max_in_flight);

        env_override("LOG_LEVEL", &mut self.logging.level);
        if let Ok(file) = std::env::var("HYDRA_LOG_FILE") {
            self.logging.file = Some(file);
        }
        env_flag("LOG_JSON", &mut self.logging.json_format);
    }

    /// Expand ~ and other path variables
    fn expand_paths(&mut self) {
        if let Some(ref file) = self.logging.file {
            self.logging.file = Some(expand_path(file));
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        validate_url(
            "coordinator.url",
            &self.coordinator.url,
            &["http", "https", "ws", "wss"],
        )?;
        validate_url("target.base_url", &self.target.base_url, &["http", "https"])?;

        if self.coordinator.connect_timeout_ms == 0 {
            return Err(Error::invalid_field(
                "coordinator.connect_timeout_ms",
                "must be greater than 0",
            ));
        }
        if self.coordinator.reconnect_interval_ms == 0 {
            return Err(Error::invalid_field(
                "coordinator.reconnect_interval_ms",
                "must be greater than 0",
            ));
        }
        if self.coordinator.max_reconnect_interval_ms < self.coordinator.reconnect_interval_ms {
            return Err(Error::invalid_field(
                "coordinator.max_reconnect_interval_ms",
                "must not be less than reconnect_interval_ms",
            ));
        }
        if self.coordinator.event_queue_size == 0 {
            return Err(Error::invalid_field(
                "coordinator.event_queue_size",
                "must be greater than 0",
            ));
        }

        parse_method(&self.target.default_method).map_err(|_| {
            Error::invalid_field(
                "target.default_method",
                format!("Invalid HTTP method '{}'", self.target.default_method),
            )
        })?;

        // Validate log level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(Error::invalid_field(
                "logging.level",
                format!(
                    "Invalid log level '{}'. Must be one of: {}",
                    self.logging.level,
                    valid_levels.join(", ")
                ),
            ));
        }

        Ok(())
    }

    // ─────────────────────────────────────────────────────────────
    // Component Configuration
    // ─────────────────────────────────────────────────────────────

    /// Settings for the connection manager
    pub fn connection_config(&self) -> ConnectionConfig {
        let c = &self.coordinator;
        ConnectionConfig {
            url: c.url.clone(),
            engine_revision: c.engine_revision,
            query: c.query.clone(),
            connect_timeout: Duration::from_millis(c.connect_timeout_ms),
            reconnect: c.reconnect,
            max_reconnect_attempts: c.max_reconnect_attempts,
            initial_reconnect_delay: Duration::from_millis(c.reconnect_interval_ms),
            max_reconnect_delay: Duration::from_millis(c.max_reconnect_interval_ms),
            message_queue_size: c.event_queue_size,
        }
    }

    /// Settings for the relay dispatcher
    pub fn dispatcher_config(&self) -> Result<DispatcherConfig> {
        Ok(DispatcherConfig {
            base_url: self.target.base_url.clone(),
            default_method: parse_method(&self.target.default_method)?,
            max_in_flight: self.relay.max_in_flight,
        })
    }

    /// Options for the HTTP target client
    pub fn target_options(&self) -> HttpTargetOptions {
        HttpTargetOptions {
            timeout: (self.target.timeout_ms > 0)
                .then(|| Duration::from_millis(self.target.timeout_ms)),
            accept_invalid_certs: self.target.accept_invalid_certs,
        }
    }
}

fn validate_url(field: &str, value: &str, schemes: &[&str]) -> Result<()> {
    if value.is_empty() {
        return Err(Error::invalid_field(field, "cannot be empty"));
    }
    let url = Url::parse(value).map_err(|e| {
        Error::invalid_field(field, format!("not a valid URL: {}", e))
    })?;
    if !schemes.contains(&url.scheme()) {
        return Err(Error::invalid_field(
            field,
            format!("scheme must be one of: {}", schemes.join(", ")),
        ));
    }
    Ok(())
}

/// Replace `slot` with `HYDRA_<name>` when it is set and parses
fn env_override<T>(name: &str, slot: &mut T)
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let var = format!("HYDRA_{}", name);
    if let Ok(raw) = std::env::var(&var) {
        match raw.parse() {
            Ok(value) => *slot = value,
            Err(e) => warn!(var = %var, value = %raw, error = %e, "Ignoring invalid environment override"),
        }
    }
}

/// `true`/`1`/`yes` enable, anything else disables
fn env_flag(name: &str, slot: &mut bool) {
    if let Ok(raw) = std::env::var(format!("HYDRA_{}", name)) {
        *slot = matches!(raw.to_ascii_lowercase().as_str(), "true" | "1" | "yes");
    }
}

/// Expand ~ and environment variables in paths
fn expand_path(path: &str) -> String {
    shellexpand::full(path)
        .unwrap_or_else(|_| std::borrow::Cow::Borrowed(path))
        .into_owned()
}

/// Write the commented default configuration and return where it went
pub fn init_config(path: Option<&str>, force: bool) -> Result<PathBuf> {
    let config_path = path
        .map(|p| PathBuf::from(expand_path(p)))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".hydra")
                .join("agent.toml")
        });

    if config_path.exists() && !force {
        return Err(Error::ConfigExists { path: config_path });
    }

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::WriteFile {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }

    fs::write(&config_path, generate_default_config()).map_err(|e| Error::WriteFile {
        path: config_path.clone(),
        source: e,
    })?;

    Ok(config_path)
}

/// Generate default configuration content with comments
fn generate_default_config() -> String {
    r#"# Hydra Agent Configuration

[agent]
# Fixed agent identifier (a UUID is generated per process if not set)
# id = "agent-1"

# Registration token presented to the coordinator
token = ""

[coordinator]
# Coordinator address (http, https, ws or wss). A path here replaces the
# Engine.IO mount path /socket.io/; it does not select a namespace.
url = "http://localhost:8888"

# Engine.IO protocol revision: 4 for Socket.IO 3.x/4.x servers, 3 for 2.x
engine_revision = 4

# Connection timeout in milliseconds
connect_timeout_ms = 20000

# Reconnect after the channel is lost
reconnect = true

# Reconnection backoff bounds in milliseconds
reconnect_interval_ms = 1000
max_reconnect_interval_ms = 30000

# Maximum reconnection attempts (0 = infinite)
max_reconnect_attempts = 0

# Event queue capacity
event_queue_size = 256

# Extra handshake query parameters
[coordinator.query]
# region = "eu-west"

[target]
# Base URL that request paths are appended to
base_url = "http://localhost:8888/x"

# Method used when a request names none
default_method = "POST"

# Request timeout in milliseconds (0 = none)
timeout_ms = 0

# Skip TLS certificate verification
accept_invalid_certs = false

[relay]
# Maximum concurrent outbound calls (0 = unbounded)
max_in_flight = 0

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log file path (comment out to disable file logging)
# file = "~/.hydra/logs/agent.log"

# Number of rotated daily log files to keep
max_files = 5

# Enable JSON formatted logging
json_format = false
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    use reqwest::Method;

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert_eq!(config.coordinator.url, "http://localhost:8888");
        assert_eq!(config.target.base_url, "http://localhost:8888/x");
        assert_eq!(config.target.default_method, "POST");
        assert_eq!(config.relay.max_in_flight, 0);
        assert!(config.coordinator.reconnect);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_env_override() {
        env::set_var("HYDRA_TARGET_URL", "https://target.example.com/api");
        env::set_var("HYDRA_MAX_IN_FLIGHT", "8");
        env::set_var("HYDRA_ENGINE_REVISION", "3");
        env::set_var("HYDRA_RECONNECT", "false");
        env::set_var("HYDRA_CONNECT_TIMEOUT_MS", "1500");
        env::set_var("HYDRA_MAX_RECONNECT_INTERVAL_MS", "9000");
        env::set_var("HYDRA_EVENT_QUEUE_SIZE", "64");

        let mut config = AgentConfig::default();
        config.apply_env_overrides();

        assert_eq!(config.target.base_url, "https://target.example.com/api");
        assert_eq!(config.relay.max_in_flight, 8);
        assert_eq!(config.coordinator.engine_revision, EngineRevision::V3);
        assert!(!config.coordinator.reconnect);
        assert_eq!(config.coordinator.connect_timeout_ms, 1500);
        assert_eq!(config.coordinator.max_reconnect_interval_ms, 9000);
        assert_eq!(config.coordinator.event_queue_size, 64);

        env::remove_var("HYDRA_TARGET_URL");
        env::remove_var("HYDRA_MAX_IN_FLIGHT");
        env::remove_var("HYDRA_ENGINE_REVISION");
        env::remove_var("HYDRA_RECONNECT");
        env::remove_var("HYDRA_CONNECT_TIMEOUT_MS");
        env::remove_var("HYDRA_MAX_RECONNECT_INTERVAL_MS");
        env::remove_var("HYDRA_EVENT_QUEUE_SIZE");
    }

    #[test]
    fn test_validation_valid_config() {
        assert!(AgentConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validation_invalid_coordinator_url() {
        let mut config = AgentConfig::default();
        config.coordinator.url = "ftp://coordinator".to_string();
        assert!(config.validate().is_err());

        config.coordinator.url = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_target_must_be_http() {
        let mut config = AgentConfig::default();
        config.target.base_url = "ws://localhost:1234".to_string();
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            Error::ConfigInvalid { ref field, .. } if field == "target.base_url"
        ));
    }

    #[test]
    fn test_validation_invalid_method() {
        let mut config = AgentConfig::default();
        config.target.default_method = "NOT VALID".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_reconnect_bounds() {
        let mut config = AgentConfig::default();
        config.coordinator.reconnect_interval_ms = 5000;
        config.coordinator.max_reconnect_interval_ms = 1000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_invalid_log_level() {
        let mut config = AgentConfig::default();
        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_path_expansion() {
        let mut config = AgentConfig::default();
        config.logging.file = Some("~/logs/agent.log".to_string());
        config.expand_paths();
        assert!(!config.logging.file.unwrap().contains('~'));
    }

    #[test]
    fn test_generated_default_config_parses() {
        let config = AgentConfig::parse(&generate_default_config()).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.coordinator.engine_revision, EngineRevision::V4);
        assert!(config.coordinator.query.is_empty());
    }

    #[test]
    fn test_parse_config_file() {
        let config_str = r#"
[agent]
id = "agent-7"
token = "s3cret"

[coordinator]
url = "https://gate.example.com"
engine_revision = 3
reconnect = false

[coordinator.query]
region = "eu"

[target]
base_url = "http://127.0.0.1:9000/predict"
default_method = "put"
timeout_ms = 2500

[relay]
max_in_flight = 4
"#;

        let config = AgentConfig::parse(config_str).unwrap();

        assert_eq!(config.agent.id.as_deref(), Some("agent-7"));
        assert_eq!(config.agent.token, "s3cret");
        assert_eq!(config.coordinator.engine_revision, EngineRevision::V3);
        assert_eq!(config.coordinator.query.get("region").map(String::as_str), Some("eu"));

        let connection = config.connection_config();
        assert!(!connection.reconnect);
        assert_eq!(connection.url, "https://gate.example.com");

        let dispatcher = config.dispatcher_config().unwrap();
        assert_eq!(dispatcher.default_method, Method::PUT);
        assert_eq!(dispatcher.max_in_flight, 4);

        let options = config.target_options();
        assert_eq!(options.timeout, Some(Duration::from_millis(2500)));
    }

    #[test]
    fn test_parse_rejects_bad_revision() {
        let err = AgentConfig::parse("[coordinator]\nengine_revision = 5\n").unwrap_err();
        assert!(matches!(err, Error::ConfigSyntax { .. }));
    }

    #[test]
    fn test_zero_timeout_means_none() {
        assert!(AgentConfig::default().target_options().timeout.is_none());
    }
}
