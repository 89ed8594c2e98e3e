//! Bootstrap configuration for the LUCID agent
//!
//! Loaded once at startup from a TOML file. Runtime-changeable settings
//! (`heartbeat_s`, `log_level`, telemetry) live in the config store instead
//! and override what is set here.

use crate::lifecycle::LifecycleSettings;
use crate::paths::AgentPaths;
use crate::protocol::topics::validate_agent_id;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Complete bootstrap configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BootstrapConfig {
    pub agent: AgentSection,
    pub mqtt: MqttSection,
    #[serde(default)]
    pub paths: PathsSection,
    #[serde(default)]
    pub runtime: RuntimeSection,
    #[serde(default)]
    pub lifecycle: LifecycleSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentSection {
    /// Agent identifier (must match [a-z0-9_]+)
    pub id: String,
    /// Reported version, defaults to the crate version
    pub version: Option<String>,
}

/// MQTT section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// Broker URL, `mqtt://host:port` or `mqtts://host:port`
    pub broker_url: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    /// Heartbeat interval used until the runtime config sets `heartbeat_s`; 0 disables
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
}

fn default_heartbeat_interval() -> u64 {
    30
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PathsSection {
    /// Root of the agent's files; `LUCID_AGENT_BASE_DIR` takes precedence
    pub base_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeSection {
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
    #[serde(default = "default_telemetry_tick_ms")]
    pub telemetry_tick_ms: u64,
    #[serde(default = "default_restart_debounce_secs")]
    pub restart_debounce_secs: u64,
    /// Skip supervisor detection and treat the process as supervised (or not)
    pub assume_supervised: Option<bool>,
}

fn default_worker_pool_size() -> usize {
    4
}

fn default_telemetry_tick_ms() -> u64 {
    1000
}

fn default_restart_debounce_secs() -> u64 {
    10
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            worker_pool_size: default_worker_pool_size(),
            telemetry_tick_ms: default_telemetry_tick_ms(),
            restart_debounce_secs: default_restart_debounce_secs(),
            assume_supervised: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LifecycleSection {
    #[serde(default = "default_release_base_url")]
    pub release_base_url: String,
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
    #[serde(default = "default_max_artifact_bytes")]
    pub max_artifact_bytes: u64,
    /// Package manager executable, defaults to `<base>/venv/bin/pip`
    pub package_manager: Option<PathBuf>,
    #[serde(default = "default_core_owner")]
    pub core_owner: String,
    #[serde(default = "default_core_repo")]
    pub core_repo: String,
    #[serde(default = "default_core_package")]
    pub core_package: String,
}

fn default_release_base_url() -> String {
    crate::lifecycle::manager::DEFAULT_RELEASE_BASE_URL.to_string()
}

fn default_download_timeout_secs() -> u64 {
    crate::lifecycle::download::DEFAULT_DOWNLOAD_TIMEOUT.as_secs()
}

fn default_max_artifact_bytes() -> u64 {
    crate::lifecycle::download::DEFAULT_MAX_ARTIFACT_BYTES
}

fn default_core_owner() -> String {
    crate::lifecycle::manager::DEFAULT_CORE_OWNER.to_string()
}

fn default_core_repo() -> String {
    crate::lifecycle::manager::DEFAULT_CORE_REPO.to_string()
}

fn default_core_package() -> String {
    crate::lifecycle::manager::DEFAULT_CORE_PACKAGE.to_string()
}

impl Default for LifecycleSection {
    fn default() -> Self {
        Self {
            release_base_url: default_release_base_url(),
            download_timeout_secs: default_download_timeout_secs(),
            max_artifact_bytes: default_max_artifact_bytes(),
            package_manager: None,
            core_owner: default_core_owner(),
            core_repo: default_core_repo(),
            core_package: default_core_package(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid agent ID format: {0}")]
    InvalidAgentId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BootstrapConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: BootstrapConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        validate_agent_id(&self.agent.id)
            .map_err(|e| ConfigError::InvalidAgentId(e.to_string()))?;
        if self.mqtt.broker_url.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "mqtt.broker_url must not be empty".to_string(),
            ));
        }
        if self.runtime.worker_pool_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "runtime.worker_pool_size must be at least 1".to_string(),
            ));
        }
        if self.runtime.telemetry_tick_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "runtime.telemetry_tick_ms must be at least 1".to_string(),
            ));
        }
        if self.lifecycle.download_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "lifecycle.download_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Version reported in metadata
    pub fn version(&self) -> String {
        self.agent
            .version
            .clone()
            .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string())
    }

    pub fn resolve_paths(&self) -> AgentPaths {
        AgentPaths::resolve(self.paths.base_dir.as_deref())
    }

    pub fn package_manager_path(&self, paths: &AgentPaths) -> PathBuf {
        self.lifecycle
            .package_manager
            .clone()
            .unwrap_or_else(|| paths.pip_path())
    }

    pub fn lifecycle_settings(&self) -> LifecycleSettings {
        LifecycleSettings {
            release_base_url: self.lifecycle.release_base_url.clone(),
            download_timeout: Duration::from_secs(self.lifecycle.download_timeout_secs),
            max_artifact_bytes: self.lifecycle.max_artifact_bytes,
            core_owner: self.lifecycle.core_owner.clone(),
            core_repo: self.lifecycle.core_repo.clone(),
            core_package: self.lifecycle.core_package.clone(),
        }
    }

    /// Get MQTT username from environment variable
    pub fn get_mqtt_username(&self) -> Option<String> {
        self.mqtt
            .username_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[agent]
id = "test_agent"

[mqtt]
broker_url = "mqtt://localhost:1883"
"#;
        Self::from_toml_str(toml_content).expect("Test config should parse")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[agent]
id = "lab_pi_01"
version = "9.9.9"

[mqtt]
broker_url = "mqtts://broker.lucid.lab:8883"
username_env = "LUCID_MQTT_USER"
password_env = "LUCID_MQTT_PASS"
heartbeat_interval_secs = 60

[paths]
base_dir = "/opt/lucid"

[runtime]
worker_pool_size = 2
telemetry_tick_ms = 500
restart_debounce_secs = 30
assume_supervised = true

[lifecycle]
release_base_url = "https://mirror.lucid.lab"
download_timeout_secs = 120
max_artifact_bytes = 1048576
package_manager = "/opt/lucid/venv/bin/pip"
core_owner = "lucid-fork"
"#;
        let config = BootstrapConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.agent.id, "lab_pi_01");
        assert_eq!(config.version(), "9.9.9");
        assert_eq!(config.mqtt.heartbeat_interval_secs, 60);
        assert_eq!(config.runtime.worker_pool_size, 2);
        assert_eq!(config.runtime.assume_supervised, Some(true));

        let settings = config.lifecycle_settings();
        assert_eq!(settings.release_base_url, "https://mirror.lucid.lab");
        assert_eq!(settings.download_timeout, Duration::from_secs(120));
        assert_eq!(settings.core_owner, "lucid-fork");
        assert_eq!(settings.core_repo, "lucid-agent-core");
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config = BootstrapConfig::test_config();
        assert_eq!(config.mqtt.heartbeat_interval_secs, 30);
        assert_eq!(config.runtime, RuntimeSection::default());
        assert_eq!(config.runtime.worker_pool_size, 4);
        assert_eq!(config.runtime.telemetry_tick_ms, 1000);
        assert_eq!(config.lifecycle, LifecycleSection::default());
        assert_eq!(config.version(), env!("CARGO_PKG_VERSION"));
        assert_eq!(config.lifecycle_settings(), LifecycleSettings::default());
    }

    #[test]
    fn test_invalid_agent_id() {
        let toml_content = r#"
[agent]
id = "Lab-Pi"

[mqtt]
broker_url = "mqtt://localhost:1883"
"#;
        let err = BootstrapConfig::from_toml_str(toml_content).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidAgentId(_)));
    }

    #[test]
    fn test_zero_worker_pool_rejected() {
        let toml_content = r#"
[agent]
id = "pi"

[mqtt]
broker_url = "mqtt://localhost:1883"

[runtime]
worker_pool_size = 0
"#;
        let err = BootstrapConfig::from_toml_str(toml_content).unwrap_err();
        assert!(err.to_string().contains("worker_pool_size"));
    }

    #[test]
    fn test_missing_mqtt_section() {
        let err = BootstrapConfig::from_toml_str("[agent]\nid = \"pi\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::TomlParse(_)));
    }

    #[test]
    fn test_package_manager_defaults_to_venv_pip() {
        let config = BootstrapConfig::test_config();
        let paths = AgentPaths::new("/opt/lucid");
        assert_eq!(
            config.package_manager_path(&paths),
            PathBuf::from("/opt/lucid/venv/bin/pip")
        );
    }
}
