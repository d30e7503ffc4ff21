//! Configuration loader.
//!
//! Loads configuration from:
//! 1. Default values
//! 2. `.extkit/config.yaml` in the project directory
//! 3. `~/.extkit/config.yaml` in the home directory
//! 4. An explicit file passed on the command line
//! 5. Environment variables with the `EXTKIT_` prefix
//!    (nested keys use `__`, e.g. `EXTKIT_EXTENSIONS__INSTALL_TIMEOUT_SECS=30`)

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct ExtkitConfig {
    #[serde(default)]
    pub extensions: ExtensionsConfig,
    #[serde(default)]
    pub health: HealthConfig,
}

/// Extension lifecycle settings
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ExtensionsConfig {
    /// Directory holding `publisher.name-version` folders and `extensions.json`
    #[serde(default = "default_root")]
    pub root: PathBuf,
    /// Base URL of an Open VSX compatible registry
    #[serde(default = "default_registry_url")]
    pub registry_url: String,
    /// Host API version checked against `engines.vscode`
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_install_timeout")]
    pub install_timeout_secs: u64,
    /// Grace period before a failed install is cleaned up automatically
    #[serde(default = "default_auto_uninstall_delay")]
    pub auto_uninstall_delay_secs: u64,
    #[serde(default = "default_health_sweep_interval")]
    pub health_sweep_interval_secs: u64,
}

fn default_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".extkit")
        .join("extensions")
}

fn default_registry_url() -> String {
    "https://open-vsx.org".to_string()
}

fn default_api_version() -> String {
    "1.90.0".to_string()
}

fn default_install_timeout() -> u64 {
    120
}

fn default_auto_uninstall_delay() -> u64 {
    30
}

fn default_health_sweep_interval() -> u64 {
    60
}

impl Default for ExtensionsConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            registry_url: default_registry_url(),
            api_version: default_api_version(),
            install_timeout_secs: default_install_timeout(),
            auto_uninstall_delay_secs: default_auto_uninstall_delay(),
            health_sweep_interval_secs: default_health_sweep_interval(),
        }
    }
}

impl ExtensionsConfig {
    /// Settings rooted at `root`, defaults elsewhere
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    /// Location of the persisted registry
    pub fn registry_file(&self) -> PathBuf {
        self.root.join("extensions.json")
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }

    pub fn auto_uninstall_delay(&self) -> Duration {
        Duration::from_secs(self.auto_uninstall_delay_secs)
    }

    pub fn health_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.health_sweep_interval_secs.max(1))
    }
}

/// Thresholds for health-driven remediation
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HealthConfig {
    /// Consecutive failures before an extension is disabled
    #[serde(default = "default_disable_after")]
    pub disable_after_failures: u32,
    /// Total failures before an extension is uninstalled
    #[serde(default = "default_uninstall_after")]
    pub uninstall_after_failures: u32,
}

fn default_disable_after() -> u32 {
    3
}

fn default_uninstall_after() -> u32 {
    6
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            disable_after_failures: default_disable_after(),
            uninstall_after_failures: default_uninstall_after(),
        }
    }
}

/// Project configuration file written by `extkit init`
pub const PROJECT_CONFIG: &str = ".extkit/config.yaml";

/// YAML rendering of `config`, suitable for a config file
pub fn to_yaml(config: &ExtkitConfig) -> Result<String, serde_yaml::Error> {
    serde_yaml::to_string(config)
}

/// Load configuration from all sources
pub fn load_config() -> Result<ExtkitConfig, ConfigError> {
    load_config_with(None)
}

/// Load configuration, layering `explicit` above the project and home files
pub fn load_config_with(explicit: Option<&Path>) -> Result<ExtkitConfig, ConfigError> {
    let mut builder = Config::builder();

    builder = builder
        .set_default("extensions.root", default_root().to_string_lossy().to_string())?
        .set_default("extensions.registry_url", default_registry_url())?
        .set_default("extensions.api_version", default_api_version())?
        .set_default("extensions.install_timeout_secs", default_install_timeout())?
        .set_default(
            "extensions.auto_uninstall_delay_secs",
            default_auto_uninstall_delay(),
        )?
        .set_default(
            "extensions.health_sweep_interval_secs",
            default_health_sweep_interval(),
        )?
        .set_default("health.disable_after_failures", default_disable_after())?
        .set_default("health.uninstall_after_failures", default_uninstall_after())?;

    let project_config = PathBuf::from(PROJECT_CONFIG);
    if project_config.exists() {
        builder = builder.add_source(File::from(project_config).required(false));
    }

    if let Some(home) = dirs::home_dir() {
        let home_config = home.join(".extkit/config.yaml");
        if home_config.exists() {
            builder = builder.add_source(File::from(home_config).required(false));
        }
    }

    if let Some(path) = explicit {
        builder = builder.add_source(File::from(path.to_path_buf()).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix("EXTKIT")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_default_extensions_config() {
        let config = ExtensionsConfig::default();
        assert_eq!(config.install_timeout_secs, 120);
        assert_eq!(config.auto_uninstall_delay_secs, 30);
        assert_eq!(config.health_sweep_interval_secs, 60);
        assert_eq!(config.registry_url, "https://open-vsx.org");
        assert!(config.root.ends_with(".extkit/extensions"));
    }

    #[test]
    fn test_registry_file_under_root() {
        let config = ExtensionsConfig::with_root("/tmp/ext");
        assert_eq!(config.registry_file(), PathBuf::from("/tmp/ext/extensions.json"));
    }

    #[test]
    fn test_durations() {
        let config = ExtensionsConfig {
            install_timeout_secs: 5,
            health_sweep_interval_secs: 0,
            ..Default::default()
        };
        assert_eq!(config.install_timeout(), Duration::from_secs(5));
        // A zero interval would make the sweep spin
        assert_eq!(config.health_sweep_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_default_health_config() {
        let config = HealthConfig::default();
        assert_eq!(config.disable_after_failures, 3);
        assert_eq!(config.uninstall_after_failures, 6);
    }

    #[test]
    fn test_partial_deserialization_uses_defaults() {
        let config: ExtkitConfig = serde_json::from_value(serde_json::json!({
            "extensions": { "install_timeout_secs": 10 }
        }))
        .unwrap();
        assert_eq!(config.extensions.install_timeout_secs, 10);
        assert_eq!(config.extensions.api_version, "1.90.0");
        assert_eq!(config.health.disable_after_failures, 3);
    }

    #[test]
    fn test_load_config_with_explicit_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("extkit.yaml");
        fs::write(
            &path,
            "extensions:\n  root: /srv/extensions\n  install_timeout_secs: 15\nhealth:\n  disable_after_failures: 1\n",
        )
        .unwrap();

        let config = load_config_with(Some(&path)).unwrap();
        assert_eq!(config.extensions.root, PathBuf::from("/srv/extensions"));
        assert_eq!(config.extensions.install_timeout_secs, 15);
        assert_eq!(config.health.disable_after_failures, 1);
        assert_eq!(config.health.uninstall_after_failures, 6);
    }

    #[test]
    fn test_yaml_rendering_loads_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        let mut config = ExtkitConfig::default();
        config.extensions.root = PathBuf::from("/opt/extkit");
        config.extensions.api_version = "1.95.0".to_string();
        config.health.uninstall_after_failures = 9;
        fs::write(&path, to_yaml(&config).unwrap()).unwrap();

        let loaded = load_config_with(Some(&path)).unwrap();
        assert_eq!(loaded.extensions.root, PathBuf::from("/opt/extkit"));
        assert_eq!(loaded.extensions.api_version, "1.95.0");
        assert_eq!(loaded.health.uninstall_after_failures, 9);
        assert_eq!(loaded.extensions.install_timeout_secs, 120);
    }
}
