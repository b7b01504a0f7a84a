//! Configuration loading and types

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uplift_core::{ConfigBag, SchedulerConfig};

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "UPLIFT_CONFIG";

/// Prefix of environment overrides passed to actors
pub const ACTOR_ENV_PREFIX: &str = "UPLIFT_";

/// Top-level configuration for the uplift binary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding one state file per run
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Workflow manifest
    #[serde(default = "default_manifest")]
    pub manifest: PathBuf,
    /// Upper bound for a single actor, in seconds
    #[serde(default = "default_actor_timeout_secs")]
    pub actor_timeout_secs: u64,
    /// Logging settings
    #[serde(default)]
    pub log: LogConfig,
    /// Reboot settings
    #[serde(default)]
    pub reboot: RebootConfig,
    /// Overrides passed unchanged to every actor
    #[serde(default)]
    pub actor_config: ConfigBag,
    /// Pre-recorded dialog answers
    #[serde(default)]
    pub answers: BTreeMap<String, Value>,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error); `RUST_LOG` wins
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Reboot settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RebootConfig {
    /// Command that reboots the machine; without it the operator reboots
    #[serde(default)]
    pub command: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            manifest: default_manifest(),
            actor_timeout_secs: default_actor_timeout_secs(),
            log: LogConfig::default(),
            reboot: RebootConfig::default(),
            actor_config: ConfigBag::default(),
            answers: BTreeMap::new(),
        }
    }
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/uplift")
}

fn default_manifest() -> PathBuf {
    PathBuf::from("/etc/uplift/workflow.toml")
}

fn default_actor_timeout_secs() -> u64 {
    30 * 60
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    /// Returns error if file cannot be read or parsed
    pub fn load(path: &Path) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| eyre::eyre!("failed to read config {}: {e}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| eyre::eyre!("failed to parse config {}: {e}", path.display()))?;
        Ok(config)
    }

    /// Load from default paths or use defaults
    ///
    /// # Errors
    /// Returns error if a config file exists but cannot be loaded
    pub fn load_default() -> eyre::Result<Self> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Self::load(Path::new(&path));
        }

        let mut paths = vec![
            PathBuf::from("uplift.toml"),
            PathBuf::from("/etc/uplift/uplift.toml"),
        ];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("uplift/uplift.toml"));
        }

        for path in paths {
            if path.exists() {
                return Self::load(&path);
            }
        }

        // Tracing is not set up yet at this point
        eprintln!("no config file found, using defaults");
        Ok(Config::default())
    }

    /// Scheduler settings
    #[must_use]
    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            actor_timeout: Duration::from_secs(self.actor_timeout_secs),
        }
    }

    /// Actor configuration with `UPLIFT_*` environment overrides applied
    pub fn config_bag(&self, vars: impl IntoIterator<Item = (String, String)>) -> ConfigBag {
        let mut bag = self.actor_config.clone();
        bag.merge(ConfigBag::from_vars(
            ACTOR_ENV_PREFIX,
            vars.into_iter().filter(|(key, _)| key != CONFIG_ENV),
        ));
        bag
    }
}

#[cfg(test)]
mod tests {
    use uplift_core::ConfigValue;

    use super::*;

    #[test]
    fn test_parse_full_config() {
        let config: Config = toml::from_str(
            r#"
            state_dir = "/tmp/uplift"
            manifest = "demos/workflow.toml"
            actor_timeout_secs = 60

            [log]
            level = "debug"
            json = true

            [reboot]
            command = "systemctl reboot"

            [actor_config]
            skip_rhsm = true
            target = "9.4"

            [answers]
            remove_pam_pkcs11 = true
            "#,
        )
        .unwrap();

        assert_eq!(config.state_dir, PathBuf::from("/tmp/uplift"));
        assert_eq!(config.scheduler().actor_timeout, Duration::from_secs(60));
        assert!(config.log.json);
        assert_eq!(config.reboot.command.as_deref(), Some("systemctl reboot"));
        assert!(config.actor_config.flag("skip_rhsm"));
        assert_eq!(config.answers["remove_pam_pkcs11"], Value::Bool(true));
    }

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str("").unwrap();

        assert_eq!(config.actor_timeout_secs, 1800);
        assert_eq!(config.log.level, "info");
        assert!(config.reboot.command.is_none());
        assert!(config.actor_config.is_empty());
    }

    #[test]
    fn test_env_overrides_actor_config() {
        let config: Config = toml::from_str(
            r#"
            [actor_config]
            target = "9.2"
            "#,
        )
        .unwrap();

        let bag = config.config_bag([
            ("UPLIFT_TARGET".to_string(), "9.4".to_string()),
            ("UPLIFT_CONFIG".to_string(), "/etc/uplift.toml".to_string()),
            ("PATH".to_string(), "/usr/bin".to_string()),
        ]);

        assert_eq!(bag.get("target"), Some(&ConfigValue::String("9.4".into())));
        assert!(bag.get("config").is_none());
        assert_eq!(bag.len(), 1);
    }
}
