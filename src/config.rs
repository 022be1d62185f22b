//! Configuration loading from TOML files and environment variables.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Idle policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Default idle timeout in seconds, used when a page requests idle
    /// handling without a custom timeout.
    #[serde(default = "default_timeout_seconds")]
    pub default_timeout_seconds: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            default_timeout_seconds: default_timeout_seconds(),
        }
    }
}

impl PolicyConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_seconds)
    }
}

/// Message bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Undelivered messages retained per subscriber before the oldest are dropped.
    #[serde(default = "default_bus_capacity")]
    pub capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            capacity: default_bus_capacity(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Data directory for the close-event journal.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            level: default_log_level(),
        }
    }
}

impl LoggingConfig {
    /// Returns the journal directory path.
    pub fn journal_dir(&self) -> PathBuf {
        self.data_dir.join("journal")
    }
}

// Default value functions
fn default_timeout_seconds() -> u64 {
    30
}

fn default_bus_capacity() -> usize {
    64
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".idlekeeper"))
        .unwrap_or_else(|| PathBuf::from(".idlekeeper"))
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| "Failed to parse config file")?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = config_path {
            Self::from_file(path)?
        } else {
            // Try default config locations
            let default_paths = [
                PathBuf::from("config/default.toml"),
                dirs::config_dir()
                    .map(|d| d.join("idlekeeper/config.toml"))
                    .unwrap_or_default(),
            ];

            let mut loaded = None;
            for path in &default_paths {
                if path.exists() {
                    loaded = Some(Self::from_file(path)?);
                    break;
                }
            }
            loaded.unwrap_or_default()
        };

        // Apply environment variable overrides
        config.apply_env_overrides();

        // Expand home directory in data_dir
        config.logging.data_dir = expand_tilde(&config.logging.data_dir);

        Ok(config)
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("IDLEKEEPER_DEFAULT_TIMEOUT") {
            if let Ok(v) = val.parse() {
                self.policy.default_timeout_seconds = v;
            }
        }
        if let Ok(val) = std::env::var("IDLEKEEPER_BUS_CAPACITY") {
            if let Ok(v) = val.parse() {
                self.bus.capacity = v;
            }
        }
        if let Ok(val) = std::env::var("IDLEKEEPER_DATA_DIR") {
            self.logging.data_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("IDLEKEEPER_LOG_LEVEL") {
            self.logging.level = val;
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.policy.default_timeout_seconds == 0 {
            anyhow::bail!("Default idle timeout must be greater than 0");
        }
        if self.bus.capacity == 0 {
            anyhow::bail!("Bus capacity must be greater than 0");
        }
        Ok(())
    }
}

/// Expand ~ to home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    if let Some(path_str) = path.to_str() {
        if path_str.starts_with("~") {
            if let Some(home) = dirs::home_dir() {
                return home.join(&path_str[2..]);
            }
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sensible() {
        let config = Config::default();
        assert_eq!(config.policy.default_timeout_seconds, 30);
        assert_eq!(config.policy.default_timeout(), Duration::from_secs(30));
        assert_eq!(config.bus.capacity, 64);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn from_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[policy]\ndefault_timeout_seconds = 45\n\n[logging]\nlevel = \"debug\""
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.policy.default_timeout_seconds, 45);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.bus.capacity, 64);
    }

    #[test]
    fn validate_rejects_zero_timeout() {
        let mut config = Config::default();
        config.policy.default_timeout_seconds = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.bus.capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn journal_dir_nests_under_data_dir() {
        let config = LoggingConfig {
            data_dir: PathBuf::from("/tmp/ik"),
            level: "info".into(),
        };
        assert_eq!(config.journal_dir(), PathBuf::from("/tmp/ik/journal"));
    }
}
