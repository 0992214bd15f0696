//! Configuration management with file persistence

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::locking::LockStrategy;
use crate::storage::DatabaseConfig;

/// Environment variables consulted for the database URL, in order
const DATABASE_URL_VARS: [&str; 2] = ["ROWSYNC_DATABASE_URL", "DATABASE_URL"];

/// Every key accepted by [`Config::get`] and [`Config::set`]
const KEYS: [&str; 10] = [
    "database.url",
    "database.max_connections",
    "database.acquire_timeout_secs",
    "database.auto_migrate",
    "barrier.probe_timeout_ms",
    "barrier.poll_interval_ms",
    "barrier.max_attempts",
    "barrier.failure_threshold",
    "barrier.max_rounds",
    "lock.strategy",
];

/// rowsync configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub barrier: BarrierConfig,
    pub lock: LockSettings,
}

/// Timing and bounds of the barrier protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BarrierConfig {
    /// Wait bound for claiming the master slot and for liveness probes
    pub probe_timeout_ms: u64,
    /// Sleep between election attempts
    pub poll_interval_ms: u64,
    /// Election attempts before the master gives up
    pub max_attempts: u32,
    /// A candidate found busy more often than this is no longer probed
    pub failure_threshold: u32,
    /// Retries with a fresh identity before giving up; unbounded when unset
    pub max_rounds: Option<u32>,
}

impl Default for BarrierConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: 1_000,
            poll_interval_ms: 6_000,
            max_attempts: 10,
            failure_threshold: 3,
            max_rounds: None,
        }
    }
}

impl BarrierConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.probe_timeout_ms == 0 {
            return Err(anyhow!("barrier.probe_timeout_ms must be greater than 0"));
        }
        if self.poll_interval_ms == 0 {
            return Err(anyhow!("barrier.poll_interval_ms must be greater than 0"));
        }
        if self.max_attempts == 0 {
            return Err(anyhow!("barrier.max_attempts must be at least 1"));
        }
        if self.max_rounds == Some(0) {
            return Err(anyhow!("barrier.max_rounds must be at least 1 when set"));
        }
        Ok(())
    }
}

/// Named lock settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    pub strategy: LockStrategy,
}

/// Hide the password component of a connection URL
pub fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let Some((credentials, host)) = rest.rsplit_once('@') else {
        return url.to_string();
    };
    match credentials.split_once(':') {
        Some((user, _)) => format!("{}://{}:****@{}", scheme, user, host),
        None => url.to_string(),
    }
}

impl Config {
    /// Get the configuration directory
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("ROWSYNC_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("rowsync")
        };

        Ok(dir)
    }

    /// Get the configuration file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from file, or defaults if it doesn't exist
    ///
    /// The database URL environment variables take precedence over the file.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_overrides(|name| env::var(name).ok());
        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
            config.validate()?;
            Ok(config)
        } else {
            // Return default config without creating file
            Ok(Config::default())
        }
    }

    /// Save configuration to the default location
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path()?)
    }

    /// Save configuration to a specific file
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        self.validate()?;

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Replace settings that have an environment override
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = DATABASE_URL_VARS
            .iter()
            .find_map(|name| lookup(name).filter(|value| !value.is_empty()))
        {
            self.database.url = url;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database.url.is_empty() {
            return Err(anyhow!("database.url must not be empty"));
        }
        if self.database.max_connections == 0 {
            return Err(anyhow!("database.max_connections must be at least 1"));
        }
        self.barrier.validate()
    }

    /// All configuration keys
    pub fn keys() -> &'static [&'static str] {
        &KEYS
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        match key {
            // Database settings
            "database.url" => Ok(redact_url(&self.database.url)),
            "database.max_connections" => Ok(self.database.max_connections.to_string()),
            "database.acquire_timeout_secs" => Ok(self.database.acquire_timeout_secs.to_string()),
            "database.auto_migrate" => Ok(self.database.auto_migrate.to_string()),

            // Barrier settings
            "barrier.probe_timeout_ms" => Ok(self.barrier.probe_timeout_ms.to_string()),
            "barrier.poll_interval_ms" => Ok(self.barrier.poll_interval_ms.to_string()),
            "barrier.max_attempts" => Ok(self.barrier.max_attempts.to_string()),
            "barrier.failure_threshold" => Ok(self.barrier.failure_threshold.to_string()),
            "barrier.max_rounds" => Ok(self
                .barrier
                .max_rounds
                .map(|rounds| rounds.to_string())
                .unwrap_or_else(|| "none".to_string())),

            // Lock settings
            "lock.strategy" => Ok(self.lock.strategy.to_string()),

            _ => Err(anyhow!(
                "Unknown configuration key: {}. Use `rowsync config list` to see available keys.",
                key
            )),
        }
    }

    /// Set a configuration value by key
    ///
    /// Leaves the configuration untouched when the result would not validate.
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut next = self.clone();
        next.assign(key, value)?;
        next.validate()?;
        *self = next;
        Ok(())
    }

    fn assign(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            // Database settings
            "database.url" => {
                self.database.url = value.to_string();
            }
            "database.max_connections" => {
                self.database.max_connections = value
                    .parse()
                    .with_context(|| format!("Invalid max_connections value: {}", value))?;
            }
            "database.acquire_timeout_secs" => {
                self.database.acquire_timeout_secs = value
                    .parse()
                    .with_context(|| format!("Invalid acquire_timeout_secs value: {}", value))?;
            }
            "database.auto_migrate" => {
                self.database.auto_migrate = value
                    .parse()
                    .with_context(|| format!("Invalid auto_migrate value: {}", value))?;
            }

            // Barrier settings
            "barrier.probe_timeout_ms" => {
                self.barrier.probe_timeout_ms = value
                    .parse()
                    .with_context(|| format!("Invalid probe_timeout_ms value: {}", value))?;
            }
            "barrier.poll_interval_ms" => {
                self.barrier.poll_interval_ms = value
                    .parse()
                    .with_context(|| format!("Invalid poll_interval_ms value: {}", value))?;
            }
            "barrier.max_attempts" => {
                self.barrier.max_attempts = value
                    .parse()
                    .with_context(|| format!("Invalid max_attempts value: {}", value))?;
            }
            "barrier.failure_threshold" => {
                self.barrier.failure_threshold = value
                    .parse()
                    .with_context(|| format!("Invalid failure_threshold value: {}", value))?;
            }
            "barrier.max_rounds" => {
                self.barrier.max_rounds = match value {
                    "" | "none" => None,
                    rounds => Some(
                        rounds
                            .parse()
                            .with_context(|| format!("Invalid max_rounds value: {}", value))?,
                    ),
                };
            }

            // Lock settings
            "lock.strategy" => {
                self.lock.strategy = value.parse().map_err(|err| anyhow!("{}", err))?;
            }

            _ => {
                return Err(anyhow!(
                    "Unknown configuration key: {}. Use `rowsync config list` to see available keys.",
                    key
                ));
            }
        }
        Ok(())
    }

    /// List all configuration keys and their values
    pub fn list(&self) -> anyhow::Result<Vec<(String, String)>> {
        Self::keys()
            .iter()
            .map(|key| {
                let value = self.get(key)?;
                Ok((key.to_string(), value))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol_constants() {
        let config = Config::default();
        assert_eq!(config.barrier.probe_timeout(), Duration::from_secs(1));
        assert_eq!(config.barrier.poll_interval(), Duration::from_secs(6));
        assert_eq!(config.barrier.max_attempts, 10);
        assert_eq!(config.barrier.failure_threshold, 3);
        assert_eq!(config.barrier.max_rounds, None);
        assert_eq!(config.lock.strategy, LockStrategy::Row);
        config.validate().unwrap();
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.set("barrier.max_rounds", "5").unwrap();
        config.set("lock.strategy", "advisory").unwrap();
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.barrier.max_rounds, Some(5));
    }

    #[test]
    fn test_missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = Config::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(loaded, Config::default());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[barrier]\npoll_interval_ms = 250\n").unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.barrier.poll_interval_ms, 250);
        assert_eq!(loaded.barrier.max_attempts, 10);
        assert_eq!(loaded.database, DatabaseConfig::default());
    }

    #[test]
    fn test_set_rejects_invalid_values() {
        let mut config = Config::default();
        assert!(config.set("barrier.max_attempts", "0").is_err());
        assert!(config.set("barrier.max_rounds", "zero").is_err());
        assert!(config.set("lock.strategy", "flock").is_err());
        assert!(config.set("nope", "1").is_err());

        assert_eq!(config, Config::default());

        config.set("barrier.max_rounds", "none").unwrap();
        assert_eq!(config.get("barrier.max_rounds").unwrap(), "none");
    }

    #[test]
    fn test_env_override_prefers_rowsync_variable() {
        let mut config = Config::default();
        config.apply_overrides(|name| match name {
            "ROWSYNC_DATABASE_URL" => Some("postgres://a/one".to_string()),
            "DATABASE_URL" => Some("postgres://b/two".to_string()),
            _ => None,
        });
        assert_eq!(config.database.url, "postgres://a/one");

        config.apply_overrides(|name| match name {
            "DATABASE_URL" => Some("postgres://b/two".to_string()),
            _ => None,
        });
        assert_eq!(config.database.url, "postgres://b/two");
    }

    #[test]
    fn test_url_password_is_redacted() {
        let mut config = Config::default();
        config.set("database.url", "postgres://app:s3cret@db:5432/rowsync").unwrap();
        assert_eq!(
            config.get("database.url").unwrap(),
            "postgres://app:****@db:5432/rowsync"
        );
        assert_eq!(redact_url("postgres://localhost/rowsync"), "postgres://localhost/rowsync");
    }

    #[test]
    fn test_list_covers_every_key() {
        let listed = Config::default().list().unwrap();
        assert_eq!(listed.len(), Config::keys().len());
    }
}
