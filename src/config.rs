use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Engine configuration. Every field has a default so an empty source set
/// yields a usable config.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub store: StoreConfig,
    pub settlement: SettlementConfig,
    pub outbox: OutboxConfig,
    pub offers: OfferConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory of the sled database
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/settlement.db"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    /// Deadline for a single transactional operation, storage retries included
    pub transaction_timeout_ms: u64,
    /// Retries after a storage-layer failure before surfacing it
    pub max_storage_retries: u32,
    pub retry_backoff_ms: u64,
}

impl SettlementConfig {
    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            transaction_timeout_ms: 2_000,
            max_storage_retries: 3,
            retry_backoff_ms: 25,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    pub poll_interval_ms: u64,
    pub batch_size: usize,
    /// Delivery attempts before an effect is moved to the dead letter keyspace
    pub max_attempts: u32,
}

impl OutboxConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 250,
            batch_size: 64,
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OfferConfig {
    pub max_message_len: usize,
}

impl Default for OfferConfig {
    fn default() -> Self {
        Self {
            max_message_len: 1_000,
        }
    }
}

impl EngineConfig {
    /// Load from `SETTLEMENT_*` environment variables only.
    pub fn load() -> Result<Self, ConfigError> {
        Self::builder(None).build()?.try_deserialize()
    }

    /// Load from an optional TOML file, then environment overrides
    /// (`SETTLEMENT_SETTLEMENT__TRANSACTION_TIMEOUT_MS=500`, etc.)
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::builder(Some(path.as_ref())).build()?.try_deserialize()
    }

    fn builder(path: Option<&Path>) -> config::builder::ConfigBuilder<config::builder::DefaultState> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path.to_path_buf()).required(false));
        }
        builder.add_source(
            Environment::with_prefix("SETTLEMENT")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = EngineConfig::load_from("does/not/exist.toml").unwrap();
        assert_eq!(config.settlement.max_storage_retries, 3);
        assert_eq!(config.outbox.max_attempts, 5);
        assert_eq!(config.offers.max_message_len, 1_000);
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settlement.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[settlement]\ntransaction_timeout_ms = 750\n\n[outbox]\nbatch_size = 8"
        )
        .unwrap();

        let config = EngineConfig::load_from(&path).unwrap();
        assert_eq!(config.settlement.transaction_timeout(), Duration::from_millis(750));
        assert_eq!(config.outbox.batch_size, 8);
        // untouched sections keep their defaults
        assert_eq!(config.settlement.retry_backoff_ms, 25);
    }

    #[test]
    fn environment_overrides_nested_keys() {
        // no other test reads poll_interval_ms, so the variable cannot leak
        unsafe { std::env::set_var("SETTLEMENT_OUTBOX__POLL_INTERVAL_MS", "40") };
        let config = EngineConfig::load();
        unsafe { std::env::remove_var("SETTLEMENT_OUTBOX__POLL_INTERVAL_MS") };

        let config = config.unwrap();
        assert_eq!(config.outbox.poll_interval(), Duration::from_millis(40));
        assert_eq!(config.outbox.batch_size, 64);
    }
}
