//! Service configuration.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use metric_ledger_core::config::{
    DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_BACKOFF_MS, DEFAULT_RETRY_BACKOFF_MS,
};
use metric_ledger_core::{IsolationMode, LedgerConfig};
use metric_ledger_store::{LedgerStore, MemoryStore, PgStore};

use crate::error::{Result, ServiceError};

/// Which storage backend to run against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StoreBackend {
    /// Process memory; nothing survives the run.
    #[default]
    Memory,
    /// `RocksDB` under `data_dir`.
    Rocksdb,
    /// `PostgreSQL` at `database_url`.
    Postgres,
}

impl FromStr for StoreBackend {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "rocksdb" | "rocks" => Ok(Self::Rocksdb),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            other => Err(ServiceError::Configuration(format!(
                "unknown store backend: {other}"
            ))),
        }
    }
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Memory => "memory",
            Self::Rocksdb => "rocksdb",
            Self::Postgres => "postgres",
        })
    }
}

/// Service configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Storage backend (default: memory).
    pub backend: StoreBackend,

    /// Path to `RocksDB` data directory (default: "./data/metric-ledger").
    pub data_dir: String,

    /// `PostgreSQL` connection URL.
    pub database_url: Option<String>,

    /// `PostgreSQL` schema (default: "public").
    pub db_schema: String,

    /// Ledger update settings.
    pub ledger: LedgerConfig,
}

impl ServiceConfig {
    /// Load configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, falling back to defaults for
    /// missing or unparsable values.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let millis = |key: &str, default: u64| {
            Duration::from_millis(
                lookup(key)
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(default),
            )
        };

        let backend = lookup("STORE_BACKEND")
            .map(|s| {
                s.parse().unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "Falling back to the memory backend");
                    StoreBackend::Memory
                })
            })
            .unwrap_or_default();

        let isolation_mode = lookup("LEDGER_ISOLATION_MODE")
            .map(|s| {
                s.parse().unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "Falling back to optimistic isolation");
                    IsolationMode::Optimistic
                })
            })
            .unwrap_or_default();

        let artificial_delay = lookup("LEDGER_ARTIFICIAL_DELAY_MS")
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis);

        let mut ledger = LedgerConfig::default()
            .with_isolation_mode(isolation_mode)
            .with_max_attempts(
                lookup("LEDGER_MAX_ATTEMPTS")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_MAX_ATTEMPTS),
            )
            .with_retry_backoff(millis("LEDGER_RETRY_BACKOFF_MS", DEFAULT_RETRY_BACKOFF_MS))
            .with_max_backoff(millis("LEDGER_MAX_BACKOFF_MS", DEFAULT_MAX_BACKOFF_MS))
            .with_artificial_delay(artificial_delay);

        if let Err(e) = ledger.validate() {
            tracing::warn!(error = %e, "Lowering retry backoff to the backoff cap");
            let cap = ledger.max_backoff;
            ledger = ledger.with_retry_backoff(cap);
        }

        Self {
            backend,
            data_dir: lookup("DATA_DIR").unwrap_or_else(|| "./data/metric-ledger".into()),
            database_url: lookup("DATABASE_URL"),
            db_schema: lookup("DB_SCHEMA").unwrap_or_else(|| "public".into()),
            ledger,
        }
    }

    /// Open the configured backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend is not compiled in, required settings
    /// are missing, or the store cannot be opened.
    pub async fn open_store(&self) -> Result<Arc<dyn LedgerStore>> {
        match self.backend {
            StoreBackend::Memory => {
                tracing::info!("Using in-memory store");
                Ok(Arc::new(MemoryStore::new()))
            }
            StoreBackend::Rocksdb => self.open_rocksdb(),
            StoreBackend::Postgres => {
                let url = self.database_url.as_deref().ok_or_else(|| {
                    ServiceError::Configuration("DATABASE_URL is required for postgres".into())
                })?;
                tracing::info!(schema = %self.db_schema, "Connecting to PostgreSQL");
                let store = PgStore::connect(url, &self.db_schema).await?;
                store.migrate().await?;
                Ok(Arc::new(store))
            }
        }
    }

    #[cfg(feature = "rocksdb-backend")]
    fn open_rocksdb(&self) -> Result<Arc<dyn LedgerStore>> {
        tracing::info!(path = %self.data_dir, "Opening RocksDB store");
        let store = metric_ledger_store::RocksStore::open(&self.data_dir)?;
        Ok(Arc::new(store))
    }

    #[cfg(not(feature = "rocksdb-backend"))]
    #[allow(clippy::unused_self)]
    fn open_rocksdb(&self) -> Result<Arc<dyn LedgerStore>> {
        Err(ServiceError::Configuration(
            "built without the rocksdb-backend feature".into(),
        ))
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            data_dir: "./data/metric-ledger".into(),
            database_url: None,
            db_schema: "public".into(),
            ledger: LedgerConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = ServiceConfig::from_lookup(|_| None);
        assert_eq!(config.backend, StoreBackend::Memory);
        assert_eq!(config.db_schema, "public");
        assert_eq!(config.ledger, LedgerConfig::default());
    }

    #[test]
    fn reads_ledger_settings() {
        let config = ServiceConfig::from_lookup(lookup(&[
            ("STORE_BACKEND", "postgres"),
            ("DATABASE_URL", "postgres://localhost/ledger"),
            ("DB_SCHEMA", "ledger"),
            ("LEDGER_ISOLATION_MODE", "unchecked"),
            ("LEDGER_MAX_ATTEMPTS", "3"),
            ("LEDGER_RETRY_BACKOFF_MS", "20"),
            ("LEDGER_ARTIFICIAL_DELAY_MS", "100"),
        ]));

        assert_eq!(config.backend, StoreBackend::Postgres);
        assert_eq!(config.db_schema, "ledger");
        assert_eq!(config.ledger.isolation_mode, IsolationMode::Unchecked);
        assert_eq!(config.ledger.max_attempts, 3);
        assert_eq!(config.ledger.retry_backoff, Duration::from_millis(20));
        assert_eq!(config.ledger.artificial_delay, Some(Duration::from_millis(100)));
    }

    #[test]
    fn unparsable_values_fall_back() {
        let config = ServiceConfig::from_lookup(lookup(&[
            ("STORE_BACKEND", "cassandra"),
            ("LEDGER_ISOLATION_MODE", "snapshot"),
            ("LEDGER_MAX_ATTEMPTS", "many"),
        ]));
        assert_eq!(config.backend, StoreBackend::Memory);
        assert_eq!(config.ledger.isolation_mode, IsolationMode::Optimistic);
        assert_eq!(config.ledger.max_attempts, DEFAULT_MAX_ATTEMPTS);
    }

    #[test]
    fn inverted_backoff_is_lowered_to_the_cap() {
        let config = ServiceConfig::from_lookup(lookup(&[
            ("LEDGER_RETRY_BACKOFF_MS", "200"),
            ("LEDGER_MAX_BACKOFF_MS", "10"),
        ]));
        assert_eq!(config.ledger.retry_backoff, Duration::from_millis(10));
        assert_eq!(config.ledger.max_backoff, Duration::from_millis(10));
        assert!(config.ledger.validate().is_ok());
    }

    #[tokio::test]
    async fn postgres_without_url_is_a_configuration_error() {
        let config = ServiceConfig {
            backend: StoreBackend::Postgres,
            ..ServiceConfig::default()
        };
        let result = config.open_store().await;
        assert!(matches!(result, Err(ServiceError::Configuration(_))));
    }
}
