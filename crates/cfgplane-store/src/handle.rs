//! Database connection configuration
//!
//! Resolves PostgreSQL connection settings from the environment and builds
//! the `deadpool-postgres` pool every `PgShard` runs on.

use std::time::Duration;

use deadpool_postgres::{Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use tokio_postgres::NoTls;
use tracing::{info, instrument};

use crate::error::StorageError;
use crate::storage_traits::StorageResult;

/// Connection pool configuration for one shard.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Full connection string; overrides the discrete fields when set
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: String,
    /// Maximum pool size
    pub max_size: usize,
    /// How long to wait for a pooled connection
    pub timeout: Duration,
    /// Server-side `lock_timeout` applied to every session
    pub lock_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "localhost".to_string(),
            port: 5432,
            dbname: "cfgplane".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
            max_size: 16,
            timeout: Duration::from_secs(30),
            lock_timeout: Duration::from_secs(10),
        }
    }
}

impl DbConfig {
    /// Read configuration from environment variables
    ///
    /// Reads:
    /// - CFGPLANE_DB_URL (optional, overrides the fields below)
    /// - CFGPLANE_DB_HOST (default: "localhost")
    /// - CFGPLANE_DB_PORT (default: 5432)
    /// - CFGPLANE_DB_NAME (default: "cfgplane")
    /// - CFGPLANE_DB_USER (default: "postgres")
    /// - CFGPLANE_DB_PASSWORD (default: empty)
    /// - CFGPLANE_DB_POOL_SIZE (default: 16)
    /// - CFGPLANE_DB_TIMEOUT seconds (default: 30)
    /// - CFGPLANE_DB_LOCK_TIMEOUT seconds (default: 10)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url: std::env::var("CFGPLANE_DB_URL").ok(),
            host: std::env::var("CFGPLANE_DB_HOST").unwrap_or(defaults.host),
            port: env_parse("CFGPLANE_DB_PORT").unwrap_or(defaults.port),
            dbname: std::env::var("CFGPLANE_DB_NAME").unwrap_or(defaults.dbname),
            user: std::env::var("CFGPLANE_DB_USER").unwrap_or(defaults.user),
            password: std::env::var("CFGPLANE_DB_PASSWORD").unwrap_or_default(),
            max_size: env_parse("CFGPLANE_DB_POOL_SIZE").unwrap_or(defaults.max_size),
            timeout: env_parse("CFGPLANE_DB_TIMEOUT")
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            lock_timeout: env_parse("CFGPLANE_DB_LOCK_TIMEOUT")
                .map(Duration::from_secs)
                .unwrap_or(defaults.lock_timeout),
        }
    }

    /// Configuration pointing at a full connection string.
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    /// Create a connection pool from this configuration.
    #[instrument(skip(self), fields(host = %self.host, dbname = %self.dbname))]
    pub fn create_pool(&self) -> StorageResult<Pool> {
        let mut cfg = Config::new();
        match &self.url {
            Some(url) => cfg.url = Some(url.clone()),
            None => {
                cfg.host = Some(self.host.clone());
                cfg.port = Some(self.port);
                cfg.dbname = Some(self.dbname.clone());
                cfg.user = Some(self.user.clone());
                cfg.password = Some(self.password.clone());
            }
        }
        cfg.options = Some(format!(
            "-c lock_timeout={}",
            self.lock_timeout.as_millis()
        ));
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        let mut pool_cfg = PoolConfig::new(self.max_size);
        pool_cfg.timeouts.wait = Some(self.timeout);
        cfg.pool = Some(pool_cfg);

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| StorageError::Connection(format!("failed to create pool: {}", e)))?;
        info!(max_size = self.max_size, "postgres pool created");
        Ok(pool)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}
