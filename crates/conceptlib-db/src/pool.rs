//! Connection pool setup.
//!
//! Settings come from the environment:
//!
//! | Variable | Default |
//! |---|---|
//! | `DATABASE_URL` | [`defaults::DATABASE_URL`] |
//! | `CONCEPTLIB_DB_MAX_CONNECTIONS` | 10 |
//! | `CONCEPTLIB_DB_MIN_CONNECTIONS` | 1 |
//! | `CONCEPTLIB_DB_ACQUIRE_TIMEOUT_SECS` | 30 |
//! | `CONCEPTLIB_DB_STATEMENT_TIMEOUT_MS` | unset (server default) |

use std::env;
use std::str::FromStr;
use std::time::{Duration, Instant};

use serde::Serialize;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Executor;
use tracing::{info, warn};

use conceptlib_core::{defaults, Error, Result};

pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_MIN_CONNECTIONS: u32 = 1;
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;

const MAX_CONNECTION_LIFETIME: Duration = Duration::from_secs(1800);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    /// Per-connection `statement_timeout`. Bounds runaway graph walks.
    pub statement_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            min_connections: DEFAULT_MIN_CONNECTIONS,
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
            statement_timeout: None,
        }
    }
}

fn env_number<T: FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{} must be a number, got: {}", name, raw))),
        Err(_) => Ok(None),
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overlay `CONCEPTLIB_DB_*` variables on the defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(n) = env_number("CONCEPTLIB_DB_MAX_CONNECTIONS")? {
            config.max_connections = n;
        }
        if let Some(n) = env_number("CONCEPTLIB_DB_MIN_CONNECTIONS")? {
            config.min_connections = n;
        }
        if let Some(secs) = env_number("CONCEPTLIB_DB_ACQUIRE_TIMEOUT_SECS")? {
            config.acquire_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = env_number("CONCEPTLIB_DB_STATEMENT_TIMEOUT_MS")? {
            config.statement_timeout = Some(Duration::from_millis(ms));
        }
        config.validate()?;
        Ok(config)
    }

    pub fn max_connections(mut self, n: u32) -> Self {
        self.max_connections = n;
        self
    }

    pub fn min_connections(mut self, n: u32) -> Self {
        self.min_connections = n;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = Some(timeout);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(Error::Config("pool needs at least one connection".to_string()));
        }
        if self.min_connections > self.max_connections {
            return Err(Error::Config(format!(
                "minimum pool size {} exceeds maximum {}",
                self.min_connections, self.max_connections
            )));
        }
        Ok(())
    }
}

/// `DATABASE_URL`, or the local default.
pub fn database_url() -> String {
    env::var("DATABASE_URL").unwrap_or_else(|_| defaults::DATABASE_URL.to_string())
}

pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    create_pool_with_config(database_url, PoolConfig::default()).await
}

pub async fn create_pool_with_config(database_url: &str, config: PoolConfig) -> Result<PgPool> {
    config.validate()?;
    let start = Instant::now();

    info!(
        subsystem = "db",
        component = "pool",
        op = "create",
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        statement_timeout_ms = config.statement_timeout.map(|t| t.as_millis() as u64),
        "Opening connection pool"
    );

    let statement_timeout = config.statement_timeout;
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout)
        .max_lifetime(MAX_CONNECTION_LIFETIME)
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                if let Some(timeout) = statement_timeout {
                    conn.execute(format!("SET statement_timeout = {}", timeout.as_millis()).as_str())
                        .await?;
                }
                Ok(())
            })
        })
        .connect(database_url)
        .await
        .map_err(Error::Database)?;

    info!(
        subsystem = "db",
        component = "pool",
        op = "established",
        duration_ms = start.elapsed().as_millis() as u64,
        "Connection pool ready"
    );
    Ok(pool)
}

/// Point-in-time view of pool usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub size: u32,
    pub idle: u32,
}

impl PoolStatus {
    pub fn of(pool: &PgPool) -> Self {
        Self {
            size: pool.size(),
            idle: pool.num_idle() as u32,
        }
    }

    /// Every open connection is checked out.
    pub fn is_saturated(&self) -> bool {
        self.size > 0 && self.idle == 0
    }

    pub fn log(&self) {
        if self.is_saturated() {
            warn!(subsystem = "db", component = "pool", pool_size = self.size, "No idle connections");
        } else {
            info!(
                subsystem = "db",
                component = "pool",
                pool_size = self.size,
                pool_idle = self.idle,
                "Pool status"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_overrides_defaults() {
        let config = PoolConfig::new()
            .max_connections(4)
            .min_connections(2)
            .statement_timeout(Duration::from_millis(2500));

        assert_eq!(config.max_connections, 4);
        assert_eq!(config.min_connections, 2);
        assert_eq!(config.acquire_timeout, Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS));
        assert_eq!(config.statement_timeout, Some(Duration::from_millis(2500)));
    }

    #[test]
    fn test_min_above_max_is_rejected() {
        let config = PoolConfig::new().max_connections(2).min_connections(3);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
        assert!(PoolConfig::new().max_connections(0).validate().is_err());
        assert!(PoolConfig::default().validate().is_ok());
    }

    #[test]
    fn test_saturation() {
        assert!(PoolStatus { size: 3, idle: 0 }.is_saturated());
        assert!(!PoolStatus { size: 3, idle: 1 }.is_saturated());
        assert!(!PoolStatus { size: 0, idle: 0 }.is_saturated());
    }
}
