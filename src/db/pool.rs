//! Named MySQL connection pools.
//!
//! A [`PoolRegistry`] is built once at startup from a list of
//! [`PoolConfig`]s and handed to every builder as an `Arc`. It is read-only
//! after construction, so lookups need no locking; connection checkout and
//! release are sqlx's business.

use crate::config::{DEFAULT_IDLE_TIMEOUT_SECS, PoolConfig, validate_pool_configs};
use crate::error::{DbError, DbResult};
use crate::query::Query;
use serde::Serialize;
use sqlx::MySqlPool;
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Instrument, Span, debug, info, info_span, warn};

/// Pool information for listings (no secrets exposed).
#[derive(Debug, Clone, Serialize)]
pub struct PoolSummary {
    pub name: String,
    pub master: bool,
    /// Connection target with the password masked.
    pub target: String,
    pub prefix: String,
    /// Open connections, idle or in use.
    pub size: u32,
    pub idle: usize,
}

/// One configured database target.
#[derive(Debug)]
pub struct Pool {
    config: PoolConfig,
    pool: MySqlPool,
    /// Every statement on this pool runs inside this span.
    span: Span,
}

impl Pool {
    /// Create the pool and open its first connection.
    pub async fn connect(config: PoolConfig) -> DbResult<Self> {
        config.validate().map_err(DbError::configuration)?;
        let span = info_span!("pool", pool = %config.name);

        info!(
            parent: &span,
            url = %config.masked_target(),
            max_connections = config.connection_limit,
            "Connecting pool"
        );

        let connect_timeout = config.connect_timeout_duration();
        let connecting = Self::pool_options(&config).connect_with(Self::connect_options(&config));
        let pool = match tokio::time::timeout(connect_timeout, connecting).await {
            Ok(Ok(pool)) => pool,
            Ok(Err(e)) => {
                return Err(DbError::connection(
                    format!("Failed to connect pool '{}': {}", config.name, e),
                    connection_suggestion(&e),
                ));
            }
            Err(_) => {
                return Err(DbError::timeout(
                    format!("connecting pool '{}'", config.name),
                    connect_timeout.as_secs() as u32,
                ));
            }
        };

        let this = Self { config, pool, span };
        let version = this.server_version().await;
        info!(parent: &this.span, server_version = ?version, "Pool connected");
        Ok(this)
    }

    /// Create the pool without opening any connection; the first statement
    /// connects.
    pub fn connect_lazy(config: PoolConfig) -> DbResult<Self> {
        config.validate().map_err(DbError::configuration)?;
        let span = info_span!("pool", pool = %config.name);
        let pool = Self::pool_options(&config).connect_lazy_with(Self::connect_options(&config));
        debug!(parent: &span, url = %config.masked_target(), "Created lazy pool");
        Ok(Self { config, pool, span })
    }

    fn connect_options(config: &PoolConfig) -> MySqlConnectOptions {
        let mut options = MySqlConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .charset(&config.charset);
        if !config.password.is_empty() {
            options = options.password(&config.password);
        }
        if let Some(database) = &config.database {
            options = options.database(database);
        }
        options
    }

    fn pool_options(config: &PoolConfig) -> MySqlPoolOptions {
        MySqlPoolOptions::new()
            .min_connections(0)
            .max_connections(config.connection_limit)
            .acquire_timeout(config.acquire_timeout_duration())
            .idle_timeout(Some(Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS)))
            .test_before_acquire(true)
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Table-name prefix of this pool.
    pub fn prefix(&self) -> &str {
        &self.config.prefix
    }

    pub fn is_master(&self) -> bool {
        self.config.master
    }

    pub fn inner(&self) -> &MySqlPool {
        &self.pool
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Get the server version, `None` when the server cannot be reached.
    pub async fn server_version(&self) -> Option<String> {
        let fetch = sqlx::query_scalar::<_, String>("SELECT version()").fetch_one(&self.pool);
        match fetch.instrument(self.span.clone()).await {
            Ok(version) => {
                debug!(parent: &self.span, version = %version, "Got server version");
                Some(version)
            }
            Err(e) => {
                warn!(parent: &self.span, error = %e, "Failed to get server version");
                None
            }
        }
    }

    pub fn summary(&self) -> PoolSummary {
        PoolSummary {
            name: self.config.name.clone(),
            master: self.config.master,
            target: self.config.masked_target(),
            prefix: self.config.prefix.clone(),
            size: self.pool.size(),
            idle: self.pool.num_idle(),
        }
    }

    pub async fn close(&self) {
        info!(parent: &self.span, "Closing pool");
        self.pool.close().await;
    }
}

/// Generate a helpful suggestion for connection errors.
fn connection_suggestion(error: &sqlx::Error) -> String {
    let error_str = error.to_string().to_lowercase();

    if error_str.contains("connection refused") {
        return "Check that the MySQL server is running and accessible".to_string();
    }
    if error_str.contains("access denied") || error_str.contains("password") {
        return "Verify the user and password of the pool".to_string();
    }
    if error_str.contains("unknown database") {
        return "Check that the database name exists".to_string();
    }
    if error_str.contains("tls") || error_str.contains("ssl") {
        return "Check TLS/SSL configuration or try disabling it".to_string();
    }
    "Verify host, port and credentials of the pool".to_string()
}

/// All pools of the process, looked up by name or master flag.
#[derive(Debug, Default)]
pub struct PoolRegistry {
    /// Configuration order; the first master wins.
    pools: Vec<Arc<Pool>>,
    by_name: HashMap<String, usize>,
}

impl PoolRegistry {
    /// Validate the configs and connect every pool, failing on the first
    /// pool that cannot connect.
    pub async fn connect(configs: Vec<PoolConfig>) -> DbResult<Arc<Self>> {
        validate_pool_configs(&configs)?;
        let mut pools = Vec::with_capacity(configs.len());
        for config in configs {
            pools.push(Pool::connect(config).await?);
        }
        let registry = Self::from_pools(pools)?;
        info!(pools = registry.len(), "Pool registry ready");
        Ok(registry)
    }

    /// Validate the configs and create every pool without connecting.
    pub fn connect_lazy(configs: Vec<PoolConfig>) -> DbResult<Arc<Self>> {
        validate_pool_configs(&configs)?;
        let pools = configs
            .into_iter()
            .map(Pool::connect_lazy)
            .collect::<DbResult<Vec<_>>>()?;
        Self::from_pools(pools)
    }

    /// Build a registry from ready pools. Duplicate names are rejected.
    pub fn from_pools(pools: Vec<Pool>) -> DbResult<Arc<Self>> {
        let mut registry = Self::default();
        for pool in pools {
            let name = pool.name().to_string();
            if registry.by_name.contains_key(&name) {
                return Err(DbError::configuration(format!(
                    "duplicate pool name '{name}'"
                )));
            }
            registry.by_name.insert(name, registry.pools.len());
            registry.pools.push(Arc::new(pool));
        }
        Ok(Arc::new(registry))
    }

    /// `None` resolves the master pool, `Some(name)` an exact name match.
    pub fn lookup(&self, name: Option<&str>) -> Option<Arc<Pool>> {
        match name {
            None => self.pools.iter().find(|p| p.is_master()).cloned(),
            Some(name) => self.by_name.get(name).map(|&idx| Arc::clone(&self.pools[idx])),
        }
    }

    /// Typed variant of [`PoolRegistry::lookup`].
    pub fn get(&self, name: Option<&str>) -> DbResult<Arc<Pool>> {
        self.lookup(name).ok_or_else(|| DbError::pool_not_found(name))
    }

    /// Pool names in configuration order.
    pub fn names(&self) -> Vec<&str> {
        self.pools.iter().map(|p| p.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    pub fn summaries(&self) -> Vec<PoolSummary> {
        self.pools.iter().map(|p| p.summary()).collect()
    }

    /// Close every pool. Builders still holding the registry get connection
    /// errors afterwards.
    pub async fn close_all(&self) {
        for pool in &self.pools {
            pool.close().await;
        }
        info!("All pools closed");
    }

    /// A builder on `table` (prefix applied) using the master pool.
    pub fn query(self: &Arc<Self>, table: &str) -> Query {
        self.builder().table(table, true)
    }

    /// A builder on `table` (prefix applied) using the named pool.
    pub fn query_on(self: &Arc<Self>, table: &str, pool: &str) -> Query {
        self.builder().using(pool).table(table, true)
    }

    /// An empty builder bound to this registry.
    pub fn builder(self: &Arc<Self>) -> Query {
        Query::new(Arc::clone(self))
    }
}
