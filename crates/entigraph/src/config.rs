//! Configuration structs for runners and the entity manager.

use crate::error::{OrmError, OrmResult};
use std::time::Duration;

/// Column names of closure tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosureColumns {
    pub ancestor: String,
    pub descendant: String,
    pub level: String,
}

impl Default for ClosureColumns {
    fn default() -> Self {
        Self {
            ancestor: "ancestor".to_string(),
            descendant: "descendant".to_string(),
            level: "level".to_string(),
        }
    }
}

/// Configuration for [`PgRunnerProvider`](crate::pg_runner::PgRunnerProvider).
#[derive(Debug, Clone)]
pub struct PgRunnerConfig {
    pub database_url: String,
    /// Maximum number of pooled connections.
    pub max_pool_size: usize,
    /// Per-statement timeout. `None` means no timeout (default).
    pub query_timeout: Option<Duration>,
    /// Truncate logged SQL to this many bytes. `None` disables truncation.
    pub max_sql_log_length: Option<usize>,
    pub closure: ClosureColumns,
}

impl PgRunnerConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_pool_size: 16,
            query_timeout: None,
            max_sql_log_length: Some(200),
            closure: ClosureColumns::default(),
        }
    }

    /// Read `DATABASE_URL`, `ENTIGRAPH_POOL_SIZE` and `ENTIGRAPH_QUERY_TIMEOUT_MS`.
    pub fn from_env() -> OrmResult<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| OrmError::Connection("DATABASE_URL is not set".to_string()))?;
        let mut config = Self::new(database_url);

        if let Ok(size) = std::env::var("ENTIGRAPH_POOL_SIZE") {
            config.max_pool_size = size.parse().map_err(|e| {
                OrmError::Other(format!("invalid ENTIGRAPH_POOL_SIZE '{size}': {e}"))
            })?;
        }
        if let Ok(ms) = std::env::var("ENTIGRAPH_QUERY_TIMEOUT_MS") {
            let ms: u64 = ms.parse().map_err(|e| {
                OrmError::Other(format!("invalid ENTIGRAPH_QUERY_TIMEOUT_MS '{ms}': {e}"))
            })?;
            config.query_timeout = Some(Duration::from_millis(ms));
        }
        Ok(config)
    }

    pub fn with_max_pool_size(mut self, size: usize) -> Self {
        self.max_pool_size = size;
        self
    }

    /// Statements exceeding this duration fail with [`OrmError::Timeout`].
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = Some(timeout);
        self
    }

    pub fn with_max_sql_log_length(mut self, len: usize) -> Self {
        self.max_sql_log_length = Some(len);
        self
    }

    /// Log SQL without truncation.
    pub fn no_truncate(mut self) -> Self {
        self.max_sql_log_length = None;
        self
    }

    pub fn with_closure_columns(mut self, closure: ClosureColumns) -> Self {
        self.closure = closure;
        self
    }
}

/// Configuration for [`EntityManager`](crate::EntityManager).
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Load db-side rows for identified entities the caller never fetched.
    pub load_missing_entities: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            load_missing_entities: true,
        }
    }
}

impl ManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_missing_entities(mut self, enabled: bool) -> Self {
        self.load_missing_entities = enabled;
        self
    }
}
