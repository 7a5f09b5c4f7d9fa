//! deadpool-postgres pool construction for [`PgRunnerProvider`](crate::pg_runner::PgRunnerProvider).

use crate::config::PgRunnerConfig;
use crate::error::{OrmError, OrmResult};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use tokio_postgres::NoTls;

/// Pool without TLS for `config.database_url`, sized by `config.max_pool_size`.
///
/// Connections are opened lazily on the first `get`.
pub fn create_pool(config: &PgRunnerConfig) -> OrmResult<Pool> {
    let pg_config: tokio_postgres::Config = config
        .database_url
        .parse()
        .map_err(|e: tokio_postgres::Error| OrmError::Connection(e.to_string()))?;

    let manager = Manager::from_config(pg_config, NoTls, default_manager_config());
    Pool::builder(manager)
        .max_size(config.max_pool_size)
        .build()
        .map_err(|e| OrmError::Pool(e.to_string()))
}

// Runners roll back any open transaction before release.
fn default_manager_config() -> ManagerConfig {
    ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    }
}
