//! [`QueryRunner`] over a tokio-postgres connection.

use crate::config::{ClosureColumns, PgRunnerConfig};
use crate::error::{OrmError, OrmResult};
use crate::runner::{QueryRunner, RunnerProvider};
use crate::sql::{Sql, delete_sql, insert_rows_sql, insert_sql, select_sql, update_sql};
use crate::value::{Value, ValueMap, row_to_map};
use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio_postgres::types::ToSql;

enum PgConnection {
    Direct(tokio_postgres::Client),
    #[cfg(feature = "pool")]
    Pooled(deadpool_postgres::Object),
}

impl PgConnection {
    fn client(&self) -> &tokio_postgres::Client {
        match self {
            PgConnection::Direct(client) => client,
            #[cfg(feature = "pool")]
            PgConnection::Pooled(object) => {
                let client: &tokio_postgres::Client = object;
                client
            }
        }
    }
}

/// One Postgres session.
///
/// Transactions are driven with plain `BEGIN` / `COMMIT` / `ROLLBACK` so the
/// runner can be shared by reference between concurrent statements.
pub struct PgQueryRunner {
    connection: RwLock<Option<Arc<PgConnection>>>,
    transaction_active: AtomicBool,
    query_timeout: Option<Duration>,
    max_sql_log_length: Option<usize>,
    closure: ClosureColumns,
}

impl std::fmt::Debug for PgQueryRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgQueryRunner")
            .field("released", &self.is_released())
            .field("transaction_active", &self.is_transaction_active())
            .field("query_timeout", &self.query_timeout)
            .finish_non_exhaustive()
    }
}

fn truncate_sql(sql: &str, max: Option<usize>) -> Cow<'_, str> {
    match max {
        Some(max) if sql.len() > max => {
            let mut end = max;
            while !sql.is_char_boundary(end) {
                end -= 1;
            }
            Cow::Owned(format!("{}...", &sql[..end]))
        }
        _ => Cow::Borrowed(sql),
    }
}

impl PgQueryRunner {
    fn with_connection(connection: PgConnection) -> Self {
        Self {
            connection: RwLock::new(Some(Arc::new(connection))),
            transaction_active: AtomicBool::new(false),
            query_timeout: None,
            max_sql_log_length: Some(200),
            closure: ClosureColumns::default(),
        }
    }

    /// Wrap a directly connected client.
    pub fn new(client: tokio_postgres::Client) -> Self {
        Self::with_connection(PgConnection::Direct(client))
    }

    /// Wrap a pooled client; it goes back to the pool on release.
    #[cfg(feature = "pool")]
    pub fn from_pooled(object: deadpool_postgres::Object) -> Self {
        Self::with_connection(PgConnection::Pooled(object))
    }

    /// Apply timeout, logging and closure-column settings.
    pub fn configure(mut self, config: &PgRunnerConfig) -> Self {
        self.query_timeout = config.query_timeout;
        self.max_sql_log_length = config.max_sql_log_length;
        self.closure = config.closure.clone();
        self
    }

    fn connection(&self) -> OrmResult<Arc<PgConnection>> {
        self.connection
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(OrmError::RunnerReleased)
    }

    async fn with_timeout<T>(
        &self,
        fut: impl Future<Output = Result<T, tokio_postgres::Error>>,
    ) -> OrmResult<T> {
        match self.query_timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| OrmError::Timeout(limit))?
                .map_err(OrmError::from_db_error),
            None => fut.await.map_err(OrmError::from_db_error),
        }
    }

    async fn fetch(&self, q: &Sql) -> OrmResult<Vec<ValueMap>> {
        let connection = self.connection()?;
        let sql = q.to_sql();
        tracing::debug!(
            target: "entigraph.sql",
            param_count = q.params().len(),
            sql = %truncate_sql(&sql, self.max_sql_log_length),
        );
        let rows = self
            .with_timeout(connection.client().query(sql.as_str(), &q.params_ref()))
            .await?;
        rows.iter().map(row_to_map).collect()
    }

    async fn execute(&self, q: &Sql) -> OrmResult<u64> {
        let connection = self.connection()?;
        let sql = q.to_sql();
        tracing::debug!(
            target: "entigraph.sql",
            param_count = q.params().len(),
            sql = %truncate_sql(&sql, self.max_sql_log_length),
        );
        self.with_timeout(connection.client().execute(sql.as_str(), &q.params_ref()))
            .await
    }

    async fn batch(&self, statement: &str) -> OrmResult<()> {
        let connection = self.connection()?;
        tracing::debug!(target: "entigraph.sql", sql = statement);
        self.with_timeout(connection.client().batch_execute(statement))
            .await
    }
}

impl QueryRunner for PgQueryRunner {
    async fn insert(
        &self,
        table: &str,
        values: &ValueMap,
        generated_column: Option<&str>,
    ) -> OrmResult<Option<Value>> {
        let q = insert_sql(table, values, generated_column)?;
        let rows = self.fetch(&q).await?;
        Ok(match generated_column {
            Some(column) => rows.into_iter().next().and_then(|mut r| r.remove(column)),
            None => None,
        })
    }

    async fn update(&self, table: &str, values: &ValueMap, conditions: &ValueMap) -> OrmResult<u64> {
        self.execute(&update_sql(table, values, conditions)?).await
    }

    async fn delete(&self, table: &str, conditions: &ValueMap) -> OrmResult<u64> {
        self.execute(&delete_sql(table, conditions)?).await
    }

    async fn select(&self, table: &str, conditions: &ValueMap) -> OrmResult<Vec<ValueMap>> {
        self.fetch(&select_sql(table, conditions)?).await
    }

    async fn query(&self, sql: &str, params: &[Value]) -> OrmResult<Vec<ValueMap>> {
        let connection = self.connection()?;
        let refs: Vec<&(dyn ToSql + Sync)> = params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        tracing::debug!(
            target: "entigraph.sql",
            param_count = params.len(),
            sql = %truncate_sql(sql, self.max_sql_log_length),
        );
        let rows = self
            .with_timeout(connection.client().query(sql, &refs))
            .await?;
        rows.iter().map(row_to_map).collect()
    }

    async fn insert_into_closure_table(
        &self,
        table: &str,
        descendant: &Value,
        ancestor: Option<&Value>,
        has_level: bool,
    ) -> OrmResult<i64> {
        let c = &self.closure;
        let parent_rows = match ancestor {
            Some(ancestor) => {
                let mut conditions = ValueMap::new();
                conditions.insert(c.descendant.clone(), ancestor.clone());
                self.select(table, &conditions).await?
            }
            None => Vec::new(),
        };

        let level_of = |row: &ValueMap| row.get(&c.level).and_then(Value::as_i64).unwrap_or(1);
        let mut rows = Vec::with_capacity(parent_rows.len() + 1);
        for parent in &parent_rows {
            let mut row = ValueMap::new();
            row.insert(
                c.ancestor.clone(),
                parent.get(&c.ancestor).cloned().unwrap_or(Value::Null),
            );
            row.insert(c.descendant.clone(), descendant.clone());
            if has_level {
                row.insert(c.level.clone(), Value::Int(level_of(parent) + 1));
            }
            rows.push(row);
        }
        let mut self_row = ValueMap::new();
        self_row.insert(c.ancestor.clone(), descendant.clone());
        self_row.insert(c.descendant.clone(), descendant.clone());
        if has_level {
            self_row.insert(c.level.clone(), Value::Int(1));
        }
        rows.push(self_row);

        self.execute(&insert_rows_sql(table, &rows)?).await?;

        let parent_level = if has_level {
            parent_rows.iter().map(level_of).max().unwrap_or(0)
        } else {
            parent_rows.len() as i64
        };
        Ok(parent_level + 1)
    }

    async fn begin_transaction(&self) -> OrmResult<()> {
        if self.transaction_active.load(Ordering::SeqCst) {
            return Err(OrmError::TransactionAlreadyStarted);
        }
        self.batch("BEGIN").await?;
        self.transaction_active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn commit_transaction(&self) -> OrmResult<()> {
        if !self.transaction_active.load(Ordering::SeqCst) {
            return Err(OrmError::TransactionNotStarted);
        }
        self.batch("COMMIT").await?;
        self.transaction_active.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback_transaction(&self) -> OrmResult<()> {
        if !self.transaction_active.load(Ordering::SeqCst) {
            return Err(OrmError::TransactionNotStarted);
        }
        let res = self.batch("ROLLBACK").await;
        self.transaction_active.store(false, Ordering::SeqCst);
        res
    }

    fn is_transaction_active(&self) -> bool {
        self.transaction_active.load(Ordering::SeqCst)
    }

    async fn release(&self) -> OrmResult<()> {
        if self.is_released() {
            return Ok(());
        }
        // A pooled connection must not go back with an open transaction.
        if self.is_transaction_active() {
            if let Err(e) = self.rollback_transaction().await {
                tracing::warn!(target: "entigraph.sql", error = %e, "rollback on release failed");
            }
        }
        self.connection
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Ok(())
    }

    fn is_released(&self) -> bool {
        self.connection
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

// Dropped without release while a transaction is open: the session state is
// unknown, so a pooled connection is detached instead of returned.
impl Drop for PgQueryRunner {
    fn drop(&mut self) {
        if !self.transaction_active.load(Ordering::SeqCst) {
            return;
        }
        let connection = self
            .connection
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(connection) = connection else {
            return;
        };
        tracing::warn!(target: "entigraph.sql", "query runner dropped with an open transaction");
        #[cfg(feature = "pool")]
        if let Ok(PgConnection::Pooled(object)) = Arc::try_unwrap(connection) {
            drop(deadpool_postgres::Object::take(object));
        }
        #[cfg(not(feature = "pool"))]
        drop(connection);
    }
}

/// Pooled [`RunnerProvider`]: one connection per provided runner.
#[cfg(feature = "pool")]
#[derive(Clone)]
pub struct PgRunnerProvider {
    pool: deadpool_postgres::Pool,
    config: PgRunnerConfig,
}

#[cfg(feature = "pool")]
impl PgRunnerProvider {
    pub fn new(pool: deadpool_postgres::Pool, config: PgRunnerConfig) -> Self {
        Self { pool, config }
    }

    /// Build the pool described by `config`.
    pub fn connect(config: PgRunnerConfig) -> OrmResult<Self> {
        let pool = crate::pool::create_pool(&config)?;
        Ok(Self::new(pool, config))
    }

    pub fn pool(&self) -> &deadpool_postgres::Pool {
        &self.pool
    }
}

#[cfg(feature = "pool")]
impl RunnerProvider for PgRunnerProvider {
    type Runner = PgQueryRunner;

    async fn provide(&self) -> OrmResult<PgQueryRunner> {
        let object = self.pool.get().await?;
        Ok(PgQueryRunner::from_pooled(object).configure(&self.config))
    }
}
