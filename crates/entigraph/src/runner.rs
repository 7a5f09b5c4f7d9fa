//! Query execution interface used by the persistence engine.
//!
//! A [`QueryRunner`] is one logical database session. The engine only needs
//! equality-conjunction writes by table name plus a closure-table helper, so
//! runners over very different stores (Postgres, the in-memory store used by
//! tests) share one small contract.

use crate::error::OrmResult;
use crate::value::{Value, ValueMap};
use std::future::Future;

/// One database session able to run the statements a persist plan needs.
///
/// Every method fails with [`OrmError::RunnerReleased`](crate::OrmError::RunnerReleased)
/// once [`QueryRunner::release`] has been called.
pub trait QueryRunner: Send + Sync {
    /// Insert a row and return the value of `generated_column`, if one is named.
    fn insert(
        &self,
        table: &str,
        values: &ValueMap,
        generated_column: Option<&str>,
    ) -> impl Future<Output = OrmResult<Option<Value>>> + Send;

    /// `UPDATE table SET values WHERE conditions` (conditions are ANDed equalities).
    fn update(
        &self,
        table: &str,
        values: &ValueMap,
        conditions: &ValueMap,
    ) -> impl Future<Output = OrmResult<u64>> + Send;

    /// `DELETE FROM table WHERE conditions` (conditions are ANDed equalities).
    fn delete(
        &self,
        table: &str,
        conditions: &ValueMap,
    ) -> impl Future<Output = OrmResult<u64>> + Send;

    /// Rows of `table` matching every condition, keyed by column name.
    fn select(
        &self,
        table: &str,
        conditions: &ValueMap,
    ) -> impl Future<Output = OrmResult<Vec<ValueMap>>> + Send;

    /// Run raw SQL with positional parameters.
    fn query(
        &self,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = OrmResult<Vec<ValueMap>>> + Send;

    /// Insert the closure rows of a new tree node and return its level.
    ///
    /// Adds the self row plus one row per ancestor of `ancestor`. The level is
    /// `max(level of the parent's ancestor rows) + 1`, or 1 without a parent.
    fn insert_into_closure_table(
        &self,
        table: &str,
        descendant: &Value,
        ancestor: Option<&Value>,
        has_level: bool,
    ) -> impl Future<Output = OrmResult<i64>> + Send;

    fn begin_transaction(&self) -> impl Future<Output = OrmResult<()>> + Send;

    fn commit_transaction(&self) -> impl Future<Output = OrmResult<()>> + Send;

    fn rollback_transaction(&self) -> impl Future<Output = OrmResult<()>> + Send;

    fn is_transaction_active(&self) -> bool;

    /// Return the session to wherever it came from. Idempotent.
    fn release(&self) -> impl Future<Output = OrmResult<()>> + Send;

    fn is_released(&self) -> bool;
}

/// Hands out runners and takes them back.
pub trait RunnerProvider: Send + Sync {
    type Runner: QueryRunner;

    /// Obtain a fresh session.
    fn provide(&self) -> impl Future<Output = OrmResult<Self::Runner>> + Send;

    /// Give a session back. The default implementation releases the runner.
    fn release(&self, runner: Self::Runner) -> impl Future<Output = OrmResult<()>> + Send {
        async move { runner.release().await }
    }

    /// Take back a runner whose owner went away without releasing it.
    ///
    /// Called from `Drop`, so it cannot wait. The default drops the runner.
    fn discard(&self, runner: Self::Runner) {
        drop(runner);
    }
}
