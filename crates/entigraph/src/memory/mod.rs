//! In-process table store implementing [`QueryRunner`].
//!
//! `MemoryDatabase` keeps rows as column maps and records every statement it
//! receives, which makes it convenient for exercising persist plans without a
//! Postgres server. Transactions work on a private copy of all tables that is
//! swapped in on commit (last committer wins).

#[cfg(test)]
mod tests;

use crate::config::ClosureColumns;
use crate::error::{OrmError, OrmResult};
use crate::runner::{QueryRunner, RunnerProvider};
use crate::value::{Value, ValueMap};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Kind of a statement recorded by [`MemoryDatabase`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    Insert,
    Update,
    Delete,
    Select,
    Query,
    ClosureInsert,
    Begin,
    Commit,
    Rollback,
}

impl StatementKind {
    /// Statements that change table contents.
    pub fn is_mutation(self) -> bool {
        matches!(
            self,
            StatementKind::Insert
                | StatementKind::Update
                | StatementKind::Delete
                | StatementKind::ClosureInsert
        )
    }
}

/// One statement as received by a memory runner.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedStatement {
    pub kind: StatementKind,
    pub table: Option<String>,
    pub values: ValueMap,
    pub conditions: ValueMap,
}

#[derive(Debug, Clone, Default)]
struct Table {
    rows: Vec<ValueMap>,
    last_id: i64,
}

type Tables = BTreeMap<String, Table>;

#[derive(Debug, Default)]
struct Store {
    tables: Tables,
    log: Vec<LoggedStatement>,
    unique: Vec<(String, String)>,
    fail_on: Option<(StatementKind, String)>,
    provided: usize,
    released: usize,
}

/// Shared in-memory database. Clones share the same store.
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    store: Arc<Mutex<Store>>,
    closure: ClosureColumns,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_closure_columns(mut self, closure: ClosureColumns) -> Self {
        self.closure = closure;
        self
    }

    /// Declare a unique constraint on `table.column`.
    pub fn unique(self, table: impl Into<String>, column: impl Into<String>) -> Self {
        lock(&self.store).unique.push((table.into(), column.into()));
        self
    }

    /// Make the next `kind` statement against `table` fail.
    pub fn fail_on(&self, kind: StatementKind, table: impl Into<String>) {
        lock(&self.store).fail_on = Some((kind, table.into()));
    }

    /// Insert a committed row directly, bypassing runners and the statement log.
    pub fn seed(&self, table: &str, row: ValueMap) {
        let mut store = lock(&self.store);
        let t = store.tables.entry(table.to_string()).or_default();
        for value in row.values() {
            if let Value::Int(v) = value {
                t.last_id = t.last_id.max(*v);
            }
        }
        t.rows.push(row);
    }

    /// Committed rows of `table`.
    pub fn rows(&self, table: &str) -> Vec<ValueMap> {
        lock(&self.store)
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Every statement received so far, in arrival order.
    pub fn statements(&self) -> Vec<LoggedStatement> {
        lock(&self.store).log.clone()
    }

    pub fn clear_statements(&self) {
        lock(&self.store).log.clear();
    }

    /// Number of statements that changed table contents.
    pub fn mutation_count(&self) -> usize {
        lock(&self.store)
            .log
            .iter()
            .filter(|s| s.kind.is_mutation())
            .count()
    }

    /// Runners handed out by the provider and not given back yet.
    pub fn open_runners(&self) -> usize {
        let store = lock(&self.store);
        store.provided.saturating_sub(store.released)
    }

    pub fn runner(&self) -> MemoryQueryRunner {
        MemoryQueryRunner {
            db: self.clone(),
            state: Mutex::new(RunnerState::default()),
        }
    }
}

impl RunnerProvider for MemoryDatabase {
    type Runner = MemoryQueryRunner;

    async fn provide(&self) -> OrmResult<MemoryQueryRunner> {
        lock(&self.store).provided += 1;
        Ok(self.runner())
    }

    async fn release(&self, runner: MemoryQueryRunner) -> OrmResult<()> {
        lock(&self.store).released += 1;
        runner.release().await
    }

    fn discard(&self, runner: MemoryQueryRunner) {
        lock(&self.store).released += 1;
        let mut state = lock(&runner.state);
        state.released = true;
        state.tx = None;
    }
}

#[derive(Debug, Default)]
struct RunnerState {
    released: bool,
    tx: Option<Tables>,
}

/// A session on a [`MemoryDatabase`].
#[derive(Debug)]
pub struct MemoryQueryRunner {
    db: MemoryDatabase,
    state: Mutex<RunnerState>,
}

fn matches(row: &ValueMap, conditions: &ValueMap) -> bool {
    conditions
        .iter()
        .all(|(column, value)| row.get(column).unwrap_or(&Value::Null) == value)
}

impl MemoryQueryRunner {
    /// Log the statement, then run `f` against the transaction copy or the
    /// committed tables.
    fn run<T>(
        &self,
        statement: LoggedStatement,
        f: impl FnOnce(&mut Tables, &[(String, String)]) -> OrmResult<T>,
    ) -> OrmResult<T> {
        let mut state = lock(&self.state);
        if state.released {
            return Err(OrmError::RunnerReleased);
        }
        let mut store = lock(&self.db.store);
        let injected = match (&store.fail_on, &statement.table) {
            (Some((kind, table)), Some(target)) => *kind == statement.kind && table == target,
            _ => false,
        };
        store.log.push(statement);
        if injected {
            store.fail_on = None;
            return Err(OrmError::Connection("injected failure".to_string()));
        }

        let store = &mut *store;
        match state.tx.as_mut() {
            Some(tx) => f(tx, &store.unique),
            None => f(&mut store.tables, &store.unique),
        }
    }

    fn control(&self, kind: StatementKind) -> OrmResult<()> {
        let mut state = lock(&self.state);
        if state.released {
            return Err(OrmError::RunnerReleased);
        }
        let mut store = lock(&self.db.store);
        match kind {
            StatementKind::Begin => {
                if state.tx.is_some() {
                    return Err(OrmError::TransactionAlreadyStarted);
                }
                state.tx = Some(store.tables.clone());
            }
            StatementKind::Commit => {
                let tx = state.tx.take().ok_or(OrmError::TransactionNotStarted)?;
                store.tables = tx;
            }
            _ => {
                state.tx.take().ok_or(OrmError::TransactionNotStarted)?;
            }
        }
        store.log.push(LoggedStatement {
            kind,
            table: None,
            values: ValueMap::new(),
            conditions: ValueMap::new(),
        });
        Ok(())
    }
}

fn statement(kind: StatementKind, table: &str, values: &ValueMap, conditions: &ValueMap) -> LoggedStatement {
    LoggedStatement {
        kind,
        table: Some(table.to_string()),
        values: values.clone(),
        conditions: conditions.clone(),
    }
}

impl QueryRunner for MemoryQueryRunner {
    async fn insert(
        &self,
        table: &str,
        values: &ValueMap,
        generated_column: Option<&str>,
    ) -> OrmResult<Option<Value>> {
        let empty = ValueMap::new();
        self.run(statement(StatementKind::Insert, table, values, &empty), |tables, unique| {
            let t = tables.entry(table.to_string()).or_default();
            let mut row = values.clone();

            if let Some(column) = generated_column {
                match row.get(column) {
                    Some(Value::Int(v)) => t.last_id = t.last_id.max(*v),
                    Some(v) if v.is_set() => {}
                    _ => {
                        t.last_id += 1;
                        row.insert(column.to_string(), Value::Int(t.last_id));
                    }
                }
            }

            for (_, column) in unique.iter().filter(|(name, _)| name == table) {
                let Some(value) = row.get(column).filter(|v| v.is_set()) else {
                    continue;
                };
                if t.rows.iter().any(|r| r.get(column) == Some(value)) {
                    return Err(OrmError::UniqueViolation(format!(
                        "{table}.{column}: duplicate value {value}"
                    )));
                }
            }

            let generated = generated_column.and_then(|c| row.get(c).cloned());
            t.rows.push(row);
            Ok(generated)
        })
    }

    async fn update(&self, table: &str, values: &ValueMap, conditions: &ValueMap) -> OrmResult<u64> {
        self.run(statement(StatementKind::Update, table, values, conditions), |tables, _| {
            let Some(t) = tables.get_mut(table) else {
                return Ok(0);
            };
            let mut affected = 0;
            for row in t.rows.iter_mut().filter(|r| matches(r, conditions)) {
                row.extend(values.iter().map(|(k, v)| (k.clone(), v.clone())));
                affected += 1;
            }
            Ok(affected)
        })
    }

    async fn delete(&self, table: &str, conditions: &ValueMap) -> OrmResult<u64> {
        let empty = ValueMap::new();
        self.run(statement(StatementKind::Delete, table, &empty, conditions), |tables, _| {
            let Some(t) = tables.get_mut(table) else {
                return Ok(0);
            };
            let before = t.rows.len();
            t.rows.retain(|r| !matches(r, conditions));
            Ok((before - t.rows.len()) as u64)
        })
    }

    async fn select(&self, table: &str, conditions: &ValueMap) -> OrmResult<Vec<ValueMap>> {
        let empty = ValueMap::new();
        self.run(statement(StatementKind::Select, table, &empty, conditions), |tables, _| {
            Ok(tables
                .get(table)
                .map(|t| t.rows.iter().filter(|r| matches(r, conditions)).cloned().collect())
                .unwrap_or_default())
        })
    }

    async fn query(&self, sql: &str, _params: &[Value]) -> OrmResult<Vec<ValueMap>> {
        let logged = LoggedStatement {
            kind: StatementKind::Query,
            table: None,
            values: ValueMap::new(),
            conditions: ValueMap::new(),
        };
        self.run(logged, |_, _| {
            Err(OrmError::Other(format!(
                "raw SQL is not supported by the in-memory store: {sql}"
            )))
        })
    }

    async fn insert_into_closure_table(
        &self,
        table: &str,
        descendant: &Value,
        ancestor: Option<&Value>,
        has_level: bool,
    ) -> OrmResult<i64> {
        let closure = &self.db.closure;
        let mut values = ValueMap::new();
        values.insert(closure.descendant.clone(), descendant.clone());
        if let Some(ancestor) = ancestor {
            values.insert(closure.ancestor.clone(), ancestor.clone());
        }
        let empty = ValueMap::new();

        self.run(statement(StatementKind::ClosureInsert, table, &values, &empty), |tables, _| {
            let t = tables.entry(table.to_string()).or_default();
            let parent_rows: Vec<ValueMap> = match ancestor {
                Some(ancestor) => t
                    .rows
                    .iter()
                    .filter(|r| r.get(&closure.descendant) == Some(ancestor))
                    .cloned()
                    .collect(),
                None => Vec::new(),
            };

            let level_of = |row: &ValueMap| {
                row.get(&closure.level).and_then(Value::as_i64).unwrap_or(1)
            };
            let parent_level = if has_level {
                parent_rows.iter().map(level_of).max().unwrap_or(0)
            } else {
                parent_rows.len() as i64
            };

            for row in &parent_rows {
                let mut new_row = ValueMap::new();
                new_row.insert(
                    closure.ancestor.clone(),
                    row.get(&closure.ancestor).cloned().unwrap_or(Value::Null),
                );
                new_row.insert(closure.descendant.clone(), descendant.clone());
                if has_level {
                    new_row.insert(closure.level.clone(), Value::Int(level_of(row) + 1));
                }
                t.rows.push(new_row);
            }

            let mut self_row = ValueMap::new();
            self_row.insert(closure.ancestor.clone(), descendant.clone());
            self_row.insert(closure.descendant.clone(), descendant.clone());
            if has_level {
                self_row.insert(closure.level.clone(), Value::Int(1));
            }
            t.rows.push(self_row);

            Ok(parent_level + 1)
        })
    }

    async fn begin_transaction(&self) -> OrmResult<()> {
        self.control(StatementKind::Begin)
    }

    async fn commit_transaction(&self) -> OrmResult<()> {
        self.control(StatementKind::Commit)
    }

    async fn rollback_transaction(&self) -> OrmResult<()> {
        self.control(StatementKind::Rollback)
    }

    fn is_transaction_active(&self) -> bool {
        lock(&self.state).tx.is_some()
    }

    async fn release(&self) -> OrmResult<()> {
        let mut state = lock(&self.state);
        state.released = true;
        state.tx = None;
        Ok(())
    }

    fn is_released(&self) -> bool {
        lock(&self.state).released
    }
}
