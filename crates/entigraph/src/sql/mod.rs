//! Parameter-safe SQL assembly for the Postgres runner.
//!
//! Table and column names come from validated metadata; every value is bound
//! as a parameter.
//!
//! ```ignore
//! use entigraph::sql::sql;
//!
//! let mut q = sql("SELECT * FROM posts WHERE id = ");
//! q.push_bind(42);
//! assert_eq!(q.to_sql(), "SELECT * FROM posts WHERE id = $1");
//! ```

mod builder;


pub use builder::Sql;

use crate::error::{OrmError, OrmResult};
use crate::value::{Value, ValueMap};

/// Start building a SQL statement.
pub fn sql(initial_sql: impl Into<String>) -> Sql {
    Sql::new(initial_sql)
}

/// Whether `ident` is a plain or dotted identifier (`schema.table`).
pub fn is_valid_ident(ident: &str) -> bool {
    !ident.is_empty()
        && ident.split('.').all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
        })
}

fn push_conditions(q: &mut Sql, conditions: &ValueMap) -> OrmResult<()> {
    for (i, (column, value)) in conditions.iter().enumerate() {
        q.push(if i == 0 { " WHERE " } else { " AND " });
        q.push_ident(column)?;
        if value.is_null() {
            q.push(" IS NULL");
        } else {
            q.push(" = ").push_bind(value.clone());
        }
    }
    Ok(())
}

/// `INSERT INTO table (..) VALUES (..) [RETURNING column]`.
pub fn insert_sql(table: &str, values: &ValueMap, returning: Option<&str>) -> OrmResult<Sql> {
    let mut q = sql("INSERT INTO ");
    q.push_ident(table)?;
    if values.is_empty() {
        q.push(" DEFAULT VALUES");
    } else {
        q.push(" (");
        for (i, column) in values.keys().enumerate() {
            if i > 0 {
                q.push(", ");
            }
            q.push_ident(column)?;
        }
        q.push(") VALUES (")
            .push_bind_list(values.values().cloned())
            .push(")");
    }
    if let Some(column) = returning {
        q.push(" RETURNING ");
        q.push_ident(column)?;
    }
    Ok(q)
}

/// Multi-row `INSERT`; every row must have the columns of the first one.
pub fn insert_rows_sql(table: &str, rows: &[ValueMap]) -> OrmResult<Sql> {
    let Some(first) = rows.first() else {
        return Err(OrmError::Other("INSERT requires at least one row".to_string()));
    };
    let columns: Vec<&String> = first.keys().collect();

    let mut q = sql("INSERT INTO ");
    q.push_ident(table)?;
    q.push(" (");
    for (i, column) in columns.iter().enumerate() {
        if i > 0 {
            q.push(", ");
        }
        q.push_ident(column)?;
    }
    q.push(") VALUES ");
    for (i, row) in rows.iter().enumerate() {
        if i > 0 {
            q.push(", ");
        }
        let values = columns
            .iter()
            .map(|c| {
                row.get(*c).cloned().ok_or_else(|| {
                    OrmError::Other(format!("row {i} is missing column '{c}'"))
                })
            })
            .collect::<OrmResult<Vec<Value>>>()?;
        q.push("(").push_bind_list(values).push(")");
    }
    Ok(q)
}

/// `UPDATE table SET .. WHERE ..`; both maps must be non-empty.
pub fn update_sql(table: &str, values: &ValueMap, conditions: &ValueMap) -> OrmResult<Sql> {
    if values.is_empty() {
        return Err(OrmError::Other("UPDATE requires at least one column".to_string()));
    }
    if conditions.is_empty() {
        return Err(OrmError::Other("UPDATE requires a WHERE condition".to_string()));
    }
    let mut q = sql("UPDATE ");
    q.push_ident(table)?;
    q.push(" SET ");
    for (i, (column, value)) in values.iter().enumerate() {
        if i > 0 {
            q.push(", ");
        }
        q.push_ident(column)?;
        q.push(" = ").push_bind(value.clone());
    }
    push_conditions(&mut q, conditions)?;
    Ok(q)
}

/// `DELETE FROM table WHERE ..`; conditions must be non-empty.
pub fn delete_sql(table: &str, conditions: &ValueMap) -> OrmResult<Sql> {
    if conditions.is_empty() {
        return Err(OrmError::Other("DELETE requires a WHERE condition".to_string()));
    }
    let mut q = sql("DELETE FROM ");
    q.push_ident(table)?;
    push_conditions(&mut q, conditions)?;
    Ok(q)
}

/// `SELECT * FROM table [WHERE ..]`.
pub fn select_sql(table: &str, conditions: &ValueMap) -> OrmResult<Sql> {
    let mut q = sql("SELECT * FROM ");
    q.push_ident(table)?;
    push_conditions(&mut q, conditions)?;
    Ok(q)
}
