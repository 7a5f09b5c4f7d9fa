use super::is_valid_ident;
use crate::error::{OrmError, OrmResult};
use crate::value::Value;
use std::fmt::Write as _;
use tokio_postgres::types::ToSql;

#[derive(Debug, Clone)]
enum SqlPart {
    Raw(String),
    Param,
}

/// A parameter-safe SQL builder.
///
/// `Sql` keeps SQL text and bound [`Value`]s apart and numbers the
/// `$1, $2, ...` placeholders when rendered.
#[must_use]
#[derive(Debug, Clone)]
pub struct Sql {
    parts: Vec<SqlPart>,
    params: Vec<Value>,
}

impl Sql {
    pub fn new(initial_sql: impl Into<String>) -> Self {
        Self {
            parts: vec![SqlPart::Raw(initial_sql.into())],
            params: Vec::new(),
        }
    }

    /// Append raw SQL.
    pub fn push(&mut self, sql: &str) -> &mut Self {
        if sql.is_empty() {
            return self;
        }
        match self.parts.last_mut() {
            Some(SqlPart::Raw(last)) => last.push_str(sql),
            _ => self.parts.push(SqlPart::Raw(sql.to_string())),
        }
        self
    }

    /// Append a placeholder and bind its value.
    pub fn push_bind(&mut self, value: impl Into<Value>) -> &mut Self {
        self.parts.push(SqlPart::Param);
        self.params.push(value.into());
        self
    }

    /// Append comma-separated placeholders; an empty list renders `NULL`.
    pub fn push_bind_list<T: Into<Value>>(&mut self, values: impl IntoIterator<Item = T>) -> &mut Self {
        let mut iter = values.into_iter();
        let Some(first) = iter.next() else {
            return self.push("NULL");
        };
        self.push_bind(first);
        for v in iter {
            self.push(", ").push_bind(v);
        }
        self
    }

    /// Append a (possibly dotted) identifier.
    ///
    /// Identifiers cannot be parameterized, so anything outside
    /// `[A-Za-z_][A-Za-z0-9_$]*` per part is rejected.
    pub fn push_ident(&mut self, ident: &str) -> OrmResult<&mut Self> {
        if !is_valid_ident(ident) {
            return Err(OrmError::Other(format!("invalid SQL identifier '{ident}'")));
        }
        Ok(self.push(ident))
    }

    /// Render with numbered placeholders.
    pub fn to_sql(&self) -> String {
        let mut out = String::new();
        let mut idx = 0;
        for part in &self.parts {
            match part {
                SqlPart::Raw(s) => out.push_str(s),
                SqlPart::Param => {
                    idx += 1;
                    let _ = write!(out, "${idx}");
                }
            }
        }
        out
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    /// Parameter refs compatible with `tokio-postgres`.
    pub fn params_ref(&self) -> Vec<&(dyn ToSql + Sync)> {
        self.params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
    }
}
