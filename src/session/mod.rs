pub mod sqlite;
#[cfg(test)]
pub(crate) mod testing;

use std::fmt;

use crate::error::SchemaShiftError;

pub use sqlite::SqliteSession;

/// A single column value returned by, or bound into, a warehouse query.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Real(f) => Some(*f as i64),
            Value::Text(s) => s.trim().parse().ok(),
            Value::Null => None,
        }
    }

    /// Text form of a value, `None` for NULL.
    pub fn to_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Integer(i) => Some(i.to_string()),
            Value::Real(f) => Some(f.to_string()),
            Value::Text(s) => Some(s.clone()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Real(f)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map_or(Value::Null, Into::into)
    }
}

pub type Row = Vec<Value>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOutcome {
    pub rows: Vec<Row>,
    pub rows_affected: Option<u64>,
    pub query_id: Option<String>,
}

impl QueryOutcome {
    pub fn with_rows(rows: Vec<Row>) -> Self {
        QueryOutcome {
            rows,
            ..Default::default()
        }
    }

    /// First column of the first row, for `SELECT COUNT(*)` style queries.
    pub fn scalar(&self) -> Option<&Value> {
        self.rows.first().and_then(|row| row.first())
    }
}

/// SQL flavour spoken by a session. Only the change history bookkeeping
/// needs to know; change scripts are passed through verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Snowflake,
    /// SQLite has no database or schema namespaces, so the fully qualified
    /// history table name becomes one quoted identifier.
    Sqlite,
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::Snowflake => write!(f, "snowflake"),
            Dialect::Sqlite => write!(f, "sqlite"),
        }
    }
}

/// A long-lived connection to the warehouse.
///
/// Outside autocommit mode every statement joins the open transaction until
/// `commit` or `rollback` is called.
pub trait WarehouseSession {
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<QueryOutcome, SchemaShiftError>;

    /// PUT/GET stage transfers. Backends that move files outside the
    /// transaction override this.
    fn execute_file_transfer(&mut self, sql: &str) -> Result<QueryOutcome, SchemaShiftError> {
        self.execute(sql, &[])
    }

    fn commit(&mut self) -> Result<(), SchemaShiftError>;

    fn rollback(&mut self) -> Result<(), SchemaShiftError>;

    fn autocommit(&self) -> bool;

    fn dialect(&self) -> Dialect;

    /// Recorded as INSTALLED_BY in the change history
    fn user(&self) -> &str;
}
