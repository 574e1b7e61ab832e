use std::path::Path;

use log::{debug, trace};
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{params_from_iter, Connection, ToSql};

use crate::error::SchemaShiftError;

use super::{Dialect, QueryOutcome, Value, WarehouseSession};

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(rusqlite::types::Value::Null),
            Value::Integer(i) => ToSqlOutput::from(*i),
            Value::Real(f) => ToSqlOutput::from(*f),
            Value::Text(s) => ToSqlOutput::from(s.as_str()),
        })
    }
}

/// Warehouse session backed by a local SQLite database.
pub struct SqliteSession {
    conn: Connection,
    autocommit: bool,
    user: String,
}

impl SqliteSession {
    pub fn open(db_path: &Path, autocommit: bool, user: &str) -> Result<Self, SchemaShiftError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                return Err(SchemaShiftError::Error(format!(
                    "Database folder '{}' does not exist or is not a directory",
                    parent.display()
                )));
            }
        }

        let conn = Connection::open(db_path)?;
        debug!("Database opened at: {}", db_path.display());

        Ok(Self::from_connection(conn, autocommit, user))
    }

    pub fn open_in_memory(autocommit: bool, user: &str) -> Result<Self, SchemaShiftError> {
        Ok(Self::from_connection(Connection::open_in_memory()?, autocommit, user))
    }

    fn from_connection(conn: Connection, autocommit: bool, user: &str) -> Self {
        Self {
            conn,
            autocommit,
            user: user.to_owned(),
        }
    }

    fn begin_if_needed(&self) -> Result<(), SchemaShiftError> {
        // Connection::is_autocommit is SQLite's "no transaction open" flag
        if !self.autocommit && self.conn.is_autocommit() {
            self.conn.execute_batch("BEGIN")?;
        }
        Ok(())
    }
}

impl WarehouseSession for SqliteSession {
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<QueryOutcome, SchemaShiftError> {
        self.begin_if_needed()?;
        trace!("sqlite execute: {}", sql);

        let mut stmt = self.conn.prepare(sql)?;
        let column_count = stmt.column_count();

        if column_count == 0 {
            let changed = stmt.execute(params_from_iter(params.iter()))?;
            return Ok(QueryOutcome {
                rows: Vec::new(),
                rows_affected: Some(changed as u64),
                query_id: None,
            });
        }

        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(column_count);
            for i in 0..column_count {
                values.push(match row.get_ref(i)? {
                    ValueRef::Null => Value::Null,
                    ValueRef::Integer(v) => Value::Integer(v),
                    ValueRef::Real(v) => Value::Real(v),
                    ValueRef::Text(v) => Value::Text(String::from_utf8_lossy(v).into_owned()),
                    ValueRef::Blob(v) => Value::Text(hex::encode(v)),
                });
            }
            out.push(values);
        }

        Ok(QueryOutcome {
            rows_affected: Some(out.len() as u64),
            rows: out,
            query_id: None,
        })
    }

    fn execute_file_transfer(&mut self, sql: &str) -> Result<QueryOutcome, SchemaShiftError> {
        Err(SchemaShiftError::Session(format!(
            "PUT/GET file transfers are not supported by the sqlite backend: {}",
            sql.lines().next().unwrap_or_default()
        )))
    }

    fn commit(&mut self) -> Result<(), SchemaShiftError> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("COMMIT")?;
        }
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), SchemaShiftError> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }

    fn autocommit(&self) -> bool {
        self.autocommit
    }

    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn user(&self) -> &str {
        &self.user
    }
}
