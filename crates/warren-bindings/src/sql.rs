//! Embedded SQL databases for the D1-style binding.
//!
//! Each database is one SQLite connection, in memory or on disk. The runtime
//! opens a database per database-id and shares the connection across
//! requests; the connection mutex serializes concurrent statements.

use crate::error::{BindingError, BindingResult};
use parking_lot::Mutex;
use rusqlite::types::{Value as SqliteValue, ValueRef};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::path::Path;

/// A SQL parameter or cell value, JSON-compatible on both sides of the
/// bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl SqlValue {
    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => SqlValue::Null,
            JsonValue::Bool(b) => SqlValue::Bool(*b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    SqlValue::Int(i)
                } else {
                    SqlValue::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            JsonValue::String(s) => SqlValue::Text(s.clone()),
            // Structured parameters travel as their JSON text.
            other => SqlValue::Text(other.to_string()),
        }
    }

    fn into_sqlite(self) -> SqliteValue {
        match self {
            SqlValue::Null => SqliteValue::Null,
            SqlValue::Bool(b) => SqliteValue::Integer(b as i64),
            SqlValue::Int(i) => SqliteValue::Integer(i),
            SqlValue::Float(f) => SqliteValue::Real(f),
            SqlValue::Text(s) => SqliteValue::Text(s),
        }
    }
}

fn cell_to_json(value: ValueRef<'_>) -> JsonValue {
    match value {
        ValueRef::Null => JsonValue::Null,
        ValueRef::Integer(i) => JsonValue::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        ValueRef::Text(t) => JsonValue::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => JsonValue::Array(b.iter().map(|&x| JsonValue::from(x)).collect()),
    }
}

/// Result of a statement that returns rows.
#[derive(Debug, Clone, Serialize)]
pub struct SqlRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<JsonValue>>,
}

impl SqlRows {
    /// Rows as JSON objects keyed by column name.
    pub fn as_objects(&self) -> Vec<JsonValue> {
        self.rows
            .iter()
            .map(|row| {
                let mut object = serde_json::Map::with_capacity(self.columns.len());
                for (column, cell) in self.columns.iter().zip(row.iter()) {
                    object.insert(column.clone(), cell.clone());
                }
                JsonValue::Object(object)
            })
            .collect()
    }
}

/// Result of a statement that mutates.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SqlExecMeta {
    pub rows_affected: usize,
    pub last_insert_rowid: i64,
}

/// One embedded database.
pub struct SqlDatabase {
    conn: Mutex<Connection>,
}

impl SqlDatabase {
    pub fn open_in_memory() -> BindingResult<Self> {
        Ok(Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        })
    }

    /// Open (creating parents as needed) a database file.
    pub fn open(path: &Path) -> BindingResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(Self {
            conn: Mutex::new(Connection::open(path)?),
        })
    }

    /// Run a statement and collect its rows.
    pub fn query(&self, sql: &str, params: &[JsonValue]) -> BindingResult<SqlRows> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let columns: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(|c| c.to_string())
            .collect();

        let bound: Vec<SqliteValue> = params
            .iter()
            .map(|p| SqlValue::from_json(p).into_sqlite())
            .collect();

        let mut rows = stmt.query(rusqlite::params_from_iter(bound))?;
        let mut collected = Vec::new();
        while let Some(row) = rows.next()? {
            let mut cells = Vec::with_capacity(columns.len());
            for index in 0..columns.len() {
                cells.push(cell_to_json(row.get_ref(index)?));
            }
            collected.push(cells);
        }

        Ok(SqlRows {
            columns,
            rows: collected,
        })
    }

    /// Run a mutating statement.
    pub fn execute(&self, sql: &str, params: &[JsonValue]) -> BindingResult<SqlExecMeta> {
        let conn = self.conn.lock();
        let bound: Vec<SqliteValue> = params
            .iter()
            .map(|p| SqlValue::from_json(p).into_sqlite())
            .collect();
        let rows_affected = conn.execute(sql, rusqlite::params_from_iter(bound))?;
        Ok(SqlExecMeta {
            rows_affected,
            last_insert_rowid: conn.last_insert_rowid(),
        })
    }

    /// Run multiple `;`-separated statements, no parameters, no results.
    pub fn execute_batch(&self, sql: &str) -> BindingResult<()> {
        self.conn.lock().execute_batch(sql)?;
        Ok(())
    }

    /// Whether the first keyword of `sql` can return rows.
    pub fn returns_rows(sql: &str) -> bool {
        let keyword = sql
            .trim_start()
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_ascii_uppercase();
        matches!(keyword.as_str(), "SELECT" | "PRAGMA" | "WITH" | "EXPLAIN")
    }
}

impl std::fmt::Debug for SqlDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlDatabase").finish_non_exhaustive()
    }
}

#[allow(dead_code)]
fn assert_send_sync() {
    fn check<T: Send + Sync>() {}
    check::<SqlDatabase>();
}
