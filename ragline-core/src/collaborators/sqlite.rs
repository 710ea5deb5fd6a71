//! SQLite storage adapter.
//!
//! Each call opens its own connection on the blocking pool. SQLite result
//! codes are mapped onto fault kinds; a busy or locked database is retryable.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, ErrorCode, OpenFlags};

use super::{CallResult, Storage};
use crate::config::StorageConfig;
use crate::error::{CollaboratorError, FaultKind, classify_message};
use crate::types::{Column, Relationship, ResultSet, Row, Schema, Table};

const COLLABORATOR: &str = "storage";

/// Row cap for a single query.
const MAX_ROWS: usize = 1000;

#[derive(Debug, Clone)]
pub struct SqliteStorage {
    path: PathBuf,
    read_only: bool,
}

impl SqliteStorage {
    pub fn new(path: impl Into<PathBuf>, read_only: bool) -> Self {
        Self {
            path: path.into(),
            read_only,
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(&config.path, config.read_only)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn run<T, F>(&self, op: F) -> CallResult<T>
    where
        T: Send + 'static,
        F: FnOnce(Connection) -> CallResult<T> + Send + 'static,
    {
        let path = self.path.clone();
        let read_only = self.read_only;
        tokio::task::spawn_blocking(move || {
            let flags = if read_only {
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX
            } else {
                OpenFlags::default()
            };
            let conn = Connection::open_with_flags(&path, flags).map_err(map_sqlite_error)?;
            op(conn)
        })
        .await
        .map_err(|e| {
            CollaboratorError::new(FaultKind::Internal, COLLABORATOR, format!("task join error: {e}"))
        })?
    }
}

/// Whether `statement` only reads.
fn is_read_statement(statement: &str) -> bool {
    let head = statement
        .trim_start()
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    matches!(head.as_str(), "SELECT" | "WITH" | "PRAGMA" | "EXPLAIN")
}

/// Map a SQLite failure onto a fault kind.
pub fn map_sqlite_error(err: rusqlite::Error) -> CollaboratorError {
    let kind = match &err {
        rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => FaultKind::Unavailable,
            ErrorCode::SystemIoFailure | ErrorCode::FileLockingProtocolFailed => {
                FaultKind::Unavailable
            }
            ErrorCode::CannotOpen => FaultKind::Connection,
            ErrorCode::ConstraintViolation | ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => {
                FaultKind::DataIntegrity
            }
            ErrorCode::PermissionDenied
            | ErrorCode::ReadOnly
            | ErrorCode::AuthorizationForStatementDenied => FaultKind::PermissionDenied,
            ErrorCode::TooBig | ErrorCode::TypeMismatch | ErrorCode::ParameterOutOfRange => {
                FaultKind::MalformedInput
            }
            _ => classify_message(&err.to_string()),
        },
        rusqlite::Error::InvalidColumnName(_)
        | rusqlite::Error::InvalidColumnIndex(_)
        | rusqlite::Error::InvalidParameterName(_)
        | rusqlite::Error::InvalidColumnType(..)
        | rusqlite::Error::MultipleStatement => FaultKind::MalformedInput,
        other => classify_message(&other.to_string()),
    };
    CollaboratorError::new(kind, COLLABORATOR, err.to_string())
}

fn sql_to_json(value: SqlValue) -> serde_json::Value {
    match value {
        SqlValue::Null => serde_json::Value::Null,
        SqlValue::Integer(i) => i.into(),
        SqlValue::Real(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        SqlValue::Text(s) => s.into(),
        SqlValue::Blob(b) => format!("<blob {} bytes>", b.len()).into(),
    }
}

fn json_to_sql(value: &serde_json::Value) -> SqlValue {
    match value {
        serde_json::Value::Null => SqlValue::Null,
        serde_json::Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        serde_json::Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn query(conn: &Connection, statement: &str) -> rusqlite::Result<ResultSet> {
    let mut stmt = conn.prepare(statement)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        if out.len() >= MAX_ROWS {
            break;
        }
        let mut record = Row::new();
        for (i, name) in columns.iter().enumerate() {
            record.insert(name.clone(), sql_to_json(row.get::<_, SqlValue>(i)?));
        }
        out.push(record);
    }
    Ok(ResultSet { columns, rows: out })
}

fn read_schema(conn: &Connection) -> rusqlite::Result<Schema> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )?;
    let names: Vec<String> = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;

    let mut schema = Schema::default();
    for name in names {
        let mut info = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(&name)))?;
        let columns = info
            .query_map([], |row| {
                Ok(Column {
                    name: row.get(1)?,
                    data_type: row.get(2)?,
                    nullable: row.get::<_, i64>(3)? == 0,
                    primary_key: row.get::<_, i64>(5)? > 0,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut fks = conn.prepare(&format!("PRAGMA foreign_key_list({})", quote_ident(&name)))?;
        let relationships = fks
            .query_map([], |row| {
                Ok(Relationship {
                    from_table: name.clone(),
                    from_column: row.get(3)?,
                    to_table: row.get(2)?,
                    to_column: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        schema.relationships.extend(relationships);
        schema.tables.push(Table { name, columns });
    }
    Ok(schema)
}

fn insert_rows(conn: &mut Connection, table: &str, rows: &[Row]) -> rusqlite::Result<usize> {
    let tx = conn.transaction()?;
    let mut inserted = 0;
    for row in rows {
        let columns: Vec<String> = row.keys().map(|k| quote_ident(k)).collect();
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(table),
            columns.join(", "),
            placeholders.join(", ")
        );
        let values: Vec<SqlValue> = row.values().map(json_to_sql).collect();
        inserted += tx.execute(&sql, rusqlite::params_from_iter(values))?;
    }
    tx.commit()?;
    Ok(inserted)
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn execute_query(&self, statement: &str) -> CallResult<ResultSet> {
        if self.read_only && !is_read_statement(statement) {
            return Err(CollaboratorError::new(
                FaultKind::PermissionDenied,
                COLLABORATOR,
                "only read statements are permitted on a read-only store",
            ));
        }
        let statement = statement.to_string();
        self.run(move |conn| query(&conn, &statement).map_err(map_sqlite_error))
            .await
    }

    async fn get_schema(&self) -> CallResult<Schema> {
        self.run(|conn| read_schema(&conn).map_err(map_sqlite_error))
            .await
    }

    async fn insert_batch(&self, table: &str, rows: &[Row]) -> CallResult<usize> {
        if self.read_only {
            return Err(CollaboratorError::new(
                FaultKind::PermissionDenied,
                COLLABORATOR,
                "inserts are not permitted on a read-only store",
            )
            .with_context("table", table));
        }
        if rows.is_empty() {
            return Ok(0);
        }
        let table_name = table.to_string();
        let rows = rows.to_vec();
        self.run(move |mut conn| insert_rows(&mut conn, &table_name, &rows).map_err(map_sqlite_error))
            .await
            .map_err(|e| e.with_context("table", table))
    }
}
