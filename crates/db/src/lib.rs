//! SQL-dialect-agnostic storage boundary.
//!
//! The permission store issues identical logical SQL against any
//! [`DatabaseDriver`]; the driver owns connection handling, placeholder
//! binding and the small set of dialect differences (DDL idempotence,
//! upsert-on-conflict syntax, autoincrement column types).

mod mysql;
mod sqlite;

pub use self::mysql::MySqlDriver;
pub use self::sqlite::SqliteDriver;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    MySql(#[from] ::mysql::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseKind {
    Sqlite,
    MySql,
}

/// A single bind parameter. Everything user-supplied goes through one of
/// these; the store never splices values into SQL text.
#[derive(Debug, Clone)]
pub enum SqlValue {
    Text(String),
    Int(i64),
    Null,
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_owned())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Int(value)
    }
}

impl From<Option<i64>> for SqlValue {
    fn from(value: Option<i64>) -> Self {
        match value {
            Some(v) => SqlValue::Int(v),
            None => SqlValue::Null,
        }
    }
}

/// One result row. Cells are stringly typed; `None` is SQL NULL.
pub type Row = Vec<Option<String>>;

/// The polymorphic seam between the permission store and a concrete SQL
/// engine. Implementations are internally synchronized: concurrent calls
/// from different threads are serialized on the underlying connection.
///
/// Repeated schema bootstrap must succeed: drivers translate "duplicate
/// column", "already exists" and unique violations raised by an
/// insert-or-ignore statement into success. Every other SQL error
/// surfaces as [`DbError`].
pub trait DatabaseDriver: Send + Sync {
    fn kind(&self) -> DatabaseKind;

    fn execute(&self, sql: &str) -> Result<(), DbError>;
    fn query(&self, sql: &str) -> Result<Vec<Row>, DbError>;
    /// Returns the number of affected rows.
    fn execute_prepared(&self, sql: &str, params: &[SqlValue]) -> Result<u64, DbError>;
    fn query_prepared(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, DbError>;

    fn begin(&self) -> Result<(), DbError>;
    fn commit(&self) -> Result<(), DbError>;
    fn rollback(&self) -> Result<(), DbError>;

    fn create_table_sql(&self, table: &str, columns: &str) -> String {
        format!("CREATE TABLE IF NOT EXISTS {table} ({columns});")
    }

    fn add_column_sql(&self, table: &str, column: &str, definition: &str) -> String {
        format!("ALTER TABLE {table} ADD COLUMN {column} {definition};")
    }

    fn create_index_sql(&self, index: &str, table: &str, column: &str) -> String {
        format!("CREATE INDEX IF NOT EXISTS {index} ON {table} ({column});")
    }

    /// Insert that is a no-op when `conflict_columns` already hold the
    /// given key.
    fn insert_or_ignore_sql(
        &self,
        table: &str,
        columns: &str,
        values: &str,
        conflict_columns: &str,
    ) -> String;

    /// Column type clause for a monotonic integer primary key.
    fn autoincrement_pk(&self) -> &'static str;

    fn in_clause_placeholders(&self, count: usize) -> String {
        vec!["?"; count].join(", ")
    }
}

pub(crate) fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_ascii_lowercase().contains(needle)
}
