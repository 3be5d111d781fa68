use crate::{contains_ignore_case, DatabaseDriver, DatabaseKind, DbError, Row, SqlValue};
use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::{params_from_iter, Connection, ToSql};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// SQLite dialect over a single [`rusqlite::Connection`].
///
/// The connection is opened with `foreign_keys = ON` so the schema's
/// `ON DELETE CASCADE` edges actually fire.
pub struct SqliteDriver {
    conn: Mutex<Connection>,
}

impl SqliteDriver {
    pub fn open(path: &str) -> Result<Self, DbError> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Private in-memory database, used by the test suites.
    pub fn open_in_memory() -> Result<Self, DbError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, DbError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(SqliteDriver {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            SqlValue::Int(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
        })
    }
}

fn cell_to_string(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(t) => Some(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Some(String::from_utf8_lossy(b).into_owned()),
    }
}

fn is_idempotent_failure(sql: &str, message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    (message.contains("duplicate column name") && contains_ignore_case(sql, "alter table"))
        || (message.contains("already exists")
            && (contains_ignore_case(sql, "create table")
                || contains_ignore_case(sql, "create index")))
        || (message.contains("unique constraint failed")
            && contains_ignore_case(sql, "on conflict"))
}

impl DatabaseDriver for SqliteDriver {
    fn kind(&self) -> DatabaseKind {
        DatabaseKind::Sqlite
    }

    fn execute(&self, sql: &str) -> Result<(), DbError> {
        let conn = self.lock();
        match conn.execute_batch(sql) {
            Ok(()) => Ok(()),
            Err(err) if is_idempotent_failure(sql, &err.to_string()) => {
                warn!("sqlite: ignored idempotent failure: {err}");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn query(&self, sql: &str) -> Result<Vec<Row>, DbError> {
        self.query_prepared(sql, &[])
    }

    fn execute_prepared(&self, sql: &str, params: &[SqlValue]) -> Result<u64, DbError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(sql)?;
        match stmt.execute(params_from_iter(params.iter())) {
            Ok(affected) => Ok(affected as u64),
            Err(err) if is_idempotent_failure(sql, &err.to_string()) => {
                debug!("sqlite: ignored idempotent failure: {err}");
                Ok(0)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn query_prepared(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, DbError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(sql)?;
        let columns = stmt.column_count();
        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut cells = Vec::with_capacity(columns);
            for i in 0..columns {
                cells.push(cell_to_string(row.get_ref(i)?));
            }
            out.push(cells);
        }
        Ok(out)
    }

    fn begin(&self) -> Result<(), DbError> {
        self.execute("BEGIN TRANSACTION;")
    }

    fn commit(&self) -> Result<(), DbError> {
        self.execute("COMMIT;")
    }

    fn rollback(&self) -> Result<(), DbError> {
        self.execute("ROLLBACK;")
    }

    fn insert_or_ignore_sql(
        &self,
        table: &str,
        columns: &str,
        values: &str,
        conflict_columns: &str,
    ) -> String {
        format!(
            "INSERT INTO {table} ({columns}) VALUES ({values}) \
             ON CONFLICT ({conflict_columns}) DO NOTHING;"
        )
    }

    fn autoincrement_pk(&self) -> &'static str {
        "INTEGER PRIMARY KEY AUTOINCREMENT"
    }
}
