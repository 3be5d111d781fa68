use crate::{contains_ignore_case, DatabaseDriver, DatabaseKind, DbError, Row, SqlValue};
use ::mysql::prelude::Queryable;
use ::mysql::{Conn, Error as MySqlError, OptsBuilder, Params, Row as MySqlRow, Value};
use std::sync::{Mutex, MutexGuard};
use tracing::warn;

// MySQL server error codes the bootstrap path may legitimately hit.
const ER_DUP_FIELDNAME: u16 = 1060;
const ER_DUP_KEYNAME: u16 = 1061;
const ER_DUP_ENTRY: u16 = 1062;
const ER_TABLE_EXISTS: u16 = 1050;

/// MySQL dialect over a single connection.
pub struct MySqlDriver {
    conn: Mutex<Conn>,
}

impl MySqlDriver {
    pub fn connect(opts: OptsBuilder) -> Result<Self, DbError> {
        Ok(MySqlDriver {
            conn: Mutex::new(Conn::new(opts)?),
        })
    }

    pub fn connect_with(
        host: &str,
        port: u16,
        user: &str,
        password: &str,
        database: &str,
    ) -> Result<Self, DbError> {
        let opts = OptsBuilder::new()
            .ip_or_hostname(Some(host))
            .tcp_port(port)
            .user(Some(user))
            .pass(Some(password))
            .db_name(Some(database));
        Self::connect(opts)
    }

    fn lock(&self) -> MutexGuard<'_, Conn> {
        self.conn.lock().unwrap()
    }
}

fn bind(params: &[SqlValue]) -> Params {
    if params.is_empty() {
        return Params::Empty;
    }
    Params::Positional(
        params
            .iter()
            .map(|p| match p {
                SqlValue::Text(s) => Value::Bytes(s.clone().into_bytes()),
                SqlValue::Int(i) => Value::Int(*i),
                SqlValue::Null => Value::NULL,
            })
            .collect(),
    )
}

fn cell_to_string(value: Value) -> Option<String> {
    match value {
        Value::NULL => None,
        Value::Bytes(b) => Some(String::from_utf8_lossy(&b).into_owned()),
        Value::Int(i) => Some(i.to_string()),
        Value::UInt(u) => Some(u.to_string()),
        Value::Float(f) => Some(f.to_string()),
        Value::Double(d) => Some(d.to_string()),
        other => Some(other.as_sql(true)),
    }
}

fn is_idempotent_failure(sql: &str, err: &MySqlError) -> bool {
    let MySqlError::MySqlError(server_err) = err else {
        return false;
    };
    match server_err.code {
        ER_DUP_FIELDNAME => contains_ignore_case(sql, "add column"),
        ER_DUP_KEYNAME => contains_ignore_case(sql, "create index"),
        ER_TABLE_EXISTS => contains_ignore_case(sql, "create table"),
        ER_DUP_ENTRY => contains_ignore_case(sql, "insert ignore"),
        _ => false,
    }
}

impl DatabaseDriver for MySqlDriver {
    fn kind(&self) -> DatabaseKind {
        DatabaseKind::MySql
    }

    fn execute(&self, sql: &str) -> Result<(), DbError> {
        let mut conn = self.lock();
        match conn.query_drop(sql) {
            Ok(()) => Ok(()),
            Err(err) if is_idempotent_failure(sql, &err) => {
                warn!("mysql: ignored idempotent failure: {err}");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn query(&self, sql: &str) -> Result<Vec<Row>, DbError> {
        let mut conn = self.lock();
        let rows: Vec<MySqlRow> = conn.query(sql)?;
        Ok(rows
            .into_iter()
            .map(|row| row.unwrap().into_iter().map(cell_to_string).collect())
            .collect())
    }

    fn execute_prepared(&self, sql: &str, params: &[SqlValue]) -> Result<u64, DbError> {
        let mut conn = self.lock();
        match conn.exec_drop(sql, bind(params)) {
            Ok(()) => Ok(conn.affected_rows()),
            Err(err) if is_idempotent_failure(sql, &err) => {
                warn!("mysql: ignored idempotent failure: {err}");
                Ok(0)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn query_prepared(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, DbError> {
        let mut conn = self.lock();
        let rows: Vec<MySqlRow> = conn.exec(sql, bind(params))?;
        Ok(rows
            .into_iter()
            .map(|row| row.unwrap().into_iter().map(cell_to_string).collect())
            .collect())
    }

    fn begin(&self) -> Result<(), DbError> {
        self.execute("START TRANSACTION;")
    }

    fn commit(&self) -> Result<(), DbError> {
        self.execute("COMMIT;")
    }

    fn rollback(&self) -> Result<(), DbError> {
        self.execute("ROLLBACK;")
    }

    // MySQL has no CREATE INDEX IF NOT EXISTS; re-creation raises
    // ER_DUP_KEYNAME, which execute() treats as success.
    fn create_index_sql(&self, index: &str, table: &str, column: &str) -> String {
        format!("CREATE INDEX {index} ON {table} ({column});")
    }

    fn insert_or_ignore_sql(
        &self,
        table: &str,
        columns: &str,
        values: &str,
        _conflict_columns: &str,
    ) -> String {
        format!("INSERT IGNORE INTO {table} ({columns}) VALUES ({values});")
    }

    fn autoincrement_pk(&self) -> &'static str {
        "INT AUTO_INCREMENT PRIMARY KEY"
    }
}
