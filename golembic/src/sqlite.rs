//! # SQLite engine provider
//!
//! Provides SQLite support through the
//! [`rusqlite`](https://crates.io/crates/rusqlite) crate.
//!
//! Two SQLite quirks shape this module:
//!
//! - SQLite has no `ALTER TABLE … ADD CONSTRAINT`, so every metadata-table
//!   constraint is inlined in the `CREATE TABLE` body
//!   ([`CreateTableParameters::new_inline`]).
//! - SQLite has no real timestamp type; `created_at` is stored as an
//!   `INTEGER` number of microseconds (UTC) since the epoch, with the
//!   default computed from `julianday('now')`, and decoded through
//!   [`TimeFromInteger`].
//!
//! The "pool" for this engine is a single shared connection. An in-memory
//! database exists only as long as its connection, so every handle the pool
//! gives out must alias the same underlying connection; this also means a
//! non-transactional migration body shares the session of the metadata
//! transaction. With an in-memory database this provider doubles as the
//! engine used by the test suite.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::ValueRef;

use crate::error::Error;
use crate::provider::{CreateTableParameters, EngineProvider, TimestampColumn};
use crate::sql::{Connection, ConnectionPool, Row, Value};

/// The default data source, an in-memory database.
pub const DEFAULT_DATA_SOURCE_NAME: &str = ":memory:";

/// Connection config options for SQLite.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the database file, or `:memory:`.
    pub data_source_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_source_name: DEFAULT_DATA_SOURCE_NAME.to_owned(),
        }
    }
}

/// A SQLite-specific database engine provider.
#[derive(Debug, Clone, Default)]
pub struct SqliteProvider {
    config: Config,
    shared: Option<Arc<Mutex<rusqlite::Connection>>>,
}

impl SqliteProvider {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            shared: None,
        }
    }

    /// Build a provider around an already-open connection. Every pool this
    /// provider opens hands out handles onto that connection, which lets an
    /// embedding application (or a test) inspect the database the manager is
    /// operating on.
    pub fn from_shared(conn: Arc<Mutex<rusqlite::Connection>>) -> Self {
        Self {
            config: Config::default(),
            shared: Some(conn),
        }
    }
}

impl EngineProvider for SqliteProvider {
    /// The placeholder `?NNN` for a numbered parameter.
    ///
    /// See: <https://sqlite.org/lang_expr.html#parameters>
    fn query_parameter(&self, index: usize) -> String {
        format!("?{index}")
    }

    fn create_table_parameters(&self) -> CreateTableParameters {
        // Microseconds since the epoch, computed from the julian day.
        // H/T: https://stackoverflow.com/a/3693112/1068170
        CreateTableParameters::new_inline().created_at(
            "INTEGER DEFAULT (CAST((julianday('now') - 2440587.5) * 86400.0 * 1000000 AS INTEGER))",
        )
    }

    fn timestamp_column(&self) -> Box<dyn TimestampColumn> {
        Box::new(TimeFromInteger::default())
    }

    fn open(&self) -> Result<Box<dyn ConnectionPool>, Error> {
        let conn = match &self.shared {
            Some(conn) => Arc::clone(conn),
            None => {
                let conn = rusqlite::Connection::open(&self.config.data_source_name)?;
                Arc::new(Mutex::new(conn))
            }
        };
        conn.lock().execute_batch("PRAGMA foreign_keys = ON")?;

        Ok(Box::new(SqlitePool { conn }))
    }

    /// See:
    /// <https://www.sqlite.org/fileformat2.html#storage_of_the_sql_database_schema>
    fn table_exists_sql(&self) -> String {
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1".to_owned()
    }
}

/// A pool of handles onto one shared SQLite connection.
struct SqlitePool {
    conn: Arc<Mutex<rusqlite::Connection>>,
}

impl ConnectionPool for SqlitePool {
    fn connection(&mut self) -> Result<Box<dyn Connection>, Error> {
        Ok(Box::new(SqliteConnection {
            conn: Arc::clone(&self.conn),
        }))
    }

    fn ping(&mut self) -> Result<(), Error> {
        self.conn
            .lock()
            .query_row("SELECT 1", [], |_| Ok(()))
            .map_err(Error::from)
    }

    fn close(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

struct SqliteConnection {
    conn: Arc<Mutex<rusqlite::Connection>>,
}

impl Connection for SqliteConnection {
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, Error> {
        let conn = self.conn.lock();
        if params.is_empty() {
            conn.execute_batch(sql)?;
            Ok(conn.changes())
        } else {
            let count = conn.execute(
                sql,
                rusqlite::params_from_iter(params.iter().map(to_sqlite_value)),
            )?;
            Ok(count as u64)
        }
    }

    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let column_count = stmt.column_count();

        let mut rows = stmt.query(rusqlite::params_from_iter(
            params.iter().map(to_sqlite_value),
        ))?;
        let mut result = Vec::new();
        while let Some(row) = rows.next()? {
            let mut columns = Vec::with_capacity(column_count);
            for index in 0..column_count {
                columns.push(match row.get_ref(index)? {
                    ValueRef::Null => Value::Null,
                    ValueRef::Integer(value) => Value::Integer(value),
                    ValueRef::Text(text) => {
                        Value::Text(String::from_utf8_lossy(text).into_owned())
                    }
                    other => {
                        return Err(Error::Generic(format!(
                            "unsupported SQLite column value: {other:?}"
                        )))
                    }
                });
            }
            result.push(Row::new(columns));
        }

        Ok(result)
    }
}

fn to_sqlite_value(value: &Value) -> rusqlite::types::Value {
    match value {
        Value::Null => rusqlite::types::Value::Null,
        Value::Integer(value) => rusqlite::types::Value::Integer(*value),
        Value::Text(text) => rusqlite::types::Value::Text(text.clone()),
        Value::Timestamp(stored) => rusqlite::types::Value::Integer(stored.timestamp_micros()),
    }
}

/// A timestamp stored as an `INTEGER` number of microseconds (UTC) since the
/// epoch.
///
/// This is necessary because SQLite does not have rich timestamp support and
/// drivers cannot paper over it.
#[derive(Debug, Clone, Copy)]
pub struct TimeFromInteger {
    stored: DateTime<Utc>,
}

impl Default for TimeFromInteger {
    fn default() -> Self {
        Self {
            stored: DateTime::UNIX_EPOCH,
        }
    }
}

impl TimestampColumn for TimeFromInteger {
    fn scan(&mut self, value: &Value) -> Result<(), Error> {
        match value {
            Value::Null => {
                self.stored = DateTime::UNIX_EPOCH;
                Ok(())
            }
            Value::Integer(micros) => {
                let seconds = micros.div_euclid(1_000_000);
                let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
                self.stored = DateTime::from_timestamp(seconds, nanos).ok_or_else(|| {
                    Error::Generic(format!("timestamp out of range: {micros} microseconds"))
                })?;
                Ok(())
            }
            other => Err(Error::Generic(format!(
                "expected an INTEGER timestamp column, got {other:?}"
            ))),
        }
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.stored
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_parameters_are_numbered() {
        let provider = SqliteProvider::default();
        assert_eq!(provider.query_parameter(1), "?1");
        assert_eq!(provider.query_parameter(3), "?3");
    }

    #[test]
    fn constraints_are_inlined() {
        let provider = SqliteProvider::default();
        let ctp = provider.create_table_parameters();
        assert!(ctp.skip_constraint_statements);
        assert!(ctp.created_at.contains("julianday"));
    }

    #[test]
    fn time_from_integer_round_trips() {
        let stored = Utc::now();
        // The column only holds microsecond precision.
        let micros = stored.timestamp_micros();

        let mut column = TimeFromInteger::default();
        column.scan(&Value::Integer(micros)).unwrap();
        assert_eq!(column.timestamp().timestamp_micros(), micros);
    }

    #[test]
    fn time_from_integer_rejects_text() {
        let mut column = TimeFromInteger::default();
        let err = column.scan(&Value::Text("now".to_owned())).unwrap_err();
        assert!(matches!(err, Error::Generic(_)));
    }

    #[test]
    fn pool_shares_one_connection() {
        let conn = Arc::new(Mutex::new(rusqlite::Connection::open_in_memory().unwrap()));
        let provider = SqliteProvider::from_shared(Arc::clone(&conn));

        let mut pool = provider.open().unwrap();
        let mut first = pool.connection().unwrap();
        first
            .execute("CREATE TABLE t (id INTEGER PRIMARY KEY)", &[])
            .unwrap();

        // A second handle sees the same database.
        let mut second = pool.connection().unwrap();
        let rows = second
            .query(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                &[Value::Text("t".to_owned())],
            )
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn default_column_default_populates_created_at() {
        let conn = Arc::new(Mutex::new(rusqlite::Connection::open_in_memory().unwrap()));
        let provider = SqliteProvider::from_shared(Arc::clone(&conn));
        let ctp = provider.create_table_parameters();

        conn.lock()
            .execute_batch(&format!("CREATE TABLE stamps (id INTEGER, at {})", ctp.created_at))
            .unwrap();
        conn.lock()
            .execute_batch("INSERT INTO stamps (id) VALUES (1)")
            .unwrap();

        let micros: i64 = conn
            .lock()
            .query_row("SELECT at FROM stamps", [], |row| row.get(0))
            .unwrap();

        let mut column = provider.timestamp_column();
        column.scan(&Value::Integer(micros)).unwrap();
        let decoded = column.timestamp();
        let drift = (Utc::now() - decoded).num_seconds().abs();
        assert!(drift < 5, "decoded {decoded} drifted {drift}s from now");
    }
}
