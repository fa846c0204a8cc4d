//! # MySQL engine provider
//!
//! Provides MySQL support through the
//! [`mysql`](https://crates.io/crates/mysql) crate.
//!
//! **Note on DDL**: MySQL DDL statements cause an implicit commit and cannot
//! be rolled back. A migration body that fails partway through may leave
//! schema changes behind; the metadata row is only written when the body
//! succeeds, so fixing the issue and re-running is the recovery path. Keep
//! MySQL migrations small and idempotent (`IF EXISTS` / `IF NOT EXISTS`).
//!
//! Identifier quoting uses backticks; pool sizing maps onto the driver's
//! own [`mysql::PoolConstraints`].

use chrono::{Datelike, NaiveDate, TimeZone, Timelike, Utc};
use mysql::prelude::Queryable;

use crate::error::Error;
use crate::provider::{CreateTableParameters, EngineProvider, TimeColumnPointer, TimestampColumn};
use crate::sql::{Connection, ConnectionPool, Row, Value};

/// The default database hostname.
pub const DEFAULT_HOST: &str = "localhost";
/// The default MySQL port.
pub const DEFAULT_PORT: u16 = 3306;
/// The default number of connections the pool keeps open.
pub const DEFAULT_IDLE_CONNECTIONS: usize = 2;
/// The default maximum number of connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 16;

/// Connection config options for MySQL.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    /// The lower bound of the driver pool's constraints.
    pub idle_connections: usize,
    /// The upper bound of the driver pool's constraints.
    pub max_connections: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
            database: String::new(),
            username: String::new(),
            password: String::new(),
            idle_connections: DEFAULT_IDLE_CONNECTIONS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

/// A MySQL-specific database engine provider.
#[derive(Debug, Clone, Default)]
pub struct MysqlProvider {
    config: Config,
}

impl MysqlProvider {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn opts(&self) -> Result<mysql::Opts, Error> {
        let constraints =
            mysql::PoolConstraints::new(self.config.idle_connections, self.config.max_connections)
                .ok_or_else(|| {
                    Error::Generic(format!(
                        "invalid pool sizing; idle {} exceeds max {}",
                        self.config.idle_connections, self.config.max_connections,
                    ))
                })?;

        let builder = mysql::OptsBuilder::new()
            .ip_or_hostname(Some(self.config.host.clone()))
            .tcp_port(self.config.port)
            .db_name(non_empty(&self.config.database))
            .user(non_empty(&self.config.username))
            .pass(non_empty(&self.config.password))
            .pool_opts(mysql::PoolOpts::default().with_constraints(constraints));

        Ok(builder.into())
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_owned())
    }
}

impl EngineProvider for MysqlProvider {
    /// MySQL placeholders are positional and unnumbered.
    fn query_parameter(&self, _index: usize) -> String {
        "?".to_owned()
    }

    fn create_table_parameters(&self) -> CreateTableParameters {
        CreateTableParameters::new()
            .created_at("TIMESTAMP(6) NOT NULL DEFAULT CURRENT_TIMESTAMP(6)")
    }

    fn timestamp_column(&self) -> Box<dyn TimestampColumn> {
        Box::new(TimeColumnPointer::default())
    }

    /// Backtick quoting, truncated at the first NUL, with embedded backticks
    /// escaped by doubling.
    fn quote_identifier(&self, name: &str) -> String {
        let name = match name.find('\u{0}') {
            Some(end) => &name[..end],
            None => name,
        };
        format!("`{}`", name.replace('`', "``"))
    }

    fn open(&self) -> Result<Box<dyn ConnectionPool>, Error> {
        let pool = mysql::Pool::new(self.opts()?)?;
        Ok(Box::new(MysqlPool { pool }))
    }

    fn table_exists_sql(&self) -> String {
        format!(
            "SELECT 1 FROM information_schema.tables WHERE table_name = ? AND table_schema = {}",
            self.quote_literal(&self.config.database),
        )
    }
}

struct MysqlPool {
    pool: mysql::Pool,
}

impl ConnectionPool for MysqlPool {
    fn connection(&mut self) -> Result<Box<dyn Connection>, Error> {
        Ok(Box::new(MysqlConnection {
            conn: self.pool.get_conn()?,
        }))
    }

    fn ping(&mut self) -> Result<(), Error> {
        let mut conn = self.pool.get_conn()?;
        conn.query_drop("SELECT 1")?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        // The driver pool disconnects when its last clone is dropped.
        Ok(())
    }
}

struct MysqlConnection {
    conn: mysql::PooledConn,
}

impl Connection for MysqlConnection {
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, Error> {
        let result = if params.is_empty() {
            self.conn.query_iter(sql)?
        } else {
            self.conn.exec_iter(sql, to_mysql_params(params))?
        };
        Ok(result.affected_rows())
    }

    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, Error> {
        let rows: Vec<mysql::Row> = if params.is_empty() {
            self.conn.query(sql)?
        } else {
            self.conn.exec(sql, to_mysql_params(params))?
        };

        let mut result = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut columns = Vec::with_capacity(row.len());
            for index in 0..row.len() {
                let value = row.as_ref(index).ok_or_else(|| {
                    Error::Generic(format!("row has no column {index}"))
                })?;
                columns.push(from_mysql_value(value)?);
            }
            result.push(Row::new(columns));
        }
        Ok(result)
    }
}

fn to_mysql_params(params: &[Value]) -> mysql::Params {
    if params.is_empty() {
        return mysql::Params::Empty;
    }

    mysql::Params::Positional(
        params
            .iter()
            .map(|value| match value {
                Value::Null => mysql::Value::NULL,
                Value::Integer(value) => mysql::Value::Int(*value),
                Value::Text(text) => mysql::Value::Bytes(text.clone().into_bytes()),
                Value::Timestamp(stored) => mysql::Value::Date(
                    stored.year() as u16,
                    stored.month() as u8,
                    stored.day() as u8,
                    stored.hour() as u8,
                    stored.minute() as u8,
                    stored.second() as u8,
                    stored.timestamp_subsec_micros(),
                ),
            })
            .collect(),
    )
}

fn from_mysql_value(value: &mysql::Value) -> Result<Value, Error> {
    match value {
        mysql::Value::NULL => Ok(Value::Null),
        mysql::Value::Int(value) => Ok(Value::Integer(*value)),
        mysql::Value::UInt(value) => i64::try_from(*value)
            .map(Value::Integer)
            .map_err(|_| Error::Generic(format!("integer column out of range: {value}"))),
        mysql::Value::Bytes(bytes) => Ok(Value::Text(String::from_utf8_lossy(bytes).into_owned())),
        mysql::Value::Date(year, month, day, hour, minute, second, micros) => {
            let naive = NaiveDate::from_ymd_opt(i32::from(*year), u32::from(*month), u32::from(*day))
                .and_then(|date| {
                    date.and_hms_micro_opt(
                        u32::from(*hour),
                        u32::from(*minute),
                        u32::from(*second),
                        *micros,
                    )
                })
                .ok_or_else(|| {
                    Error::Generic(format!(
                        "invalid timestamp column: {year}-{month}-{day} {hour}:{minute}:{second}.{micros}"
                    ))
                })?;
            Ok(Value::Timestamp(Utc.from_utc_datetime(&naive)))
        }
        other => Err(Error::Generic(format!(
            "unsupported MySQL column value: {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_parameter_is_unnumbered() {
        let provider = MysqlProvider::default();
        assert_eq!(provider.query_parameter(1), "?");
        assert_eq!(provider.query_parameter(3), "?");
    }

    #[test]
    fn identifiers_use_backticks() {
        let provider = MysqlProvider::default();
        assert_eq!(provider.quote_identifier("a`b"), "`a``b`");
        assert_eq!(provider.quote_identifier("x\u{0}y"), "`x`");
    }

    #[test]
    fn table_exists_probe_is_database_scoped() {
        let provider = MysqlProvider::new(Config {
            database: "app".to_owned(),
            ..Config::default()
        });
        assert_eq!(
            provider.table_exists_sql(),
            "SELECT 1 FROM information_schema.tables WHERE table_name = ? AND table_schema = 'app'",
        );
    }

    #[test]
    fn created_at_uses_microsecond_timestamps() {
        let provider = MysqlProvider::default();
        let ctp = provider.create_table_parameters();
        assert_eq!(
            ctp.created_at,
            "TIMESTAMP(6) NOT NULL DEFAULT CURRENT_TIMESTAMP(6)"
        );
        assert!(!ctp.skip_constraint_statements);
    }

    #[test]
    fn date_values_decode_to_utc() {
        let value = mysql::Value::Date(2023, 1, 5, 15, 0, 0, 250_000);
        let decoded = from_mysql_value(&value).unwrap();
        match decoded {
            Value::Timestamp(stored) => {
                assert_eq!(stored.to_rfc3339(), "2023-01-05T15:00:00.250+00:00");
            }
            other => panic!("expected a timestamp, got {other:?}"),
        }
    }

    #[test]
    fn invalid_pool_sizing_is_rejected() {
        let provider = MysqlProvider::new(Config {
            idle_connections: 10,
            max_connections: 2,
            ..Config::default()
        });
        assert!(matches!(provider.opts(), Err(Error::Generic(_))));
    }
}
