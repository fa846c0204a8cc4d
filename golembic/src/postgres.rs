//! # PostgreSQL engine provider
//!
//! Provides PostgreSQL support through the
//! [`postgres`](https://crates.io/crates/postgres) crate.
//!
//! PostgreSQL fully supports transactional DDL, so a failed migration rolls
//! back completely, metadata row included. Lock and statement timeouts are
//! not managed per-transaction; they ride the connection string as `-c`
//! server options, so every connection the pool opens is guarded the same
//! way.
//!
//! ## Timeouts
//!
//! `lock_timeout` and `statement_timeout` are rendered as an exact number of
//! milliseconds; a duration that does not divide evenly fails with
//! [`Error::DurationConversion`] rather than rounding silently.
//!
//! ```text
//! golembic=> SET lock_timeout TO '4000ms';
//! SET
//! golembic=> SHOW lock_timeout;
//!  lock_timeout
//! --------------
//!  4s
//! (1 row)
//! ```
//!
//! See:
//! - <https://www.postgresql.org/docs/current/runtime-config-client.html#GUC-LOCK-TIMEOUT>
//! - <https://www.postgresql.org/docs/current/runtime-config-client.html#GUC-STATEMENT-TIMEOUT>

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use parking_lot::Mutex;
use postgres::types::{ToSql, Type};

use crate::duration::to_round_duration;
use crate::error::Error;
use crate::provider::{CreateTableParameters, EngineProvider, TimeColumnPointer, TimestampColumn};
use crate::sql::{Connection, ConnectionPool, Row, Value};

/// The default database hostname, typically used when developing locally.
pub const DEFAULT_HOST: &str = "localhost";
/// The default PostgreSQL port.
pub const DEFAULT_PORT: u16 = 5432;
/// The default database to connect to; `postgres` avoids polluting the
/// template databases.
pub const DEFAULT_DATABASE: &str = "postgres";
/// The default schema.
pub const DEFAULT_SCHEMA: &str = "public";
/// The default timeout when attempting to acquire a lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(4);
/// The default timeout for a single SQL statement.
pub const DEFAULT_STATEMENT_TIMEOUT: Duration = Duration::from_secs(5);
/// The default number of idle connections kept by the pool.
pub const DEFAULT_IDLE_CONNECTIONS: usize = 16;
/// The default maximum number of open connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 32;

/// Connection config options for PostgreSQL.
#[derive(Debug, Clone)]
pub struct Config {
    /// A fully formed connection string; when set, all other connection
    /// fields are ignored.
    pub connection_string: Option<String>,
    pub host: String,
    pub port: u16,
    pub database: String,
    /// The application schema within the database.
    pub schema: String,
    pub username: String,
    pub password: String,
    /// The connection timeout, rendered in whole seconds.
    pub connect_timeout: Option<Duration>,
    /// The SSL mode for the connection (e.g. `disable`, `prefer`).
    pub ssl_mode: String,
    /// The timeout when attempting to acquire a lock; rendered in whole
    /// milliseconds into the connection options.
    pub lock_timeout: Duration,
    /// The timeout for a single SQL statement; rendered in whole
    /// milliseconds into the connection options.
    pub statement_timeout: Duration,
    /// How many idle connections the pool keeps around for reuse.
    pub idle_connections: usize,
    /// The maximum number of concurrently open connections.
    pub max_connections: usize,
    /// The maximum age of a pooled connection; zero disables the limit.
    pub max_lifetime: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connection_string: None,
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
            database: DEFAULT_DATABASE.to_owned(),
            schema: DEFAULT_SCHEMA.to_owned(),
            username: String::new(),
            password: String::new(),
            connect_timeout: None,
            ssl_mode: String::new(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            statement_timeout: DEFAULT_STATEMENT_TIMEOUT,
            idle_connections: DEFAULT_IDLE_CONNECTIONS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_lifetime: Duration::ZERO,
        }
    }
}

impl Config {
    /// Render the config as a key/value connection string. If a fully
    /// formed `connection_string` is set it is returned as is.
    pub fn connection_string(&self) -> Result<String, Error> {
        if let Some(connection_string) = &self.connection_string {
            return Ok(connection_string.clone());
        }

        let mut parts = vec![
            format!("host={}", quote_connection_value(&self.host)),
            format!("port={}", self.port),
            format!("dbname={}", quote_connection_value(&self.database)),
        ];
        if !self.username.is_empty() {
            parts.push(format!("user={}", quote_connection_value(&self.username)));
        }
        if !self.password.is_empty() {
            parts.push(format!(
                "password={}",
                quote_connection_value(&self.password)
            ));
        }
        if !self.ssl_mode.is_empty() {
            parts.push(format!("sslmode={}", self.ssl_mode));
        }
        if let Some(connect_timeout) = self.connect_timeout {
            let seconds = to_round_duration(connect_timeout, Duration::from_secs(1))?;
            parts.push(format!("connect_timeout={seconds}"));
        }

        let mut options = Vec::new();
        if !self.schema.is_empty() {
            options.push(format!("-c search_path={}", self.schema));
        }
        if !self.lock_timeout.is_zero() {
            let ms = to_round_duration(self.lock_timeout, Duration::from_millis(1))?;
            options.push(format!("-c lock_timeout={ms}ms"));
        }
        if !self.statement_timeout.is_zero() {
            let ms = to_round_duration(self.statement_timeout, Duration::from_millis(1))?;
            options.push(format!("-c statement_timeout={ms}ms"));
        }
        if !options.is_empty() {
            parts.push(format!(
                "options={}",
                quote_connection_value(&options.join(" "))
            ));
        }

        Ok(parts.join(" "))
    }
}

/// Quote a value for a key/value connection string: values with whitespace,
/// quotes or backslashes are wrapped in single quotes with backslash
/// escaping.
fn quote_connection_value(value: &str) -> String {
    let needs_quoting = value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || c == '\'' || c == '\\');
    if !needs_quoting {
        return value.to_owned();
    }
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// A PostgreSQL-specific database engine provider.
#[derive(Debug, Clone, Default)]
pub struct PostgresProvider {
    config: Config,
}

impl PostgresProvider {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl EngineProvider for PostgresProvider {
    /// The placeholder `$NNN` for a numbered parameter.
    fn query_parameter(&self, index: usize) -> String {
        format!("${index}")
    }

    fn create_table_parameters(&self) -> CreateTableParameters {
        CreateTableParameters::new().created_at("TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP")
    }

    fn timestamp_column(&self) -> Box<dyn TimestampColumn> {
        Box::new(TimeColumnPointer::default())
    }

    fn open(&self) -> Result<Box<dyn ConnectionPool>, Error> {
        Ok(Box::new(PostgresPool {
            connection_string: self.config.connection_string()?,
            state: Arc::new(Mutex::new(PoolState {
                idle: Vec::new(),
                open: 0,
            })),
            idle_connections: self.config.idle_connections,
            max_connections: self.config.max_connections,
            max_lifetime: self.config.max_lifetime,
        }))
    }

    fn table_exists_sql(&self) -> String {
        format!(
            "SELECT 1 FROM pg_catalog.pg_tables WHERE tablename = $1 AND schemaname = {}",
            self.quote_literal(&self.config.schema),
        )
    }
}

struct IdleConnection {
    client: postgres::Client,
    opened: Instant,
}

struct PoolState {
    idle: Vec<IdleConnection>,
    open: usize,
}

/// A small connection pool over [`postgres::Client`]: connections are opened
/// on demand (up to `max_connections`), and returned handles are kept for
/// reuse up to `idle_connections` / `max_lifetime`.
struct PostgresPool {
    connection_string: String,
    state: Arc<Mutex<PoolState>>,
    idle_connections: usize,
    max_connections: usize,
    max_lifetime: Duration,
}

impl PostgresPool {
    fn expired(&self, opened: Instant) -> bool {
        !self.max_lifetime.is_zero() && opened.elapsed() >= self.max_lifetime
    }
}

impl ConnectionPool for PostgresPool {
    fn connection(&mut self) -> Result<Box<dyn Connection>, Error> {
        let reused = {
            let mut state = self.state.lock();
            if state.open >= self.max_connections {
                return Err(Error::Generic(format!(
                    "connection pool exhausted; {} connections open",
                    state.open
                )));
            }

            let reused = loop {
                match state.idle.pop() {
                    Some(idle) if !self.expired(idle.opened) => break Some(idle),
                    Some(_expired) => continue,
                    None => break None,
                }
            };
            state.open += 1;
            reused
        };

        let (client, opened) = match reused {
            Some(idle) => (idle.client, idle.opened),
            None => match postgres::Client::connect(&self.connection_string, postgres::NoTls) {
                Ok(client) => (client, Instant::now()),
                Err(err) => {
                    self.state.lock().open -= 1;
                    return Err(err.into());
                }
            },
        };

        Ok(Box::new(PostgresConnection {
            client: Some(client),
            opened,
            state: Arc::clone(&self.state),
            idle_connections: self.idle_connections,
            max_lifetime: self.max_lifetime,
        }))
    }

    fn ping(&mut self) -> Result<(), Error> {
        let mut conn = self.connection()?;
        conn.query("SELECT 1", &[])?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.idle.clear();
        Ok(())
    }
}

struct PostgresConnection {
    client: Option<postgres::Client>,
    opened: Instant,
    state: Arc<Mutex<PoolState>>,
    idle_connections: usize,
    max_lifetime: Duration,
}

impl PostgresConnection {
    fn client(&mut self) -> Result<&mut postgres::Client, Error> {
        self.client
            .as_mut()
            .ok_or_else(|| Error::Generic("connection has been returned to the pool".to_owned()))
    }
}

impl Connection for PostgresConnection {
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, Error> {
        let client = self.client()?;
        if params.is_empty() {
            client.batch_execute(sql)?;
            return Ok(0);
        }

        let boxed = to_pg_params(params)?;
        let refs: Vec<&(dyn ToSql + Sync)> = boxed.iter().map(AsRef::as_ref).collect();
        Ok(client.execute(sql, &refs)?)
    }

    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, Error> {
        let client = self.client()?;
        let boxed = to_pg_params(params)?;
        let refs: Vec<&(dyn ToSql + Sync)> = boxed.iter().map(AsRef::as_ref).collect();

        let rows = client.query(sql, &refs)?;
        let mut result = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut columns = Vec::with_capacity(row.len());
            for index in 0..row.len() {
                columns.push(value_from_pg(row, index)?);
            }
            result.push(Row::new(columns));
        }
        Ok(result)
    }
}

impl Drop for PostgresConnection {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.open = state.open.saturating_sub(1);

        if let Some(client) = self.client.take() {
            let expired =
                !self.max_lifetime.is_zero() && self.opened.elapsed() >= self.max_lifetime;
            if !expired && state.idle.len() < self.idle_connections {
                state.idle.push(IdleConnection {
                    client,
                    opened: self.opened,
                });
            }
        }
    }
}

fn to_pg_params(params: &[Value]) -> Result<Vec<Box<dyn ToSql + Sync>>, Error> {
    params
        .iter()
        .map(|value| -> Result<Box<dyn ToSql + Sync>, Error> {
            Ok(match value {
                Value::Null => Box::new(Option::<String>::None),
                // The metadata table's integer column is INT4; larger values
                // have nowhere to go.
                Value::Integer(value) => Box::new(i32::try_from(*value).map_err(|_| {
                    Error::Generic(format!("integer parameter out of range: {value}"))
                })?),
                Value::Text(text) => Box::new(text.clone()),
                Value::Timestamp(stored) => Box::new(*stored),
            })
        })
        .collect()
}

fn value_from_pg(row: &postgres::Row, index: usize) -> Result<Value, Error> {
    let ty = row.columns()[index].type_();

    if *ty == Type::INT2 {
        let value: Option<i16> = row.try_get(index)?;
        return Ok(value.map_or(Value::Null, |v| Value::Integer(i64::from(v))));
    }
    if *ty == Type::INT4 {
        let value: Option<i32> = row.try_get(index)?;
        return Ok(value.map_or(Value::Null, |v| Value::Integer(i64::from(v))));
    }
    if *ty == Type::INT8 {
        let value: Option<i64> = row.try_get(index)?;
        return Ok(value.map_or(Value::Null, Value::Integer));
    }
    if *ty == Type::TEXT || *ty == Type::VARCHAR || *ty == Type::BPCHAR || *ty == Type::NAME {
        let value: Option<String> = row.try_get(index)?;
        return Ok(value.map_or(Value::Null, Value::Text));
    }
    if *ty == Type::TIMESTAMPTZ {
        let value: Option<DateTime<Utc>> = row.try_get(index)?;
        return Ok(value.map_or(Value::Null, Value::Timestamp));
    }
    if *ty == Type::TIMESTAMP {
        let value: Option<NaiveDateTime> = row.try_get(index)?;
        return Ok(value.map_or(Value::Null, |v| {
            Value::Timestamp(Utc.from_utc_datetime(&v))
        }));
    }

    Err(Error::Generic(format!(
        "unsupported PostgreSQL column type: {ty}"
    )))
}
