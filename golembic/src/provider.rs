//! The engine provider contract.
//!
//! A provider is a capability bundle: quoting, placeholder syntax, the
//! engine-specific pieces of the metadata-table DDL, timestamp decoding and
//! connection-pool construction. The manager and sequence logic stay
//! engine-agnostic by going through this trait; implementations are selected
//! by construction, never by subclassing.

use chrono::{DateTime, Utc};

use crate::error::Error;
use crate::quote;
use crate::sql::{ConnectionPool, Value};

/// The interface required of a database engine.
pub trait EngineProvider {
    /// Placeholder for the 1-based positional parameter `index`, e.g. `$1`,
    /// `?` or `?1`.
    fn query_parameter(&self, index: usize) -> String;

    /// Column types and constraint strategy for the `CREATE TABLE` statement
    /// used to create the metadata table.
    fn create_table_parameters(&self) -> CreateTableParameters;

    /// A fresh value for reading the `created_at` column.
    fn timestamp_column(&self) -> Box<dyn TimestampColumn>;

    /// Quote an identifier, such as a table name, for usage in a query.
    fn quote_identifier(&self, name: &str) -> String {
        quote::quote_identifier(name)
    }

    /// Quote a literal, such as `2023-01-05 15:00:00Z`, for usage in a query.
    fn quote_literal(&self, literal: &str) -> String {
        quote::quote_literal(literal)
    }

    /// Construct a fresh connection pool, applying the sizing carried in the
    /// provider's configuration.
    fn open(&self) -> Result<Box<dyn ConnectionPool>, Error>;

    /// A query returning one row (any integer) iff the table named by the
    /// single bound parameter exists in the provider's current schema.
    fn table_exists_sql(&self) -> String;
}

/// Engine-specific pieces of the `CREATE TABLE` statement for the metadata
/// table.
///
/// Engines that support `ALTER TABLE ... ADD CONSTRAINT` use plain column
/// types and get their constraints from follow-up statements; engines that
/// do not (SQLite) carry the constraints inline in the column types and in
/// the `constraints` fragment.
#[derive(Debug, Clone)]
pub struct CreateTableParameters {
    pub serial_id: String,
    pub revision: String,
    pub previous: String,
    pub created_at: String,
    /// Extra SQL spliced into the `CREATE TABLE` body after the column list.
    /// The token `{table}` is replaced with the quoted metadata-table name,
    /// which self-referential foreign keys need.
    pub constraints: String,
    /// When true, no `ALTER TABLE … ADD CONSTRAINT` statements are issued.
    pub skip_constraint_statements: bool,
}

const INLINE_CONSTRAINTS: &str = ",
  FOREIGN KEY (previous) REFERENCES {table} (revision),
  CHECK (
    (serial_id = 0 AND previous IS NULL) OR
    (serial_id != 0 AND previous IS NOT NULL)
  )";

impl CreateTableParameters {
    /// Column defaults for engines where constraints are added via separate
    /// `ALTER TABLE` statements.
    pub fn new() -> Self {
        Self {
            serial_id: "INTEGER NOT NULL".to_owned(),
            revision: "VARCHAR(32) NOT NULL".to_owned(),
            previous: "VARCHAR(32)".to_owned(),
            created_at: String::new(),
            constraints: String::new(),
            skip_constraint_statements: false,
        }
    }

    /// Column defaults for engines where every constraint must be inlined in
    /// the `CREATE TABLE` body.
    pub fn new_inline() -> Self {
        Self {
            serial_id: "INTEGER NOT NULL UNIQUE CHECK (serial_id >= 0)".to_owned(),
            revision: "VARCHAR(32) NOT NULL PRIMARY KEY".to_owned(),
            previous: "VARCHAR(32) UNIQUE CHECK (previous != revision)".to_owned(),
            created_at: String::new(),
            constraints: INLINE_CONSTRAINTS.to_owned(),
            skip_constraint_statements: true,
        }
    }

    /// Set the `created_at` column type, including the engine's
    /// "default = now" expression.
    pub fn created_at(mut self, expression: impl Into<String>) -> Self {
        self.created_at = expression.into();
        self
    }
}

impl Default for CreateTableParameters {
    fn default() -> Self {
        Self::new()
    }
}

/// An abstract column that stores a timestamp.
///
/// Engines differ on whether a timestamp column scans naturally into a
/// native time value; SQLite stores an integer count of microseconds since
/// the epoch. The two methods (scan a raw column value, then read the
/// decoded timestamp) keep that difference out of the manager.
pub trait TimestampColumn {
    fn scan(&mut self, value: &Value) -> Result<(), Error>;
    fn timestamp(&self) -> DateTime<Utc>;
}

/// The default [`TimestampColumn`], for engines whose timestamps arrive
/// already decoded as [`Value::Timestamp`].
#[derive(Debug, Clone, Copy)]
pub struct TimeColumnPointer {
    stored: DateTime<Utc>,
}

impl Default for TimeColumnPointer {
    fn default() -> Self {
        Self {
            stored: DateTime::UNIX_EPOCH,
        }
    }
}

impl TimestampColumn for TimeColumnPointer {
    fn scan(&mut self, value: &Value) -> Result<(), Error> {
        match value {
            Value::Null => {
                self.stored = DateTime::UNIX_EPOCH;
                Ok(())
            }
            Value::Timestamp(stored) => {
                self.stored = *stored;
                Ok(())
            }
            other => Err(Error::Generic(format!(
                "expected a timestamp column value, got {other:?}"
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
    fn alter_table_defaults() {
        let ctp = CreateTableParameters::new().created_at("TIMESTAMPTZ");
        assert_eq!(ctp.serial_id, "INTEGER NOT NULL");
        assert_eq!(ctp.revision, "VARCHAR(32) NOT NULL");
        assert_eq!(ctp.previous, "VARCHAR(32)");
        assert_eq!(ctp.created_at, "TIMESTAMPTZ");
        assert!(ctp.constraints.is_empty());
        assert!(!ctp.skip_constraint_statements);
    }

    #[test]
    fn inline_defaults_carry_constraints() {
        let ctp = CreateTableParameters::new_inline();
        assert!(ctp.skip_constraint_statements);
        assert!(ctp.serial_id.contains("CHECK (serial_id >= 0)"));
        assert!(ctp.revision.contains("PRIMARY KEY"));
        assert!(ctp.previous.contains("UNIQUE"));
        assert!(ctp.constraints.contains("FOREIGN KEY (previous)"));
        assert!(ctp.constraints.contains("{table}"));
    }

    #[test]
    fn time_column_pointer_scans_timestamps() {
        let now = Utc::now();
        let mut column = TimeColumnPointer::default();
        column.scan(&Value::Timestamp(now)).unwrap();
        assert_eq!(column.timestamp(), now);

        let err = column.scan(&Value::Text("2023-01-05".to_owned())).unwrap_err();
        assert!(matches!(err, Error::Generic(_)));
    }
}
