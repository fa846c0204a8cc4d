//! The narrow data plane shared by every engine.
//!
//! The manager only ever runs a handful of statement shapes against the
//! metadata table, so the uniform interface each engine must provide is
//! small: execute a statement, run a query returning [`Row`]s of [`Value`]s,
//! and hand out connections from a pool. Transactions are managed here, on
//! top of [`Connection`], so engines do not each reimplement them.

use crate::error::Error;

/// A parameter or column value exchanged with an engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Text(String),
    Timestamp(chrono::DateTime<chrono::Utc>),
}

/// A single result row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Vec<Value>,
}

impl Row {
    pub fn new(columns: Vec<Value>) -> Self {
        Self { columns }
    }

    pub fn get(&self, index: usize) -> Result<&Value, Error> {
        self.columns.get(index).ok_or_else(|| {
            Error::Generic(format!(
                "row has {} columns, no column {index}",
                self.columns.len()
            ))
        })
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// A single database connection (or a handle onto one).
pub trait Connection {
    /// Execute a statement, returning the number of affected rows.
    ///
    /// When `params` is empty, `sql` may contain multiple statements and is
    /// run through the engine's batch path (the affected-row count is then
    /// engine-dependent). Migration bodies loaded from `.sql` files rely on
    /// this.
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, Error>;

    /// Run a query and collect every result row.
    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, Error>;
}

/// A pool of database connections, built by an
/// [`EngineProvider`](crate::EngineProvider) and owned by the manager for
/// its lifetime.
pub trait ConnectionPool {
    /// Acquire a connection from the pool.
    fn connection(&mut self) -> Result<Box<dyn Connection>, Error>;

    /// Verify the pool can reach the database.
    fn ping(&mut self) -> Result<(), Error>;

    /// Release every pooled connection. Dropping the pool has the same
    /// effect; `close` exists so callers can observe the error.
    fn close(&mut self) -> Result<(), Error>;
}

/// An open transaction on a connection acquired from the pool.
///
/// `BEGIN` is issued on construction. Exactly one of [`commit`](Self::commit)
/// or [`rollback`](Self::rollback) consumes the transaction; if neither runs
/// (an error unwound past it), dropping the transaction rolls back.
pub struct Transaction {
    conn: Box<dyn Connection>,
    finished: bool,
}

impl Transaction {
    pub(crate) fn begin(mut conn: Box<dyn Connection>) -> Result<Self, Error> {
        conn.execute("BEGIN", &[])?;
        Ok(Self {
            conn,
            finished: false,
        })
    }

    /// Execute a statement within the transaction.
    pub fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, Error> {
        self.conn.execute(sql, params)
    }

    /// Run a query within the transaction.
    pub fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, Error> {
        self.conn.query(sql, params)
    }

    pub fn commit(mut self) -> Result<(), Error> {
        self.finished = true;
        self.conn.execute("COMMIT", &[])?;
        Ok(())
    }

    pub fn rollback(mut self) -> Result<(), Error> {
        self.finished = true;
        self.conn.execute("ROLLBACK", &[])?;
        Ok(())
    }

    /// Roll back, preserving `primary` as the error of record and folding a
    /// secondary rollback failure into its message.
    pub(crate) fn rollback_with(self, primary: Error) -> Error {
        match self.rollback() {
            Ok(()) => primary,
            Err(rollback_err) => Error::Generic(format!(
                "{primary}; failed to roll back transaction: {rollback_err}"
            )),
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished {
            // Read-only transactions and error paths land here; a rollback
            // failure at this point has no caller left to report to.
            let _ = self.conn.execute("ROLLBACK", &[]);
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("finished", &self.finished)
            .finish()
    }
}
