use chrono::DateTime;

use crate::apply::ApplyConfig;
use crate::error::Error;
use crate::log::{LogSink, StdoutLog};
use crate::migration::Migration;
use crate::migrations::Migrations;
use crate::provider::EngineProvider;
use crate::sql::{ConnectionPool, Transaction, Value};
use crate::table;

/// The default name for the table used to store metadata about migrations.
pub const DEFAULT_METADATA_TABLE: &str = "golembic_migrations";

/// How an "up" operation selects its pending migrations, given the latest
/// applied revision.
#[derive(Debug, Clone)]
pub(crate) enum ApplyFilter {
    /// Everything after the latest applied revision, or the whole sequence
    /// when nothing has been applied.
    SinceOrAll,
    /// Everything after the latest applied revision up to and including the
    /// target, or the prefix ending at the target when nothing has been
    /// applied.
    BetweenOrUntil(String),
}

/// Orchestrates the application of migrations: connection-pool and
/// transaction lifecycle, metadata-table creation, history verification and
/// milestone enforcement.
///
/// A manager is intended for single-threaded use by one caller during a
/// migration run; concurrent runs against the same database must be
/// prevented by the operator.
pub struct Manager {
    metadata_table: String,
    connection_pool: Option<Box<dyn ConnectionPool>>,
    provider: Box<dyn EngineProvider>,
    sequence: Migrations,
    dev_mode: bool,
    log: Box<dyn LogSink>,
}

impl Manager {
    pub fn new(provider: impl EngineProvider + 'static, sequence: Migrations) -> Self {
        Self {
            metadata_table: DEFAULT_METADATA_TABLE.to_owned(),
            connection_pool: None,
            provider: Box::new(provider),
            sequence,
            dev_mode: false,
            log: Box::new(StdoutLog),
        }
    }

    /// Set the name of the metadata table. Defaults to
    /// [`DEFAULT_METADATA_TABLE`].
    pub fn with_metadata_table(mut self, table: impl Into<String>) -> Self {
        self.metadata_table = table.into();
        self
    }

    /// In development mode a milestone-ordering violation is logged instead
    /// of failing the run. No other error is demoted.
    pub fn with_dev_mode(mut self, dev_mode: bool) -> Self {
        self.dev_mode = dev_mode;
        self
    }

    /// Redirect operation output away from standard output.
    pub fn with_log(mut self, log: impl LogSink + 'static) -> Self {
        self.log = Box::new(log);
        self
    }

    pub fn metadata_table(&self) -> &str {
        &self.metadata_table
    }

    pub fn sequence(&self) -> &Migrations {
        &self.sequence
    }

    pub fn provider(&self) -> &dyn EngineProvider {
        self.provider.as_ref()
    }

    /// Return the cached connection pool, or open a fresh one, ping it and
    /// cache it.
    pub fn ensure_connection_pool(&mut self) -> Result<&mut dyn ConnectionPool, Error> {
        if let Some(ref mut pool) = self.connection_pool {
            return Ok(pool.as_mut());
        }

        let mut pool = self.provider.open()?;
        pool.ping()?;
        Ok(self.connection_pool.insert(pool).as_mut())
    }

    /// Close and clear the cached connection pool; a no-op when none is
    /// cached. Call once when done with the manager (the CLI does this in a
    /// finalizer) so the pool is not leaked.
    pub fn close_connection_pool(&mut self) -> Result<(), Error> {
        match self.connection_pool.take() {
            Some(mut pool) => pool.close(),
            None => Ok(()),
        }
    }

    /// Ensure the pool, acquire a connection and begin a transaction with
    /// default isolation.
    pub fn new_tx(&mut self) -> Result<Transaction, Error> {
        let pool = self.ensure_connection_pool()?;
        let conn = pool.connection()?;
        Transaction::begin(conn)
    }

    /// Check that the metadata table exists, creating it if not.
    pub fn ensure_migrations_table(&mut self) -> Result<(), Error> {
        table::create_migrations_table(self)
    }

    /// Insert the metadata row for `migration`. The root row uses literal
    /// `0` and `NULL` for `serial_id` and `previous`; `created_at` relies on
    /// the database default.
    pub fn insert_migration(
        &self,
        tx: &mut Transaction,
        migration: &Migration,
    ) -> Result<(), Error> {
        let quoted = self.provider.quote_identifier(&self.metadata_table);

        match migration.previous() {
            None => {
                let statement = format!(
                    "INSERT INTO {quoted} (serial_id, revision, previous) VALUES (0, {p1}, NULL)",
                    p1 = self.provider.query_parameter(1),
                );
                tx.execute(&statement, &[Value::Text(migration.revision().to_owned())])?;
            }
            Some(previous) => {
                let statement = format!(
                    "INSERT INTO {quoted} (serial_id, revision, previous) VALUES ({p1}, {p2}, {p3})",
                    p1 = self.provider.query_parameter(1),
                    p2 = self.provider.query_parameter(2),
                    p3 = self.provider.query_parameter(3),
                );
                tx.execute(
                    &statement,
                    &[
                        Value::Integer(i64::from(migration.serial_id())),
                        Value::Text(migration.revision().to_owned()),
                        Value::Text(previous.to_owned()),
                    ],
                )?;
            }
        }

        Ok(())
    }

    /// Apply a single migration: run its body and insert its metadata row in
    /// one transaction, rolling back on any error.
    ///
    /// When the migration carries the out-of-transaction callback, its body
    /// runs on a separately acquired connection *outside* the transaction;
    /// only the metadata insert is transactional. If that body succeeds and
    /// the subsequent commit fails, the schema change exists without a
    /// metadata record and the operator must investigate manually. This is
    /// the deliberate, narrow exception to atomicity that exists for DDL
    /// which cannot run inside a transaction.
    pub fn apply_migration(&mut self, migration: &Migration) -> Result<(), Error> {
        self.log.log(format_args!(
            "Applying {}: {}",
            migration.revision(),
            migration.extended_description(),
        ));
        #[cfg(feature = "tracing")]
        tracing::info!(revision = migration.revision(), "Applying migration");

        let mut tx = self.new_tx()?;
        let result = (|| -> Result<(), Error> {
            let pool = match self.connection_pool.as_deref_mut() {
                Some(pool) => pool,
                None => {
                    return Err(Error::Generic(
                        "connection pool is not initialized".to_owned(),
                    ))
                }
            };
            migration.invoke_up(pool, &mut tx)?;
            self.insert_migration(&mut tx, migration)
        })();

        match result {
            Ok(()) => tx.commit(),
            Err(err) => Err(tx.rollback_with(err)),
        }
    }

    /// Apply all migrations that have not yet been applied.
    pub fn up(&mut self, cfg: ApplyConfig) -> Result<(), Error> {
        let (past_count, pending) =
            self.filter_migrations(ApplyFilter::SinceOrAll, cfg.verify_history)?;
        if pending.is_empty() {
            return Ok(());
        }

        self.validate_milestones(past_count, &pending)?;
        for migration in &pending {
            self.apply_migration(migration)?;
        }
        Ok(())
    }

    /// Apply the **next** migration that has not yet been applied, if any.
    pub fn up_one(&mut self, cfg: ApplyConfig) -> Result<(), Error> {
        let (_, pending) = self.filter_migrations(ApplyFilter::SinceOrAll, cfg.verify_history)?;

        // A batch of one makes milestone ordering vacuous.
        match pending.first() {
            Some(migration) => self.apply_migration(migration),
            None => Ok(()),
        }
    }

    /// Apply all migrations up to and including `cfg.revision`, which is
    /// required.
    pub fn up_to(&mut self, cfg: ApplyConfig) -> Result<(), Error> {
        let revision = cfg
            .revision
            .ok_or_else(|| Error::Generic("up-to requires a target revision".to_owned()))?;

        let (past_count, pending) =
            self.filter_migrations(ApplyFilter::BetweenOrUntil(revision), cfg.verify_history)?;
        if pending.is_empty() {
            return Ok(());
        }

        self.validate_milestones(past_count, &pending)?;
        for migration in &pending {
            self.apply_migration(migration)?;
        }
        Ok(())
    }

    /// Print the registered sequence; no database interaction.
    pub fn describe(&self) {
        self.sequence.describe(self.log.as_ref());
    }

    /// Report the most recently applied migration, resolved through the
    /// sequence and combined with the `created_at` read from the database.
    pub fn version(&mut self, cfg: ApplyConfig) -> Result<(), Error> {
        self.ensure_migrations_table()?;
        let mut tx = self.new_tx()?;
        let latest = self.latest_maybe_verify(&mut tx, cfg.verify_history)?;
        drop(tx);

        match latest {
            None => {
                self.log.log(format_args!("No migrations have been run"));
                Ok(())
            }
            Some(row) => {
                let migration = self.sequence.get(row.revision()).ok_or_else(|| {
                    Error::MigrationNotRegistered {
                        revision: row.revision().to_owned(),
                    }
                })?;
                let applied = row.created_at().unwrap_or(DateTime::UNIX_EPOCH);
                self.log.log(format_args!(
                    "{}: {} (applied {applied})",
                    migration.revision(),
                    migration.extended_description(),
                ));
                Ok(())
            }
        }
    }

    /// Check that the rows in the metadata table match the registered
    /// sequence, then print each registered migration with its applied
    /// timestamp (or a "not yet applied" marker).
    pub fn verify(&mut self) -> Result<(), Error> {
        self.ensure_migrations_table()?;
        let mut tx = self.new_tx()?;
        let (history, registered) = self.verify_history(&mut tx)?;
        drop(tx);

        for (index, migration) in registered.iter().enumerate() {
            match history.get(index) {
                Some(row) => {
                    let applied = row.created_at().unwrap_or(DateTime::UNIX_EPOCH);
                    self.log.log(format_args!(
                        ":: {index} | {} | {} (applied {applied})",
                        migration.revision(),
                        migration.extended_description(),
                    ));
                }
                None => {
                    self.log.log(format_args!(
                        ":: {index} | {} | {} (not yet applied)",
                        migration.revision(),
                        migration.extended_description(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Read the full stored history (ordered by `serial_id`) and cross-check
    /// it against the registered sequence: the history may not be longer
    /// than the sequence, and every stored `(revision, previous)` pair must
    /// match the registered migration at the same index.
    pub(crate) fn verify_history(
        &self,
        tx: &mut Transaction,
    ) -> Result<(Vec<Migration>, Vec<Migration>), Error> {
        let quoted = self.provider.quote_identifier(&self.metadata_table);
        let query = format!(
            "SELECT revision, previous, created_at FROM {quoted} ORDER BY serial_id ASC"
        );
        let history = self.read_migrations(tx, &query)?;
        let registered = self.sequence.all();

        if history.len() > registered.len() {
            return Err(Error::MigrationMismatch(format!(
                "sequence has {} migrations but {} are stored in the table",
                registered.len(),
                history.len(),
            )));
        }

        for (index, row) in history.iter().enumerate() {
            let expected = &registered[index];
            if !row.like(expected) {
                return Err(Error::MigrationMismatch(format!(
                    "stored migration {index}: {stored:?} does not match migration {expected:?} in sequence",
                    stored = row.compact(),
                    expected = expected.compact(),
                )));
            }
        }

        Ok((history, registered))
    }

    /// Determine the pending migrations for an "up" operation.
    ///
    /// Ensures the metadata table, determines the latest applied revision
    /// (optionally verifying the whole history first), applies `filter` and
    /// logs when there is nothing to do. Returns the number of migrations
    /// already applied alongside the pending ones; milestone validation
    /// needs the former.
    pub(crate) fn filter_migrations(
        &mut self,
        filter: ApplyFilter,
        verify_history: bool,
    ) -> Result<(usize, Vec<Migration>), Error> {
        self.ensure_migrations_table()?;
        let mut tx = self.new_tx()?;
        let latest = self.latest_maybe_verify(&mut tx, verify_history)?;
        drop(tx);

        let latest_revision = latest.as_ref().map(|row| row.revision().to_owned());
        let (past_count, pending) = match (&latest_revision, &filter) {
            (None, ApplyFilter::SinceOrAll) => (0, self.sequence.all()),
            (Some(revision), ApplyFilter::SinceOrAll) => self.sequence.since(revision)?,
            (None, ApplyFilter::BetweenOrUntil(target)) => self.sequence.until(target)?,
            (Some(revision), ApplyFilter::BetweenOrUntil(target)) => {
                self.sequence.between(revision, target)?
            }
        };

        if pending.is_empty() {
            if let Some(revision) = &latest_revision {
                let is_milestone = self
                    .sequence
                    .get(revision)
                    .map(|m| m.milestone())
                    .unwrap_or(false);
                let suffix = if is_milestone { " [MILESTONE]" } else { "" };
                self.log.log(format_args!(
                    "No migrations to run; latest revision: {revision}{suffix}"
                ));
            }
        }

        Ok((past_count, pending))
    }

    /// Fail if any milestone migration is followed by further pending
    /// migrations in this batch.
    ///
    /// A database being brought up from empty (`past_count == 0`) is exempt:
    /// a first-run bootstrap legitimately applies a whole sequence,
    /// intermediate milestones included. In development mode the violation
    /// is logged instead of returned.
    pub(crate) fn validate_milestones(
        &self,
        past_count: usize,
        pending: &[Migration],
    ) -> Result<(), Error> {
        if past_count == 0 {
            return Ok(());
        }

        let count = pending.len();
        for (index, migration) in pending.iter().enumerate() {
            if index + 1 == count {
                break;
            }
            if !migration.milestone() {
                continue;
            }

            let err = Error::CannotPassMilestone {
                revision: migration.revision().to_owned(),
                position: index + 1,
                count,
            };
            if self.dev_mode {
                self.log
                    .log(format_args!("Ignoring error in development mode: {err}"));
                continue;
            }
            return Err(err);
        }

        Ok(())
    }

    /// The latest applied migration: either just the single greatest-serial
    /// row, or, when `verify_history` is set, the tail of a fully
    /// cross-checked history.
    fn latest_maybe_verify(
        &self,
        tx: &mut Transaction,
        verify_history: bool,
    ) -> Result<Option<Migration>, Error> {
        if verify_history {
            let (history, _) = self.verify_history(tx)?;
            return Ok(history.last().cloned());
        }

        let quoted = self.provider.quote_identifier(&self.metadata_table);
        let query = format!(
            "SELECT revision, previous, created_at FROM {quoted} ORDER BY serial_id DESC LIMIT 1"
        );
        let mut rows = self.read_migrations(tx, &query)?;
        Ok(if rows.is_empty() {
            None
        } else {
            Some(rows.swap_remove(0))
        })
    }

    /// Read metadata rows from a query returning `revision, previous,
    /// created_at` (in that order), decoding `created_at` through the
    /// provider's timestamp column.
    fn read_migrations(&self, tx: &mut Transaction, query: &str) -> Result<Vec<Migration>, Error> {
        let rows = tx.query(query, &[])?;
        let mut result = Vec::with_capacity(rows.len());

        for row in &rows {
            let revision = match row.get(0)? {
                Value::Text(revision) => revision.clone(),
                other => {
                    return Err(Error::Generic(format!(
                        "expected a text revision column, got {other:?}"
                    )))
                }
            };
            let previous = match row.get(1)? {
                Value::Null => None,
                Value::Text(previous) => Some(previous.clone()),
                other => {
                    return Err(Error::Generic(format!(
                        "expected a text or NULL previous column, got {other:?}"
                    )))
                }
            };
            let mut created_at = self.provider.timestamp_column();
            created_at.scan(row.get(2)?)?;

            result.push(Migration::stored(revision, previous, created_at.timestamp()));
        }

        Ok(result)
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("metadata_table", &self.metadata_table)
            .field("connection_pool", &self.connection_pool.is_some())
            .field("sequence", &self.sequence)
            .field("dev_mode", &self.dev_mode)
            .finish()
    }
}
