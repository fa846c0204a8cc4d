use std::fmt;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::Error;
use crate::sql::{Connection, ConnectionPool, Transaction};

/// The in-transaction application callback. The transaction is started
/// before the callback is invoked and committed after it exits without
/// error; the metadata row is written as part of the same transaction.
pub type UpMigration = Arc<dyn Fn(&mut Transaction) -> Result<(), Error> + Send + Sync>;

/// The out-of-transaction application callback, running on a single
/// connection acquired from the pool. Only for DDL that cannot run inside a
/// transaction (e.g. `CREATE INDEX CONCURRENTLY`); see
/// [`Manager::apply_migration`](crate::Manager::apply_migration) for the
/// atomicity caveat.
pub type UpConnMigration = Arc<dyn Fn(&mut dyn Connection) -> Result<(), Error> + Send + Sync>;

/// An individual forward migration.
///
/// A migration is identified by an opaque `revision` and linked to the
/// migration immediately preceding it through `previous`; the single
/// migration without a `previous` is the root of the sequence.
#[derive(Clone)]
pub struct Migration {
    revision: String,
    previous: Option<String>,
    description: String,
    milestone: bool,
    up: Option<UpMigration>,
    up_conn: Option<UpConnMigration>,
    serial_id: u32,
    created_at: Option<DateTime<Utc>>,
}

impl Migration {
    /// Start building a migration. Fails with [`Error::MissingRevision`] if
    /// the revision is empty.
    pub fn new(revision: impl Into<String>) -> Result<Self, Error> {
        let revision = revision.into();
        if revision.is_empty() {
            return Err(Error::MissingRevision);
        }

        Ok(Self {
            revision,
            previous: None,
            description: String::new(),
            milestone: false,
            up: None,
            up_conn: None,
            serial_id: 0,
            created_at: None,
        })
    }

    /// A metadata row read back from the database.
    pub(crate) fn stored(
        revision: String,
        previous: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            revision,
            previous,
            description: String::new(),
            milestone: false,
            up: None,
            up_conn: None,
            serial_id: 0,
            created_at: Some(created_at),
        }
    }

    /// Set the revision this migration follows.
    pub fn with_previous(mut self, revision: impl Into<String>) -> Self {
        self.previous = Some(revision.into());
        self
    }

    /// Set the human-readable description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Mark this migration as a milestone: it must be the last migration
    /// applied in any non-bootstrap batch.
    pub fn with_milestone(mut self, milestone: bool) -> Self {
        self.milestone = milestone;
        self
    }

    /// Set the in-transaction application callback.
    pub fn with_up<F>(mut self, up: F) -> Self
    where
        F: Fn(&mut Transaction) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.up = Some(Arc::new(up));
        self
    }

    /// Set the in-transaction callback to execute a SQL statement.
    pub fn with_up_from_sql(self, statement: impl Into<String>) -> Self {
        let statement = statement.into();
        self.with_up(move |tx| {
            tx.execute(&statement, &[])?;
            Ok(())
        })
    }

    /// Set the in-transaction callback to execute the contents of a SQL
    /// file. The file is read eagerly, here.
    pub fn with_up_from_file(self, path: impl AsRef<Path>) -> Result<Self, Error> {
        let statement = read_sql_file(path.as_ref())?;
        Ok(self.with_up_from_sql(statement))
    }

    /// Set the out-of-transaction application callback.
    pub fn with_up_conn<F>(mut self, up_conn: F) -> Self
    where
        F: Fn(&mut dyn Connection) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.up_conn = Some(Arc::new(up_conn));
        self
    }

    /// Set the out-of-transaction callback to execute a SQL statement.
    pub fn with_up_conn_from_sql(self, statement: impl Into<String>) -> Self {
        let statement = statement.into();
        self.with_up_conn(move |conn| {
            conn.execute(&statement, &[])?;
            Ok(())
        })
    }

    /// Set the out-of-transaction callback to execute the contents of a SQL
    /// file. The file is read eagerly, here.
    pub fn with_up_conn_from_file(self, path: impl AsRef<Path>) -> Result<Self, Error> {
        let statement = read_sql_file(path.as_ref())?;
        Ok(self.with_up_conn_from_sql(statement))
    }

    pub fn revision(&self) -> &str {
        &self.revision
    }

    pub fn previous(&self) -> Option<&str> {
        self.previous.as_deref()
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn milestone(&self) -> bool {
        self.milestone
    }

    /// The position of this migration in its sequence; assigned at
    /// registration time, `0` for the root.
    pub fn serial_id(&self) -> u32 {
        self.serial_id
    }

    pub(crate) fn set_serial_id(&mut self, serial_id: u32) {
        self.serial_id = serial_id;
    }

    /// When this migration was applied; only populated on values read back
    /// from the metadata table.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    /// The description, with `" [MILESTONE]"` appended for milestones.
    pub fn extended_description(&self) -> String {
        if self.milestone {
            format!("{} [MILESTONE]", self.description)
        } else {
            self.description.clone()
        }
    }

    /// A compact `<revision>:<previous|NULL>` rendering for diagnostics.
    pub fn compact(&self) -> String {
        match &self.previous {
            Some(previous) => format!("{}:{}", self.revision, previous),
            None => format!("{}:NULL", self.revision),
        }
    }

    /// Whether `other` has the same `revision` and `previous`; used to
    /// compare a metadata row against a registered migration.
    pub fn like(&self, other: &Migration) -> bool {
        self.revision == other.revision && self.previous == other.previous
    }

    /// Run the application callback. The `up_conn` variant runs on a
    /// connection acquired from `pool`, outside `tx`; the `up` variant runs
    /// on `tx`. Exactly one of the two must be set.
    pub fn invoke_up(
        &self,
        pool: &mut dyn ConnectionPool,
        tx: &mut Transaction,
    ) -> Result<(), Error> {
        match (&self.up, &self.up_conn) {
            (Some(up), None) => up(tx),
            (None, Some(up_conn)) => {
                let mut conn = pool.connection()?;
                up_conn(conn.as_mut())
            }
            _ => Err(Error::CannotInvokeUp {
                revision: self.revision.clone(),
            }),
        }
    }
}

fn read_sql_file(path: &Path) -> Result<String, Error> {
    std::fs::read_to_string(path).map_err(|err| {
        Error::Generic(format!(
            "failed to read migration file {}: {err}",
            path.display()
        ))
    })
}

// Manual Debug since the callbacks are opaque.
impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration")
            .field("revision", &self.revision)
            .field("previous", &self.previous)
            .field("description", &self.description)
            .field("milestone", &self.milestone)
            .field("serial_id", &self.serial_id)
            .field("created_at", &self.created_at)
            .field("up", &self.up.is_some())
            .field("up_conn", &self.up_conn.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_revision_rejected() {
        let err = Migration::new("").unwrap_err();
        assert!(matches!(err, Error::MissingRevision));
    }

    #[test]
    fn compact_renders_previous_or_null() {
        let root = Migration::new("c9b52448285b").unwrap();
        assert_eq!(root.compact(), "c9b52448285b:NULL");

        let child = Migration::new("f1be62155239")
            .unwrap()
            .with_previous("c9b52448285b");
        assert_eq!(child.compact(), "f1be62155239:c9b52448285b");
    }

    #[test]
    fn like_compares_revision_and_previous() {
        let a = Migration::new("b").unwrap().with_previous("a");
        let b = Migration::new("b")
            .unwrap()
            .with_previous("a")
            .with_description("anything");
        let c = Migration::new("b").unwrap().with_previous("z");

        assert!(a.like(&b));
        assert!(!a.like(&c));
    }

    #[test]
    fn extended_description_marks_milestones() {
        let plain = Migration::new("a").unwrap().with_description("init");
        assert_eq!(plain.extended_description(), "init");

        let milestone = Migration::new("a")
            .unwrap()
            .with_description("init")
            .with_milestone(true);
        assert_eq!(milestone.extended_description(), "init [MILESTONE]");
    }

    #[test]
    fn up_from_file_missing_file() {
        let err = Migration::new("a")
            .unwrap()
            .with_up_from_file("/no/such/file.sql")
            .unwrap_err();
        assert!(matches!(err, Error::Generic(message) if message.contains("/no/such/file.sql")));
    }

    #[test]
    fn up_from_file_reads_eagerly() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "CREATE TABLE users (id INTEGER PRIMARY KEY)").unwrap();

        let migration = Migration::new("a")
            .unwrap()
            .with_up_from_file(file.path())
            .unwrap();

        // Deleting the file after construction must not matter.
        drop(file);
        assert!(migration.up.is_some());
    }
}
