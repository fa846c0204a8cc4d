use std::time::Duration;

/// Error type for the golembic crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A duration could not be expressed as an exact multiple of a base unit.
    #[error("cannot convert duration; {duration:?} is not a multiple of {base:?}")]
    DurationConversion { duration: Duration, base: Duration },
    /// A sequence was started with a migration that has a previous revision.
    #[error("root migration cannot have a previous revision; previous: {previous:?}, revision: {revision:?}")]
    NotRoot { revision: String, previous: String },
    /// A migration was built without a revision.
    #[error("a migration must have a revision")]
    MissingRevision,
    /// A non-root migration was registered without a previous revision.
    #[error("cannot register a migration with no previous revision; revision: {revision:?}")]
    NoPrevious { revision: String },
    /// A migration referenced a previous revision that is not registered.
    #[error("previous revision is not registered; previous: {previous:?}, revision: {revision:?}")]
    PreviousNotRegistered { revision: String, previous: String },
    /// A revision was registered twice.
    #[error("migration has already been registered; revision: {revision:?}")]
    AlreadyRegistered { revision: String },
    /// A revision named by a caller or read back from the metadata table is
    /// not in the sequence.
    #[error("no migration registered for revision; revision: {revision:?}")]
    MigrationNotRegistered { revision: String },
    /// The persisted history disagrees with the registered sequence.
    #[error("migration stored in database does not match sequence; {0}")]
    MigrationMismatch(String),
    /// Neither or both of the `up` / `up_conn` callbacks were set at apply time.
    #[error("cannot invoke up function for migration; revision: {revision:?}")]
    CannotInvokeUp { revision: String },
    /// A milestone migration is not the last element of a pending batch.
    #[error("cannot pass milestone migration; revision: {revision:?} ({position} / {count} migrations)")]
    CannotPassMilestone {
        revision: String,
        position: usize,
        count: usize,
    },
    #[error("{0}")]
    Generic(String),
    #[cfg(feature = "sqlite")]
    #[error("{0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[cfg(feature = "postgres")]
    #[error("{0}")]
    Postgres(#[from] postgres::Error),
    #[cfg(feature = "mysql")]
    #[error("{0}")]
    Mysql(String),
}

// mysql::Error is stored as a string so the variant stays comparable and
// printable without holding the driver's non-trivial error graph.
#[cfg(feature = "mysql")]
impl From<mysql::Error> for Error {
    fn from(value: mysql::Error) -> Self {
        Self::Mysql(value.to_string())
    }
}

impl From<String> for Error {
    fn from(value: String) -> Self {
        Self::Generic(value)
    }
}
