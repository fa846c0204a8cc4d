#![cfg_attr(docsrs, feature(doc_cfg))]
//! `golembic` is a SQL schema migration engine built around a linear,
//! database-verifiable history.
//!
//! Core concepts:
//! - Migrations form a singly-linked chain of opaque revisions: every
//!   migration names the revision it follows, and a single root starts the
//!   chain. There is no branching and no out-of-order application.
//! - Applied migrations are recorded in a metadata table whose constraints
//!   (primary key on `revision`, unique + foreign-key `previous`, a
//!   single-root check) make the database itself refuse a broken history.
//! - A [`Manager`] applies pending migrations one transaction at a time and
//!   delegates every engine-specific concern (quoting, placeholders,
//!   timestamp representation, pool construction, the table-existence
//!   probe) to a pluggable [`EngineProvider`].
//!
//! # Usage
//!
//! Build a sequence, pick a provider, hand both to a manager:
//!
//! ```
//! # #[cfg(feature = "sqlite")]
//! # fn main() -> Result<(), golembic::Error> {
//! use golembic::sqlite::SqliteProvider;
//! use golembic::{ApplyConfig, Manager, Migration, Migrations};
//!
//! let root = Migration::new("c9b52448285b")?
//!     .with_description("Create users table")
//!     .with_up_from_sql("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)");
//! let migrations = Migrations::new(root)?;
//! migrations.register(
//!     Migration::new("f1be62155239")?
//!         .with_previous("c9b52448285b")
//!         .with_description("Add city column")
//!         .with_up_from_sql("ALTER TABLE users ADD COLUMN city TEXT"),
//! )?;
//!
//! let mut manager = Manager::new(SqliteProvider::default(), migrations);
//! manager.up(ApplyConfig::new())?;
//! manager.close_connection_pool()?;
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "sqlite"))]
//! # fn main() {}
//! ```
//!
//! Migration bodies are live code, not just SQL strings: an
//! [`UpMigration`] receives the open [`Transaction`](sql::Transaction) and
//! can query data, transform it, and write it back. Bodies that cannot run
//! inside a transaction (e.g. `CREATE INDEX CONCURRENTLY`) use the
//! out-of-transaction [`UpConnMigration`] instead; the two are mutually
//! exclusive.
//!
//! # Milestones
//!
//! A migration flagged as a milestone must be the last migration applied in
//! any batch, which protects rolling-deploy boundaries: a deploy can be
//! required to stop at the milestone before later migrations ship. A
//! database being brought up from empty is exempt. In development mode
//! ([`Manager::with_dev_mode`]) the violation is logged instead of failing.
//!
//! # Database support
//!
//! - [`SQLite`](sqlite) - available with the `sqlite` feature flag (on by
//!   default); an in-memory database makes this the engine of choice for
//!   tests.
//! - [`PostgreSQL`](postgres) - available with the `postgres` feature flag.
//! - [`MySQL`](mysql) - available with the `mysql` feature flag.
//!
//! Tracing integration is available with the `tracing` feature flag.

mod apply;
pub use apply::ApplyConfig;

mod duration;
pub use duration::to_round_duration;

mod error;
pub use error::Error;

mod log;
pub use log::{LogSink, StdoutLog};

mod manager;
pub use manager::{Manager, DEFAULT_METADATA_TABLE};

mod migration;
pub use migration::{Migration, UpConnMigration, UpMigration};

mod migrations;
pub use migrations::Migrations;

mod provider;
pub use provider::{CreateTableParameters, EngineProvider, TimeColumnPointer, TimestampColumn};

pub mod quote;
pub mod sql;

mod table;

#[cfg(feature = "sqlite")]
#[cfg_attr(docsrs, doc(cfg(feature = "sqlite")))]
pub mod sqlite;

#[cfg(feature = "postgres")]
#[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
pub mod postgres;

#[cfg(feature = "mysql")]
#[cfg_attr(docsrs, doc(cfg(feature = "mysql")))]
pub mod mysql;
