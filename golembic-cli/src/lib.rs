//! Command-line surface for the golembic migration engine.
//!
//! This crate is a thin mapping from subcommands to
//! [`Manager`](golembic::Manager) operations. An application embeds it by
//! supplying the function that builds its migration sequence:
//!
//! ```no_run
//! fn main() {
//!     if let Err(err) = golembic_cli::run(|sql_directory| {
//!         my_app_migrations(sql_directory)
//!     }) {
//!         eprintln!("Error: {err}");
//!         std::process::exit(1);
//!     }
//! }
//! # fn my_app_migrations(
//! #     _sql_directory: Option<&std::path::Path>,
//! # ) -> Result<golembic::Migrations, golembic::Error> {
//! #     unimplemented!()
//! # }
//! ```
//!
//! The layout is one engine subcommand (`postgres`, `mysql`, `sqlite`,
//! each behind the matching cargo feature) carrying connection flags,
//! followed by an action subcommand: `describe`, `up`, `up-one`,
//! `up-to --revision <r>`, `verify`, `version`.
//!
//! Passwords never travel on flags; they are read from environment
//! variables only (`PGPASSWORD` for PostgreSQL, `DB_PASSWORD` for MySQL).

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use golembic::{ApplyConfig, Error, Manager, Migrations};

/// Top-level arguments: global flags plus one engine subcommand.
#[derive(Debug, Parser)]
#[command(name = "golembic", about = "Manage SQL schema migrations", version)]
pub struct CliArgs {
    /// The name of the table that stores migration metadata.
    #[arg(long, global = true, default_value = golembic::DEFAULT_METADATA_TABLE)]
    pub metadata_table: String,

    /// Path to a directory containing ".sql" migration files; handed to the
    /// application's sequence builder.
    #[arg(long, global = true)]
    pub sql_directory: Option<PathBuf>,

    /// Development mode: demote milestone-ordering violations to warnings.
    #[arg(long, global = true)]
    pub dev: bool,

    #[command(subcommand)]
    pub engine: EngineCommand,
}

/// The database engine to run against.
#[derive(Debug, Subcommand)]
pub enum EngineCommand {
    /// Run migrations against a PostgreSQL database.
    #[cfg(feature = "postgres")]
    Postgres {
        #[command(flatten)]
        connection: PostgresArgs,
        #[command(subcommand)]
        command: MigrateCommand,
    },
    /// Run migrations against a MySQL database.
    #[cfg(feature = "mysql")]
    Mysql {
        #[command(flatten)]
        connection: MysqlArgs,
        #[command(subcommand)]
        command: MigrateCommand,
    },
    /// Run migrations against a SQLite database.
    #[cfg(feature = "sqlite")]
    Sqlite {
        #[command(flatten)]
        connection: SqliteArgs,
        #[command(subcommand)]
        command: MigrateCommand,
    },
}

#[cfg(feature = "postgres")]
#[derive(Debug, clap::Args)]
pub struct PostgresArgs {
    #[arg(long, default_value = "localhost")]
    pub host: String,
    #[arg(long, default_value_t = 5432)]
    pub port: u16,
    #[arg(long, default_value = "postgres")]
    pub dbname: String,
    #[arg(long, default_value = "public")]
    pub schema: String,
    #[arg(long, default_value = "")]
    pub username: String,
    /// SSL mode for the connection (e.g. "disable", "prefer").
    #[arg(long, default_value = "")]
    pub ssl_mode: String,
    /// Connection timeout, in seconds.
    #[arg(long)]
    pub connect_timeout: Option<u64>,
    /// Lock acquisition timeout, in milliseconds.
    #[arg(long, default_value_t = 4000)]
    pub lock_timeout_ms: u64,
    /// Statement timeout, in milliseconds.
    #[arg(long, default_value_t = 5000)]
    pub statement_timeout_ms: u64,
    #[arg(long, default_value_t = 16)]
    pub idle_connections: usize,
    #[arg(long, default_value_t = 32)]
    pub max_connections: usize,
    /// Maximum lifetime of a pooled connection, in seconds; omit for
    /// unbounded.
    #[arg(long)]
    pub max_lifetime_secs: Option<u64>,
}

#[cfg(feature = "mysql")]
#[derive(Debug, clap::Args)]
pub struct MysqlArgs {
    #[arg(long, default_value = "localhost")]
    pub host: String,
    #[arg(long, default_value_t = 3306)]
    pub port: u16,
    #[arg(long, default_value = "")]
    pub dbname: String,
    #[arg(long, default_value = "")]
    pub username: String,
    #[arg(long, default_value_t = 2)]
    pub idle_connections: usize,
    #[arg(long, default_value_t = 16)]
    pub max_connections: usize,
}

#[cfg(feature = "sqlite")]
#[derive(Debug, clap::Args)]
pub struct SqliteArgs {
    /// Path to the database file, or ":memory:".
    #[arg(long, default_value = ":memory:")]
    pub path: String,
}

/// The manager operation to perform.
#[derive(Debug, Subcommand)]
pub enum MigrateCommand {
    /// Describe the registered sequence of migrations.
    ///
    /// This does not make any connection to the database; use `verify` to
    /// compare registered migrations to history.
    Describe,
    /// Run all migrations that have not yet been applied.
    Up {
        #[arg(long)]
        verify_history: bool,
    },
    /// Run the first migration that has not yet been applied.
    UpOne {
        #[arg(long)]
        verify_history: bool,
    },
    /// Run all migrations up to a fixed revision that have not yet been
    /// applied.
    UpTo {
        #[arg(long)]
        revision: String,
        #[arg(long)]
        verify_history: bool,
    },
    /// Check that the stored migration history matches the registered
    /// sequence.
    Verify,
    /// Report the migration most recently applied to the database.
    Version {
        #[arg(long)]
        verify_history: bool,
    },
}

/// Parse the command line, build the sequence and run the requested
/// operation. The caller's `main` is expected to print the error and exit
/// non-zero.
pub fn run<F>(build_sequence: F) -> Result<(), Error>
where
    F: FnOnce(Option<&Path>) -> Result<Migrations, Error>,
{
    let args = CliArgs::parse();
    let sequence = build_sequence(args.sql_directory.as_deref())?;
    run_with_args(args, sequence)
}

/// Run the operation described by already-parsed arguments.
pub fn run_with_args(args: CliArgs, sequence: Migrations) -> Result<(), Error> {
    let CliArgs {
        metadata_table,
        dev,
        engine,
        ..
    } = args;

    let (manager, command) = match engine {
        #[cfg(feature = "postgres")]
        EngineCommand::Postgres {
            connection,
            command,
        } => {
            let provider = golembic::postgres::PostgresProvider::new(postgres_config(&connection));
            (Manager::new(provider, sequence), command)
        }
        #[cfg(feature = "mysql")]
        EngineCommand::Mysql {
            connection,
            command,
        } => {
            let provider = golembic::mysql::MysqlProvider::new(mysql_config(&connection));
            (Manager::new(provider, sequence), command)
        }
        #[cfg(feature = "sqlite")]
        EngineCommand::Sqlite {
            connection,
            command,
        } => {
            let provider = golembic::sqlite::SqliteProvider::new(golembic::sqlite::Config {
                data_source_name: connection.path.clone(),
            });
            (Manager::new(provider, sequence), command)
        }
    };

    let mut manager = manager
        .with_metadata_table(metadata_table)
        .with_dev_mode(dev);

    let result = dispatch(&mut manager, &command);
    let closed = manager.close_connection_pool();
    match (result, closed) {
        (Ok(()), Ok(())) => Ok(()),
        (Err(err), Ok(())) => Err(err),
        (Ok(()), Err(close_err)) => Err(close_err),
        (Err(err), Err(close_err)) => Err(Error::Generic(format!(
            "{err}; failed to close connection pool: {close_err}"
        ))),
    }
}

fn dispatch(manager: &mut Manager, command: &MigrateCommand) -> Result<(), Error> {
    match command {
        MigrateCommand::Describe => {
            manager.describe();
            Ok(())
        }
        MigrateCommand::Up { verify_history } => {
            manager.up(ApplyConfig::new().with_verify_history(*verify_history))
        }
        MigrateCommand::UpOne { verify_history } => {
            manager.up_one(ApplyConfig::new().with_verify_history(*verify_history))
        }
        MigrateCommand::UpTo {
            revision,
            verify_history,
        } => manager.up_to(
            ApplyConfig::new()
                .with_verify_history(*verify_history)
                .with_revision(revision.clone()),
        ),
        MigrateCommand::Verify => manager.verify(),
        MigrateCommand::Version { verify_history } => {
            manager.version(ApplyConfig::new().with_verify_history(*verify_history))
        }
    }
}

#[cfg(feature = "postgres")]
fn postgres_config(args: &PostgresArgs) -> golembic::postgres::Config {
    use std::time::Duration;

    golembic::postgres::Config {
        host: args.host.clone(),
        port: args.port,
        database: args.dbname.clone(),
        schema: args.schema.clone(),
        username: args.username.clone(),
        password: std::env::var("PGPASSWORD").unwrap_or_default(),
        connect_timeout: args.connect_timeout.map(Duration::from_secs),
        ssl_mode: args.ssl_mode.clone(),
        lock_timeout: Duration::from_millis(args.lock_timeout_ms),
        statement_timeout: Duration::from_millis(args.statement_timeout_ms),
        idle_connections: args.idle_connections,
        max_connections: args.max_connections,
        max_lifetime: args
            .max_lifetime_secs
            .map(Duration::from_secs)
            .unwrap_or(Duration::ZERO),
        ..golembic::postgres::Config::default()
    }
}

#[cfg(feature = "mysql")]
fn mysql_config(args: &MysqlArgs) -> golembic::mysql::Config {
    golembic::mysql::Config {
        host: args.host.clone(),
        port: args.port,
        database: args.dbname.clone(),
        username: args.username.clone(),
        password: std::env::var("DB_PASSWORD").unwrap_or_default(),
        idle_connections: args.idle_connections,
        max_connections: args.max_connections,
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use golembic::Migration;

    fn parse(argv: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(argv).unwrap()
    }

    fn demo_sequence() -> Migrations {
        let root = Migration::new("c9b52448285b")
            .unwrap()
            .with_description("Create users table")
            .with_up_from_sql("CREATE TABLE users (id INTEGER PRIMARY KEY)");
        Migrations::new(root).unwrap()
    }

    #[test]
    fn up_parses_global_flags() {
        let args = parse(&[
            "golembic",
            "--metadata-table",
            "audit",
            "--dev",
            "sqlite",
            "up",
            "--verify-history",
        ]);
        assert_eq!(args.metadata_table, "audit");
        assert!(args.dev);
        match args.engine {
            EngineCommand::Sqlite { command, .. } => {
                assert!(matches!(command, MigrateCommand::Up { verify_history: true }));
            }
            #[allow(unreachable_patterns)]
            other => panic!("unexpected engine: {other:?}"),
        }
    }

    #[test]
    fn metadata_table_defaults() {
        let args = parse(&["golembic", "sqlite", "describe"]);
        assert_eq!(args.metadata_table, golembic::DEFAULT_METADATA_TABLE);
        assert!(!args.dev);
    }

    #[test]
    fn up_to_requires_a_revision() {
        assert!(CliArgs::try_parse_from(["golembic", "sqlite", "up-to"]).is_err());

        let args = parse(&["golembic", "sqlite", "up-to", "--revision", "f1be62155239"]);
        match args.engine {
            EngineCommand::Sqlite { command, .. } => match command {
                MigrateCommand::UpTo {
                    revision,
                    verify_history,
                } => {
                    assert_eq!(revision, "f1be62155239");
                    assert!(!verify_history);
                }
                other => panic!("unexpected command: {other:?}"),
            },
            #[allow(unreachable_patterns)]
            other => panic!("unexpected engine: {other:?}"),
        }
    }

    #[test]
    fn sqlite_path_flag() {
        let args = parse(&["golembic", "sqlite", "--path", "app.sqlite3", "version"]);
        match args.engine {
            EngineCommand::Sqlite { connection, .. } => {
                assert_eq!(connection.path, "app.sqlite3");
            }
            #[allow(unreachable_patterns)]
            other => panic!("unexpected engine: {other:?}"),
        }
    }

    #[test]
    fn run_with_args_drives_the_manager() {
        let args = parse(&["golembic", "sqlite", "up"]);
        run_with_args(args, demo_sequence()).unwrap();
    }

    #[test]
    fn run_with_args_surfaces_errors() {
        let args = parse(&["golembic", "sqlite", "up-to", "--revision", "nope"]);
        let err = run_with_args(args, demo_sequence()).unwrap_err();
        assert!(matches!(err, Error::MigrationNotRegistered { .. }));
    }
}
