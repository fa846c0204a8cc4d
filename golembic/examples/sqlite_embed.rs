//! Embed the migration engine in an application startup path.
//!
//! Run with: cargo run --example sqlite_embed

use golembic::sqlite::SqliteProvider;
use golembic::{ApplyConfig, Error, Manager, Migration, Migrations};

fn migrations() -> Result<Migrations, Error> {
    let root = Migration::new("c9b52448285b")?
        .with_description("Create users table")
        .with_up_from_sql("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL)");

    let sequence = Migrations::new(root)?;
    sequence.register(
        Migration::new("f1be62155239")?
            .with_previous("c9b52448285b")
            .with_description("Seed data in users table")
            .with_up(|tx| {
                tx.execute("INSERT INTO users (name) VALUES ('root')", &[])?;
                Ok(())
            }),
    )?;
    sequence.register(
        Migration::new("dce8812d7b6f")?
            .with_previous("f1be62155239")
            .with_description("Add city column to users table")
            .with_up_from_sql("ALTER TABLE users ADD COLUMN city TEXT"),
    )?;

    Ok(sequence)
}

fn main() -> Result<(), Error> {
    let mut manager = Manager::new(SqliteProvider::default(), migrations()?);

    manager.describe();
    manager.up(ApplyConfig::new())?;
    manager.verify()?;
    manager.version(ApplyConfig::new())?;

    manager.close_connection_pool()
}
