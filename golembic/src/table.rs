//! Creation of the migrations metadata table.
//!
//! The constraint set is the heart of the linear-history invariant: the
//! database itself refuses any metadata row that would break a linear,
//! rooted chain. Revision is the primary key; `previous` is unique among
//! non-null values and a foreign key back to `revision`; `serial_id` is a
//! unique non-negative integer; and a row is the root (serial 0, NULL
//! previous) or it is not (non-zero serial, non-NULL previous).

use crate::error::Error;
use crate::manager::Manager;
use crate::provider::CreateTableParameters;
use crate::sql::{Transaction, Value};

/// Create the metadata table if it does not already exist, atomically.
pub(crate) fn create_migrations_table(manager: &mut Manager) -> Result<(), Error> {
    let mut tx = manager.new_tx()?;

    if table_exists(manager, &mut tx)? {
        return Ok(());
    }

    #[cfg(feature = "tracing")]
    tracing::info!(table = manager.metadata_table(), "Creating metadata table");

    let ctp = manager.provider().create_table_parameters();
    tx.execute(&create_table_sql(manager, &ctp), &[])?;

    if !ctp.skip_constraint_statements {
        for statement in constraint_statements(manager) {
            tx.execute(&statement, &[])?;
        }
    }

    tx.commit()
}

fn table_exists(manager: &Manager, tx: &mut Transaction) -> Result<bool, Error> {
    let rows = tx.query(
        &manager.provider().table_exists_sql(),
        &[Value::Text(manager.metadata_table().to_owned())],
    )?;

    // More than one row means the probe was not specific enough (e.g. the
    // table name exists in several schemas); treat only an exact hit as
    // existing.
    Ok(rows.len() == 1)
}

fn create_table_sql(manager: &Manager, ctp: &CreateTableParameters) -> String {
    let quoted = manager.provider().quote_identifier(manager.metadata_table());
    let constraints = ctp.constraints.replace("{table}", &quoted);
    format!(
        "CREATE TABLE {quoted} (\n  \
           serial_id  {serial_id},\n  \
           revision   {revision},\n  \
           previous   {previous},\n  \
           created_at {created_at}{constraints}\n\
         )",
        serial_id = ctp.serial_id,
        revision = ctp.revision,
        previous = ctp.previous,
        created_at = ctp.created_at,
    )
}

fn constraint_statements(manager: &Manager) -> Vec<String> {
    let table = manager.metadata_table();
    let quoted = manager.provider().quote_identifier(table);

    vec![
        format!("ALTER TABLE {quoted} ADD CONSTRAINT pk_{table}_revision PRIMARY KEY (revision)"),
        format!(
            "ALTER TABLE {quoted} ADD CONSTRAINT fk_{table}_previous \
             FOREIGN KEY (previous) REFERENCES {quoted} (revision)"
        ),
        format!("ALTER TABLE {quoted} ADD CONSTRAINT uq_{table}_serial_id UNIQUE (serial_id)"),
        format!("ALTER TABLE {quoted} ADD CONSTRAINT chk_{table}_serial_id CHECK (serial_id >= 0)"),
        format!("ALTER TABLE {quoted} ADD CONSTRAINT uq_{table}_previous UNIQUE (previous)"),
        format!(
            "ALTER TABLE {quoted} ADD CONSTRAINT chk_{table}_previous_neq_revision \
             CHECK (previous != revision)"
        ),
        format!(
            "ALTER TABLE {quoted} ADD CONSTRAINT chk_{table}_null_previous CHECK (\
             (serial_id = 0 AND previous IS NULL) OR \
             (serial_id != 0 AND previous IS NOT NULL))"
        ),
    ]
}
