//! Ordered schema steps. Each step and its `schema_migrations` row commit in
//! one `BEGIN IMMEDIATE` transaction, so a worker and a poller opening the
//! same file at once never apply a step twice.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, Transaction, TransactionBehavior};
use tracing::info;

use crate::db::{schema, timestamp};

struct Migration {
    version: u32,
    name: &'static str,
    apply: fn(&Connection) -> rusqlite::Result<()>,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "tenants, processed messages, rate limits, queue, knowledge",
        apply: schema::create_core_tables,
    },
    Migration {
        version: 2,
        name: "send reservation log",
        apply: schema::create_send_reservations,
    },
];

pub fn latest_version() -> u32 {
    MIGRATIONS.last().map_or(0, |step| step.version)
}

pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL
        );
        "#,
    )
    .context("ensure schema_migrations table")?;

    let current = current_schema_version(conn)?;
    let latest = latest_version();
    if current > latest {
        return Err(anyhow!(
            "database schema version {current} is newer than supported version {latest}"
        ));
    }

    for step in MIGRATIONS.iter().filter(|step| step.version > current) {
        apply_step(conn, step)?;
    }
    Ok(())
}

fn apply_step(conn: &Connection, step: &Migration) -> Result<()> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
        .with_context(|| format!("begin migration v{}", step.version))?;

    // Another connection may have applied the step while this one waited.
    let applied: bool = tx.query_row(
        "SELECT EXISTS(SELECT 1 FROM schema_migrations WHERE version = ?)",
        [step.version],
        |row| row.get(0),
    )?;
    if !applied {
        (step.apply)(&tx)
            .with_context(|| format!("apply migration v{} ({})", step.version, step.name))?;
        tx.execute(
            "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?, ?, ?)",
            params![step.version, step.name, timestamp(Utc::now())],
        )?;
        info!(version = step.version, name = step.name, "applied schema migration");
    }

    tx.commit()
        .with_context(|| format!("commit migration v{}", step.version))
}

fn current_schema_version(conn: &Connection) -> Result<u32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )
    .context("read current schema version")
}
