//! SQLite schema creation and migration for the discovery store.

use rusqlite::Connection;

/// Current schema version.
const SCHEMA_VERSION: u32 = 2;

/// Run all migrations to bring the database up to date.
pub fn run_migrations(conn: &Connection) -> Result<(), rusqlite::Error> {
    let current_version = get_schema_version(conn);

    if current_version < 1 {
        migrate_v1(conn)?;
    }

    if current_version < 2 {
        migrate_v2(conn)?;
    }

    set_schema_version(conn, SCHEMA_VERSION)?;
    Ok(())
}

fn get_schema_version(conn: &Connection) -> u32 {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
        .unwrap_or(0)
}

fn set_schema_version(conn: &Connection, version: u32) -> Result<(), rusqlite::Error> {
    conn.pragma_update(None, "user_version", version)
}

/// Version 1: server records.
fn migrate_v1(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS server_records (
            name TEXT PRIMARY KEY,
            description TEXT NOT NULL,
            config TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        ",
    )
}

/// Version 2: state column so liveness sweeps don't parse every config.
fn migrate_v2(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        ALTER TABLE server_records ADD COLUMN state TEXT NOT NULL DEFAULT 'running';
        CREATE INDEX IF NOT EXISTS idx_server_records_state ON server_records(state);
        UPDATE server_records SET state = COALESCE(json_extract(config, '$.state'), 'running');
        ",
    )
}
