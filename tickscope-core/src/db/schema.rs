//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: capture sources and upload dedup index
    r#"
    CREATE TABLE IF NOT EXISTS capture_sources (
        capture_id       TEXT PRIMARY KEY,
        locator          TEXT NOT NULL,
        display_name     TEXT NOT NULL,
        stream_mode      TEXT NOT NULL DEFAULT 'lite',
        origin           TEXT NOT NULL,
        poll_interval_ms INTEGER,
        live             INTEGER NOT NULL DEFAULT 0,
        created_at       DATETIME NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_capture_sources_live ON capture_sources(live);

    CREATE TABLE IF NOT EXISTS uploads (
        content_hash TEXT PRIMARY KEY,
        file_name    TEXT NOT NULL,
        size_bytes   INTEGER NOT NULL,
        capture_id   TEXT NOT NULL,
        uploaded_at  DATETIME NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_uploads_capture ON uploads(capture_id);
    "#,
    // Version 2: derivation plugins
    r#"
    CREATE TABLE IF NOT EXISTS plugins (
        id               TEXT PRIMARY KEY,
        name             TEXT NOT NULL,
        min_inputs       INTEGER NOT NULL,
        max_inputs       INTEGER NOT NULL,
        output_keys      TEXT NOT NULL,       -- JSON array
        content_hash     TEXT NOT NULL,
        file_name        TEXT NOT NULL,
        valid            INTEGER NOT NULL,
        validation_error TEXT,
        created_at       DATETIME NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_plugins_hash ON plugins(content_hash);
    "#,
];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let current_version: i32 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap_or(0);

    tracing::info!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking database migrations"
    );

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute(&format!("PRAGMA user_version = {}", version), [])?;
        }
    }

    if current_version < SCHEMA_VERSION {
        tracing::info!(
            from = current_version,
            to = SCHEMA_VERSION,
            "Migrations complete"
        );
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> crate::error::Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_idempotent() {
        let conn = Connection::open_in_memory().unwrap();

        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let version = get_schema_version(&conn).unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_tables_created() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        for table in ["capture_sources", "uploads", "plugins"] {
            let exists: i32 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?",
                    [table],
                    |r| r.get(0),
                )
                .unwrap();
            assert_eq!(exists, 1, "Table {} should exist", table);
        }
    }
}
