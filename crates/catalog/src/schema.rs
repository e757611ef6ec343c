//! SQLite schema DDL and helper utilities for catalog initialization.

use rusqlite::{Connection, Error as SqliteError, ErrorCode};
use tracing::warn;

/// SQLite schema version supported by this build.
pub const TARGET_SCHEMA_VERSION: i64 = 1;

/// Packed SQL definition for the complete catalog schema.
pub const CATALOG_SCHEMA_SQL: &str = include_str!("../schema/catalog_schema.sql");

/// Applies the catalog schema (or upgrades an existing catalog) on the provided connection.
///
/// The helper enforces WAL journaling + foreign keys, runs any pending migrations
/// inside one transaction, and keeps `PRAGMA user_version` aligned with
/// [`TARGET_SCHEMA_VERSION`]. Catalogs written by a newer build are refused.
pub fn initialize_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", true)?;

    let user_version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if user_version > TARGET_SCHEMA_VERSION {
        return Err(newer_schema_error(user_version));
    }

    if user_version < TARGET_SCHEMA_VERSION {
        conn.execute_batch("BEGIN IMMEDIATE")?;
        let applied = apply_migrations(conn, user_version)
            .and_then(|_| conn.pragma_update(None, "user_version", TARGET_SCHEMA_VERSION));
        match applied {
            Ok(()) => conn.execute_batch("COMMIT")?,
            Err(err) => {
                if let Err(rollback_err) = conn.execute_batch("ROLLBACK") {
                    warn!(error = %rollback_err, "rolling back failed schema migration failed");
                }
                return Err(err);
            }
        }
    }
    Ok(())
}

fn apply_migrations(conn: &Connection, from_version: i64) -> rusqlite::Result<()> {
    match from_version {
        0 => {
            conn.execute_batch(CATALOG_SCHEMA_SQL)?;
        }
        _ => {
            return Err(newer_schema_error(from_version));
        }
    }
    Ok(())
}

fn newer_schema_error(version: i64) -> SqliteError {
    SqliteError::SqliteFailure(
        rusqlite::ffi::Error {
            code: ErrorCode::DatabaseCorrupt,
            extended_code: 0,
        },
        Some(format!(
            "catalog schema version {version} is newer than supported {TARGET_SCHEMA_VERSION}"
        )),
    )
}
