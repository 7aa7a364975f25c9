//! Database schema definitions.
//!
//! The schema is never created in one shot. A pristine store is brought up
//! by replaying the migration chain from the base layout below, so a fresh
//! store and an upgraded old store always end in the same shape.
//!
//! Timestamps are stored as INTEGER (Unix milliseconds). Attribute values are
//! stored as JSON text. Every trial sub-table is keyed by `(trial_id, name)`
//! or `(trial_id, step)` and cascades on trial deletion.

use rusqlite::{Connection, Result};

/// Base layout, tagged `v0.9.0.a`.
///
/// Single-objective only: the direction lives on `studies`, the objective
/// value on `trials`, and the trial number in the `_number` system attribute.
pub const BASE_SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS version_info (
    version_info_id INTEGER PRIMARY KEY CHECK (version_info_id = 1),
    schema_version INTEGER NOT NULL,
    schema_tag TEXT NOT NULL,
    library_version TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS studies (
    study_id INTEGER PRIMARY KEY,
    study_name TEXT NOT NULL UNIQUE,
    direction TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS study_user_attributes (
    study_user_attribute_id INTEGER PRIMARY KEY,
    study_id INTEGER NOT NULL,
    key TEXT NOT NULL,
    value_json TEXT NOT NULL,
    UNIQUE (study_id, key),
    FOREIGN KEY (study_id) REFERENCES studies(study_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS study_system_attributes (
    study_system_attribute_id INTEGER PRIMARY KEY,
    study_id INTEGER NOT NULL,
    key TEXT NOT NULL,
    value_json TEXT NOT NULL,
    UNIQUE (study_id, key),
    FOREIGN KEY (study_id) REFERENCES studies(study_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS trials (
    trial_id INTEGER PRIMARY KEY,
    study_id INTEGER NOT NULL,
    state TEXT NOT NULL,
    value REAL,
    datetime_start INTEGER,
    datetime_complete INTEGER,
    FOREIGN KEY (study_id) REFERENCES studies(study_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS trial_params (
    param_id INTEGER PRIMARY KEY,
    trial_id INTEGER NOT NULL,
    param_name TEXT NOT NULL,
    param_value REAL NOT NULL,
    distribution_json TEXT NOT NULL,
    UNIQUE (trial_id, param_name),
    FOREIGN KEY (trial_id) REFERENCES trials(trial_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS trial_user_attributes (
    trial_user_attribute_id INTEGER PRIMARY KEY,
    trial_id INTEGER NOT NULL,
    key TEXT NOT NULL,
    value_json TEXT NOT NULL,
    UNIQUE (trial_id, key),
    FOREIGN KEY (trial_id) REFERENCES trials(trial_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS trial_system_attributes (
    trial_system_attribute_id INTEGER PRIMARY KEY,
    trial_id INTEGER NOT NULL,
    key TEXT NOT NULL,
    value_json TEXT NOT NULL,
    UNIQUE (trial_id, key),
    FOREIGN KEY (trial_id) REFERENCES trials(trial_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS trial_intermediate_values (
    trial_intermediate_value_id INTEGER PRIMARY KEY,
    trial_id INTEGER NOT NULL,
    step INTEGER NOT NULL,
    intermediate_value REAL,
    UNIQUE (trial_id, step),
    FOREIGN KEY (trial_id) REFERENCES trials(trial_id) ON DELETE CASCADE
);
";

/// Every logical table present at the head version.
pub const HEAD_TABLES: &[&str] = &[
    "studies",
    "study_directions",
    "study_user_attributes",
    "study_system_attributes",
    "trials",
    "trial_params",
    "trial_values",
    "trial_intermediate_values",
    "trial_user_attributes",
    "trial_system_attributes",
    "trial_heartbeats",
    "version_info",
];

/// SQL expression for "now" in Unix milliseconds, evaluated by the store.
///
/// Liveness is judged on the store's clock so that workers on different
/// machines never compare their own wall clocks.
pub const STORE_NOW_MS: &str = "CAST((julianday('now') - 2440587.5) * 86400000.0 AS INTEGER)";

/// Apply database-wide pragmas.
///
/// WAL is persistent in the file header, so it only has to be requested
/// once per file; in-memory stores keep their own journal mode.
///
/// # Errors
///
/// Returns an error if a pragma fails.
pub fn apply_pragmas(conn: &Connection, is_memory: bool) -> Result<()> {
    if !is_memory {
        let mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            conn.pragma_update(None, "journal_mode", "WAL")?;
        }
    }
    conn.pragma_update(None, "cache_size", "-64000")?; // 64MB cache
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    Ok(())
}

/// Check if a table exists.
///
/// # Errors
///
/// Returns an error if the catalog query fails.
pub fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    conn.prepare("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1")?
        .exists([table])
}

/// Check if a column exists in a table.
///
/// # Errors
///
/// Returns an error if the catalog query fails.
pub fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let sql = format!("SELECT 1 FROM pragma_table_info('{table}') WHERE name = ?1");
    conn.prepare(&sql)?.exists([column])
}

/// A store is pristine when neither the version table nor any data table
/// exists yet.
///
/// # Errors
///
/// Returns an error if the catalog query fails.
pub fn is_pristine(conn: &Connection) -> Result<bool> {
    Ok(!table_exists(conn, "version_info")? && !table_exists(conn, "studies")?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_schema_applies() {
        let conn = Connection::open_in_memory().unwrap();
        assert!(is_pristine(&conn).unwrap());

        conn.execute_batch(BASE_SCHEMA_SQL).expect("Failed to apply base schema");
        assert!(!is_pristine(&conn).unwrap());
        assert!(table_exists(&conn, "trials").unwrap());
        assert!(column_exists(&conn, "trials", "value").unwrap());
        assert!(!column_exists(&conn, "trials", "number").unwrap());
    }

    #[test]
    fn test_base_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(BASE_SCHEMA_SQL).expect("First apply failed");
        conn.execute_batch(BASE_SCHEMA_SQL).expect("Second apply failed");
    }

    #[test]
    fn test_version_info_is_singleton() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(BASE_SCHEMA_SQL).unwrap();

        let ok = conn.execute(
            "INSERT INTO version_info VALUES (1, 1, 'v0.9.0.a', '0.1.0')",
            [],
        );
        assert!(ok.is_ok());
        let dup = conn.execute(
            "INSERT INTO version_info VALUES (2, 1, 'v0.9.0.a', '0.1.0')",
            [],
        );
        assert!(dup.is_err());
    }

    #[test]
    fn test_store_now_is_recent() {
        let conn = Connection::open_in_memory().unwrap();
        let store_now: i64 = conn
            .query_row(&format!("SELECT {STORE_NOW_MS}"), [], |row| row.get(0))
            .unwrap();
        let local_now = chrono::Utc::now().timestamp_millis();
        assert!((store_now - local_now).abs() < 5_000);
    }

    #[test]
    fn test_pragmas_enable_wal_for_files() {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::open(dir.path().join("wal.db")).unwrap();
        apply_pragmas(&conn, false).unwrap();

        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }
}
