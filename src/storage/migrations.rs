//! The ordered schema migration chain.
//!
//! Each entry maps one version tag to one forward transformation. The chain
//! is data: adding a schema version means appending one entry here and
//! never touching the ones before it. There are no down-migrations.
//!
//! The runner lives in [`crate::storage::version`]; this module only knows
//! how to transform the tables.

use crate::storage::schema::{column_exists, BASE_SCHEMA_SQL};
use rusqlite::{params, Connection, Result};
use tracing::debug;

/// A single forward migration step.
pub struct Migration {
    pub version: &'static str,
    pub description: &'static str,
    pub apply: fn(&Connection) -> Result<()>,
}

/// All migrations in order, oldest first.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: "v0.9.0.a",
        description: "base schema",
        apply: base_schema,
    },
    Migration {
        version: "v1.2.0.a",
        description: "lookup indexes for trials and attributes",
        apply: lookup_indexes,
    },
    Migration {
        version: "v1.3.0.a",
        description: "trial number column with per-study uniqueness",
        apply: trial_numbers,
    },
    Migration {
        version: "v2.4.0.a",
        description: "multi-objective directions and values",
        apply: multi_objective,
    },
    Migration {
        version: "v2.6.0.a",
        description: "trial heartbeats",
        apply: trial_heartbeats,
    },
];

/// Integer schema version of the head tag (1-based position in the chain).
pub const HEAD_SCHEMA_VERSION: i64 = MIGRATIONS.len() as i64;

/// The newest tag known to this library.
#[must_use]
pub fn head_tag() -> &'static str {
    MIGRATIONS[MIGRATIONS.len() - 1].version
}

/// Position of a tag in the chain, if it is known.
#[must_use]
pub fn position(tag: &str) -> Option<usize> {
    MIGRATIONS.iter().position(|m| m.version == tag)
}

fn base_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(BASE_SCHEMA_SQL)
}

fn lookup_indexes(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS ix_trials_study_id ON trials(study_id);
         CREATE INDEX IF NOT EXISTS ix_trials_study_state ON trials(study_id, state);
         CREATE INDEX IF NOT EXISTS ix_trial_params_name ON trial_params(param_name);",
    )
}

/// Promote the trial number from the `_number` system attribute to a column.
///
/// Legacy numbers are kept as-is; trials that never recorded one are
/// numbered after the highest existing number of their study, in creation
/// order.
fn trial_numbers(conn: &Connection) -> Result<()> {
    if !column_exists(conn, "trials", "number")? {
        conn.execute_batch("ALTER TABLE trials ADD COLUMN number INTEGER")?;
    }

    conn.execute_batch(
        "UPDATE trials SET number = (
             SELECT CAST(a.value_json AS INTEGER) FROM trial_system_attributes a
             WHERE a.trial_id = trials.trial_id AND a.key = '_number'
         )
         WHERE number IS NULL",
    )?;

    let missing: Vec<i64> = conn
        .prepare("SELECT trial_id FROM trials WHERE number IS NULL ORDER BY study_id, trial_id")?
        .query_map([], |row| row.get(0))?
        .collect::<Result<_>>()?;
    for trial_id in &missing {
        conn.execute(
            "UPDATE trials SET number = (
                 SELECT COALESCE(MAX(t.number), -1) + 1 FROM trials t
                 WHERE t.study_id = trials.study_id
             )
             WHERE trial_id = ?1",
            params![trial_id],
        )?;
    }
    debug!(backfilled = missing.len(), "Numbered trials without a legacy number");

    conn.execute_batch(
        "DELETE FROM trial_system_attributes WHERE key = '_number';
         CREATE UNIQUE INDEX IF NOT EXISTS ix_trials_study_id_number ON trials(study_id, number);",
    )
}

/// Split single-objective columns into per-objective tables.
///
/// Non-finite floats cannot round-trip through REAL columns (NaN becomes
/// NULL), so values gain a `*_type` column naming FINITE, INF_POS, INF_NEG
/// or NAN.
fn multi_objective(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS study_directions (
             study_direction_id INTEGER PRIMARY KEY,
             study_id INTEGER NOT NULL,
             objective INTEGER NOT NULL,
             direction TEXT NOT NULL CHECK (direction IN ('MINIMIZE', 'MAXIMIZE')),
             UNIQUE (study_id, objective),
             FOREIGN KEY (study_id) REFERENCES studies(study_id) ON DELETE CASCADE
         );

         INSERT INTO study_directions (study_id, objective, direction)
         SELECT study_id, 0, CASE WHEN direction = 'MAXIMIZE' THEN 'MAXIMIZE' ELSE 'MINIMIZE' END
         FROM studies;

         CREATE TABLE IF NOT EXISTS trial_values (
             trial_value_id INTEGER PRIMARY KEY,
             trial_id INTEGER NOT NULL,
             objective INTEGER NOT NULL,
             value REAL,
             value_type TEXT NOT NULL,
             UNIQUE (trial_id, objective),
             FOREIGN KEY (trial_id) REFERENCES trials(trial_id) ON DELETE CASCADE
         );

         INSERT INTO trial_values (trial_id, objective, value, value_type)
         SELECT trial_id, 0, value, 'FINITE' FROM trials WHERE value IS NOT NULL;

         ALTER TABLE trial_intermediate_values
             ADD COLUMN intermediate_value_type TEXT NOT NULL DEFAULT 'FINITE';
         UPDATE trial_intermediate_values SET intermediate_value_type = 'NAN'
         WHERE intermediate_value IS NULL;

         ALTER TABLE studies DROP COLUMN direction;
         ALTER TABLE trials DROP COLUMN value;",
    )
}

fn trial_heartbeats(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS trial_heartbeats (
             trial_heartbeat_id INTEGER PRIMARY KEY,
             trial_id INTEGER NOT NULL UNIQUE,
             heartbeat INTEGER NOT NULL,
             FOREIGN KEY (trial_id) REFERENCES trials(trial_id) ON DELETE CASCADE
         );",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_is_ordered_and_unique() {
        assert_eq!(MIGRATIONS.len(), 5);
        assert_eq!(head_tag(), "v2.6.0.a");
        assert_eq!(HEAD_SCHEMA_VERSION, 5);

        let tags: Vec<&str> = MIGRATIONS.iter().map(|m| m.version).collect();
        let mut sorted = tags.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(tags, sorted);
        assert_eq!(position("v1.3.0.a"), Some(2));
        assert_eq!(position("v9.9.9.a"), None);
    }

    #[test]
    fn test_full_chain_on_empty_database() {
        let conn = Connection::open_in_memory().unwrap();
        for migration in MIGRATIONS {
            (migration.apply)(&conn).unwrap_or_else(|e| panic!("{}: {e}", migration.version));
        }

        assert!(column_exists(&conn, "trials", "number").unwrap());
        assert!(!column_exists(&conn, "trials", "value").unwrap());
        assert!(!column_exists(&conn, "studies", "direction").unwrap());
        for table in crate::storage::schema::HEAD_TABLES {
            assert!(
                crate::storage::schema::table_exists(&conn, table).unwrap(),
                "missing table {table}"
            );
        }
    }

    #[test]
    fn test_trial_numbers_keep_legacy_and_fill_gaps() {
        let conn = Connection::open_in_memory().unwrap();
        base_schema(&conn).unwrap();
        lookup_indexes(&conn).unwrap();

        conn.execute_batch(
            "INSERT INTO studies (study_id, study_name, direction) VALUES (1, 's', 'MINIMIZE');
             INSERT INTO trials (trial_id, study_id, state) VALUES (10, 1, 'COMPLETE');
             INSERT INTO trials (trial_id, study_id, state) VALUES (11, 1, 'COMPLETE');
             INSERT INTO trials (trial_id, study_id, state) VALUES (12, 1, 'RUNNING');
             INSERT INTO trial_system_attributes (trial_id, key, value_json) VALUES (10, '_number', '0');
             INSERT INTO trial_system_attributes (trial_id, key, value_json) VALUES (11, '_number', '1');
             INSERT INTO trial_system_attributes (trial_id, key, value_json) VALUES (11, 'keep', '\"x\"');",
        )
        .unwrap();

        trial_numbers(&conn).unwrap();

        let numbers: Vec<(i64, i64)> = conn
            .prepare("SELECT trial_id, number FROM trials ORDER BY trial_id")
            .unwrap()
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(numbers, vec![(10, 0), (11, 1), (12, 2)]);

        let remaining: i64 = conn
            .query_row("SELECT COUNT(*) FROM trial_system_attributes", [], |row| row.get(0))
            .unwrap();
        assert_eq!(remaining, 1);
    }

    #[test]
    fn test_multi_objective_moves_values() {
        let conn = Connection::open_in_memory().unwrap();
        for migration in &MIGRATIONS[..3] {
            (migration.apply)(&conn).unwrap();
        }
        conn.execute_batch(
            "INSERT INTO studies (study_id, study_name, direction) VALUES (1, 's', 'MAXIMIZE');
             INSERT INTO trials (trial_id, study_id, number, state, value) VALUES (1, 1, 0, 'COMPLETE', 2.5);
             INSERT INTO trials (trial_id, study_id, number, state) VALUES (2, 1, 1, 'RUNNING');
             INSERT INTO trial_intermediate_values (trial_id, step, intermediate_value) VALUES (1, 0, 0.5);
             INSERT INTO trial_intermediate_values (trial_id, step, intermediate_value) VALUES (1, 1, NULL);",
        )
        .unwrap();

        multi_objective(&conn).unwrap();

        let direction: String = conn
            .query_row("SELECT direction FROM study_directions WHERE study_id = 1", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(direction, "MAXIMIZE");

        let value: f64 = conn
            .query_row("SELECT value FROM trial_values WHERE trial_id = 1", [], |row| row.get(0))
            .unwrap();
        assert!((value - 2.5).abs() < f64::EPSILON);
        let n_values: i64 = conn
            .query_row("SELECT COUNT(*) FROM trial_values", [], |row| row.get(0))
            .unwrap();
        assert_eq!(n_values, 1);

        let nan_type: String = conn
            .query_row(
                "SELECT intermediate_value_type FROM trial_intermediate_values WHERE step = 1",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(nan_type, "NAN");
    }
}
