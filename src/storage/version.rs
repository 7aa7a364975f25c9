//! Schema version management.
//!
//! The `version_info` singleton records which migration tag the store is at.
//! Opening a store compares it with the head tag of this library and refuses
//! to continue on mismatch unless the caller explicitly bypasses the check
//! (which is what an upgrade tool does before calling [`VersionManager::upgrade`]).

use crate::error::{Error, Result};
use crate::storage::migrations::{head_tag, position, MIGRATIONS};
use crate::storage::schema::{is_pristine, table_exists};
use crate::storage::transaction::with_transaction;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

/// Version of the library writing to the store.
pub const LIBRARY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Contents of the `version_info` singleton row.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct VersionInfo {
    pub schema_version: i64,
    pub schema_tag: String,
    pub library_version: String,
}

/// Reads and advances the schema version of one store.
pub struct VersionManager<'conn> {
    conn: &'conn Connection,
}

impl<'conn> VersionManager<'conn> {
    #[must_use]
    pub const fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    /// The newest tag known to this library.
    #[must_use]
    pub fn head_version(&self) -> &'static str {
        head_tag()
    }

    /// Every known tag, newest first.
    #[must_use]
    pub fn all_versions(&self) -> Vec<&'static str> {
        MIGRATIONS.iter().rev().map(|m| m.version).collect()
    }

    /// The tag the store is at.
    ///
    /// A pristine store is initialized at the head version first.
    ///
    /// # Errors
    ///
    /// Returns an error if initialization fails, or
    /// [`Error::UnknownSchemaVersion`] if tables exist without a version row.
    pub fn current_version(&self) -> Result<String> {
        if is_pristine(self.conn)? {
            self.upgrade()?;
        }
        Ok(self.version_info()?.schema_tag)
    }

    /// The full `version_info` row.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownSchemaVersion`] if the store has data tables
    /// but no version row.
    pub fn version_info(&self) -> Result<VersionInfo> {
        read_version_info(self.conn)?.ok_or_else(|| Error::UnknownSchemaVersion {
            version: "<missing>".to_string(),
        })
    }

    /// Fail unless the store is at the head version.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SchemaIncompatible`] on mismatch, or
    /// [`Error::UnknownSchemaVersion`] if the tag is not in this library's
    /// chain (a newer library wrote it).
    pub fn check_compatibility(&self, skip: bool) -> Result<()> {
        if skip {
            return Ok(());
        }

        let current = self.current_version()?;
        if position(&current).is_none() {
            return Err(Error::UnknownSchemaVersion { version: current });
        }
        if current != self.head_version() {
            return Err(Error::SchemaIncompatible {
                current,
                head: self.head_version().to_string(),
            });
        }
        Ok(())
    }

    /// Apply every pending migration, oldest first.
    ///
    /// Each step runs in its own transaction together with the version bump,
    /// so a failing step leaves the store at the last completed tag and a
    /// rerun resumes from there. Returns the tags applied by this call; an
    /// empty list means the store was already at head.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Migration`] naming the failing step, or
    /// [`Error::UnknownSchemaVersion`] for a store ahead of this library.
    pub fn upgrade(&self) -> Result<Vec<&'static str>> {
        let mut applied = Vec::new();

        for (idx, migration) in MIGRATIONS.iter().enumerate() {
            let ran = with_transaction(self.conn, "upgrade", |tx| {
                // Re-read inside the write lock: another process may have
                // applied this step since we last looked.
                if let Some(done) = applied_position(tx)? {
                    if done >= idx {
                        return Ok(false);
                    }
                }

                info!(version = migration.version, "Applying migration");
                (migration.apply)(tx).map_err(|e| Error::Migration {
                    version: migration.version.to_string(),
                    message: e.to_string(),
                })?;
                write_version_info(tx, idx, migration.version)?;
                Ok(true)
            })?;

            if ran {
                info!(version = migration.version, "Migration complete");
                applied.push(migration.version);
            }
        }

        Ok(applied)
    }
}

/// Index of the last applied migration, `None` on a pristine store.
fn applied_position(conn: &Connection) -> Result<Option<usize>> {
    match read_version_info(conn)? {
        Some(info) => position(&info.schema_tag)
            .map(Some)
            .ok_or(Error::UnknownSchemaVersion {
                version: info.schema_tag,
            }),
        None if is_pristine(conn)? => Ok(None),
        None => Err(Error::UnknownSchemaVersion {
            version: "<missing>".to_string(),
        }),
    }
}

fn read_version_info(conn: &Connection) -> Result<Option<VersionInfo>> {
    if !table_exists(conn, "version_info")? {
        return Ok(None);
    }
    let info = conn
        .query_row(
            "SELECT schema_version, schema_tag, library_version FROM version_info
             WHERE version_info_id = 1",
            [],
            |row| {
                Ok(VersionInfo {
                    schema_version: row.get(0)?,
                    schema_tag: row.get(1)?,
                    library_version: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(info)
}

#[allow(clippy::cast_possible_wrap)]
fn write_version_info(conn: &Connection, idx: usize, tag: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO version_info (version_info_id, schema_version, schema_tag, library_version)
         VALUES (1, ?1, ?2, ?3)
         ON CONFLICT(version_info_id) DO UPDATE SET
             schema_version = excluded.schema_version,
             schema_tag = excluded.schema_tag,
             library_version = excluded.library_version",
        params![idx as i64 + 1, tag, LIBRARY_VERSION],
    )?;
    Ok(())
}

/// Bring a store up to (and including) `tag` only.
///
/// Used by tests to fabricate stores written by older library versions.
#[cfg(test)]
pub(crate) fn migrate_to(conn: &Connection, tag: &str) -> Result<()> {
    let target = position(tag).ok_or_else(|| Error::UnknownSchemaVersion {
        version: tag.to_string(),
    })?;
    for (idx, migration) in MIGRATIONS.iter().enumerate().take(target + 1) {
        with_transaction(conn, "migrate_to", |tx| {
            if applied_position(tx)?.is_some_and(|done| done >= idx) {
                return Ok(());
            }
            (migration.apply)(tx)?;
            write_version_info(tx, idx, migration.version)
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::migrations::HEAD_SCHEMA_VERSION;

    fn memory_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "foreign_keys", "ON").unwrap();
        conn
    }

    #[test]
    fn test_pristine_store_initializes_at_head() {
        let conn = memory_conn();
        let vm = VersionManager::new(&conn);

        assert_eq!(vm.current_version().unwrap(), vm.head_version());
        let info = vm.version_info().unwrap();
        assert_eq!(info.schema_version, HEAD_SCHEMA_VERSION);
        assert_eq!(info.library_version, LIBRARY_VERSION);
        vm.check_compatibility(false).unwrap();
    }

    #[test]
    fn test_all_versions_newest_first() {
        let conn = memory_conn();
        let vm = VersionManager::new(&conn);
        assert_eq!(
            vm.all_versions(),
            vec!["v2.6.0.a", "v2.4.0.a", "v1.3.0.a", "v1.2.0.a", "v0.9.0.a"]
        );
    }

    #[test]
    fn test_upgrade_at_head_is_noop() {
        let conn = memory_conn();
        let vm = VersionManager::new(&conn);
        let before = vm.current_version().unwrap();

        assert!(vm.upgrade().unwrap().is_empty());
        assert!(vm.upgrade().unwrap().is_empty());
        assert_eq!(vm.current_version().unwrap(), before);
    }

    #[test]
    fn test_old_store_is_incompatible_until_upgraded() {
        let conn = memory_conn();
        migrate_to(&conn, "v1.2.0.a").unwrap();
        let vm = VersionManager::new(&conn);

        assert_eq!(vm.current_version().unwrap(), "v1.2.0.a");
        let err = vm.check_compatibility(false).unwrap_err();
        assert!(matches!(err, Error::SchemaIncompatible { ref current, .. } if current == "v1.2.0.a"));
        vm.check_compatibility(true).unwrap();

        let applied = vm.upgrade().unwrap();
        assert_eq!(applied, vec!["v1.3.0.a", "v2.4.0.a", "v2.6.0.a"]);
        assert_eq!(vm.current_version().unwrap(), vm.head_version());
        vm.check_compatibility(false).unwrap();
    }

    #[test]
    fn test_failed_migration_keeps_previous_version() {
        let conn = memory_conn();
        migrate_to(&conn, "v1.2.0.a").unwrap();

        // Two trials claiming the same legacy number make the unique index
        // of v1.3.0.a impossible to build.
        conn.execute_batch(
            "INSERT INTO studies (study_id, study_name, direction) VALUES (1, 's', 'MINIMIZE');
             INSERT INTO trials (trial_id, study_id, state) VALUES (1, 1, 'COMPLETE');
             INSERT INTO trials (trial_id, study_id, state) VALUES (2, 1, 'COMPLETE');
             INSERT INTO trial_system_attributes (trial_id, key, value_json) VALUES (1, '_number', '0');
             INSERT INTO trial_system_attributes (trial_id, key, value_json) VALUES (2, '_number', '0');",
        )
        .unwrap();

        let vm = VersionManager::new(&conn);
        let err = vm.upgrade().unwrap_err();
        assert!(matches!(err, Error::Migration { ref version, .. } if version == "v1.3.0.a"));

        // Nothing of the failed step leaked.
        assert_eq!(vm.current_version().unwrap(), "v1.2.0.a");
        assert!(!crate::storage::schema::column_exists(&conn, "trials", "number").unwrap());
        let legacy: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM trial_system_attributes WHERE key = '_number'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(legacy, 2);

        // Fix the data and resume from the last good version.
        conn.execute(
            "UPDATE trial_system_attributes SET value_json = '1' WHERE trial_id = 2",
            [],
        )
        .unwrap();
        assert_eq!(vm.upgrade().unwrap(), vec!["v1.3.0.a", "v2.4.0.a", "v2.6.0.a"]);
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        let conn = memory_conn();
        let vm = VersionManager::new(&conn);
        vm.current_version().unwrap();
        conn.execute("UPDATE version_info SET schema_tag = 'v9.0.0.a'", [])
            .unwrap();

        assert!(matches!(
            vm.check_compatibility(false).unwrap_err(),
            Error::UnknownSchemaVersion { .. }
        ));
        assert!(matches!(vm.upgrade().unwrap_err(), Error::UnknownSchemaVersion { .. }));
    }

    #[test]
    fn test_tables_without_version_row() {
        let conn = memory_conn();
        conn.execute_batch("CREATE TABLE studies (study_id INTEGER PRIMARY KEY)")
            .unwrap();
        let vm = VersionManager::new(&conn);
        assert!(matches!(
            vm.current_version().unwrap_err(),
            Error::UnknownSchemaVersion { .. }
        ));
    }
}
