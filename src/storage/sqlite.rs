//! SQLite storage implementation.
//!
//! [`SqliteStorage`] is the explicit handle every caller goes through: it
//! owns one connection, the parsed locator it came from, and the settings it
//! was opened with. Opening a handle initializes a pristine store at the
//! head schema version, or gates access on schema compatibility otherwise.
//!
//! Study operations live here; trial operations are in `trials.rs` and
//! liveness tracking in `heartbeat.rs`, all as `impl SqliteStorage` blocks.
//!
//! Every write goes through [`with_transaction`]; multi-table reads go
//! through [`read_snapshot`] so they never straddle another writer's commit.

use crate::config::StorageConfig;
use crate::error::{is_unique_violation, Error, Result};
use crate::model::{StudyDirection, StudyId, StudySummary};
use crate::storage::schema::apply_pragmas;
use crate::storage::transaction::{read_snapshot, with_transaction};
use crate::storage::url::StorageUrl;
use crate::storage::version::{VersionInfo, VersionManager};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// SQLite-based trial storage.
#[derive(Debug)]
pub struct SqliteStorage {
    pub(crate) conn: Connection,
    pub(crate) url: StorageUrl,
    pub(crate) config: StorageConfig,
}

impl SqliteStorage {
    /// Open the store named by a locator string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] for a bad locator,
    /// [`Error::SchemaIncompatible`] for a store that needs an upgrade (unless
    /// `config.skip_compatibility_check` is set), or [`Error::Config`] for
    /// invalid settings.
    pub fn open(locator: &str, config: StorageConfig) -> Result<Self> {
        Self::open_url(StorageUrl::parse(locator)?, config)
    }

    /// Open the store at an already-parsed locator.
    ///
    /// # Errors
    ///
    /// See [`SqliteStorage::open`].
    pub fn open_url(url: StorageUrl, config: StorageConfig) -> Result<Self> {
        config.validate()?;

        let conn = url.connect(config.busy_timeout)?;
        apply_pragmas(&conn, url.is_memory())?;

        let versions = VersionManager::new(&conn);
        let current = versions.current_version()?;
        versions.check_compatibility(config.skip_compatibility_check)?;
        debug!(url = %url, version = %current, "Opened storage");

        Ok(Self { conn, url, config })
    }

    /// Open a private in-memory store (for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub fn open_memory() -> Result<Self> {
        Self::open_url(StorageUrl::memory(), StorageConfig::default())
    }

    /// Get a reference to the underlying connection (for read operations).
    #[must_use]
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    #[must_use]
    pub fn url(&self) -> &StorageUrl {
        &self.url
    }

    #[must_use]
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    // =================
    // Schema Versioning
    // =================

    #[must_use]
    pub fn version_manager(&self) -> VersionManager<'_> {
        VersionManager::new(&self.conn)
    }

    /// # Errors
    ///
    /// Returns an error if the version row cannot be read.
    pub fn current_version(&self) -> Result<String> {
        self.version_manager().current_version()
    }

    #[must_use]
    pub fn head_version(&self) -> &'static str {
        self.version_manager().head_version()
    }

    #[must_use]
    pub fn all_versions(&self) -> Vec<&'static str> {
        self.version_manager().all_versions()
    }

    /// # Errors
    ///
    /// Returns an error if the version row cannot be read.
    pub fn version_info(&self) -> Result<VersionInfo> {
        self.version_manager().version_info()
    }

    /// # Errors
    ///
    /// Returns [`Error::SchemaIncompatible`] unless the store is at head.
    pub fn check_compatibility(&self) -> Result<()> {
        self.version_manager()
            .check_compatibility(self.config.skip_compatibility_check)
    }

    /// Bring the store to the head schema version.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Migration`] naming the step that failed.
    pub fn upgrade(&self) -> Result<Vec<&'static str>> {
        self.version_manager().upgrade()
    }

    // ================
    // Study Operations
    // ================

    /// Create a new study.
    ///
    /// Without a name, a unique `no-name-<uuid>` name is generated.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateStudyName`] if the name is taken, or
    /// [`Error::InvalidArgument`] if no direction is given.
    pub fn create_study(
        &self,
        name: Option<&str>,
        directions: &[StudyDirection],
    ) -> Result<StudyId> {
        if directions.is_empty() {
            return Err(Error::InvalidArgument(
                "a study needs at least one direction".to_string(),
            ));
        }

        let name = name.map_or_else(
            || format!("no-name-{}", uuid::Uuid::new_v4()),
            ToString::to_string,
        );

        let study_id = with_transaction(&self.conn, "create_study", |tx| {
            tx.execute("INSERT INTO studies (study_name) VALUES (?1)", [&name])
                .map_err(|e| {
                    if is_unique_violation(&e) {
                        Error::DuplicateStudyName { name: name.clone() }
                    } else {
                        Error::Database(e)
                    }
                })?;
            let study_id = tx.last_insert_rowid();

            let mut stmt = tx.prepare(
                "INSERT INTO study_directions (study_id, objective, direction) VALUES (?1, ?2, ?3)",
            )?;
            for (objective, direction) in directions.iter().enumerate() {
                stmt.execute(params![study_id, objective, direction.as_str()])?;
            }
            Ok(study_id)
        })?;

        info!(study_id, name = %name, "Created study");
        Ok(study_id)
    }

    /// Look up a study by its unique name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StudyNotFound`] if no study has this name.
    pub fn get_study_id_from_name(&self, name: &str) -> Result<StudyId> {
        self.conn
            .query_row(
                "SELECT study_id FROM studies WHERE study_name = ?1",
                [name],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| Error::StudyNotFound {
                id: name.to_string(),
            })
    }

    /// # Errors
    ///
    /// Returns [`Error::StudyNotFound`] if the study does not exist.
    pub fn get_study_name(&self, study_id: StudyId) -> Result<String> {
        self.conn
            .query_row(
                "SELECT study_name FROM studies WHERE study_id = ?1",
                [study_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| Error::StudyNotFound {
                id: study_id.to_string(),
            })
    }

    /// Directions of a study, in objective order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StudyNotFound`] if the study does not exist.
    pub fn get_study_directions(&self, study_id: StudyId) -> Result<Vec<StudyDirection>> {
        read_snapshot(&self.conn, |conn| load_directions(conn, study_id))
    }

    /// # Errors
    ///
    /// Returns [`Error::StudyNotFound`] if the study does not exist.
    pub fn get_study_user_attrs(&self, study_id: StudyId) -> Result<BTreeMap<String, Value>> {
        read_snapshot(&self.conn, |conn| {
            ensure_study(conn, study_id)?;
            load_attrs(conn, AttrTable::StudyUser, study_id)
        })
    }

    /// # Errors
    ///
    /// Returns [`Error::StudyNotFound`] if the study does not exist.
    pub fn get_study_system_attrs(&self, study_id: StudyId) -> Result<BTreeMap<String, Value>> {
        read_snapshot(&self.conn, |conn| {
            ensure_study(conn, study_id)?;
            load_attrs(conn, AttrTable::StudySystem, study_id)
        })
    }

    /// Set a study user attribute, overwriting any value under the same key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StudyNotFound`] if the study does not exist.
    pub fn set_study_user_attr(&self, study_id: StudyId, key: &str, value: &Value) -> Result<()> {
        with_transaction(&self.conn, "set_study_user_attr", |tx| {
            ensure_study(tx, study_id)?;
            upsert_attr(tx, AttrTable::StudyUser, study_id, key, value)
        })
    }

    /// Set a study system attribute, overwriting any value under the same key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StudyNotFound`] if the study does not exist.
    pub fn set_study_system_attr(
        &self,
        study_id: StudyId,
        key: &str,
        value: &Value,
    ) -> Result<()> {
        with_transaction(&self.conn, "set_study_system_attr", |tx| {
            ensure_study(tx, study_id)?;
            upsert_attr(tx, AttrTable::StudySystem, study_id, key, value)
        })
    }

    /// Delete a study together with all of its trials and their rows.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StudyNotFound`] if the study does not exist.
    pub fn delete_study(&self, study_id: StudyId) -> Result<()> {
        with_transaction(&self.conn, "delete_study", |tx| {
            let deleted = tx.execute("DELETE FROM studies WHERE study_id = ?1", [study_id])?;
            if deleted == 0 {
                return Err(Error::StudyNotFound {
                    id: study_id.to_string(),
                });
            }
            Ok(())
        })?;

        info!(study_id, "Deleted study");
        Ok(())
    }

    /// Summaries of every stored study, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_all_studies(&self) -> Result<Vec<StudySummary>> {
        read_snapshot(&self.conn, |conn| {
            let studies: Vec<(StudyId, String)> = conn
                .prepare("SELECT study_id, study_name FROM studies ORDER BY study_id")?
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<_>>()?;

            let mut summaries = Vec::with_capacity(studies.len());
            for (study_id, study_name) in studies {
                let directions = load_directions(conn, study_id)?;
                let (n_trials, started): (i64, Option<i64>) = conn.query_row(
                    "SELECT COUNT(*), MIN(datetime_start) FROM trials WHERE study_id = ?1",
                    [study_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                let best_trial = if directions.len() == 1 {
                    crate::storage::trials::best_trial(conn, study_id, directions[0])?
                } else {
                    None
                };

                summaries.push(StudySummary {
                    study_id,
                    study_name,
                    directions,
                    user_attrs: load_attrs(conn, AttrTable::StudyUser, study_id)?,
                    system_attrs: load_attrs(conn, AttrTable::StudySystem, study_id)?,
                    n_trials: usize::try_from(n_trials).unwrap_or_default(),
                    datetime_start: from_millis(started),
                    best_trial,
                });
            }
            Ok(summaries)
        })
    }
}

// ============
// Row Helpers
// ============

/// The four key/value attribute tables share one layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AttrTable {
    StudyUser,
    StudySystem,
    TrialUser,
    TrialSystem,
}

impl AttrTable {
    pub(crate) const fn table(self) -> &'static str {
        match self {
            Self::StudyUser => "study_user_attributes",
            Self::StudySystem => "study_system_attributes",
            Self::TrialUser => "trial_user_attributes",
            Self::TrialSystem => "trial_system_attributes",
        }
    }

    pub(crate) const fn owner_column(self) -> &'static str {
        match self {
            Self::StudyUser | Self::StudySystem => "study_id",
            Self::TrialUser | Self::TrialSystem => "trial_id",
        }
    }
}

pub(crate) fn ensure_study(conn: &Connection, study_id: StudyId) -> Result<()> {
    let exists = conn
        .prepare_cached("SELECT 1 FROM studies WHERE study_id = ?1")?
        .exists([study_id])?;
    if exists {
        Ok(())
    } else {
        Err(Error::StudyNotFound {
            id: study_id.to_string(),
        })
    }
}

pub(crate) fn load_directions(conn: &Connection, study_id: StudyId) -> Result<Vec<StudyDirection>> {
    let directions: Vec<String> = conn
        .prepare_cached(
            "SELECT direction FROM study_directions WHERE study_id = ?1 ORDER BY objective",
        )?
        .query_map([study_id], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;

    if directions.is_empty() {
        // Every study has at least one direction, so none means no study.
        ensure_study(conn, study_id)?;
    }

    directions
        .iter()
        .map(|d| d.parse::<StudyDirection>())
        .collect()
}

pub(crate) fn load_attrs(
    conn: &Connection,
    table: AttrTable,
    owner: i64,
) -> Result<BTreeMap<String, Value>> {
    let sql = format!(
        "SELECT key, value_json FROM {} WHERE {} = ?1",
        table.table(),
        table.owner_column()
    );
    let rows: Vec<(String, String)> = conn
        .prepare_cached(&sql)?
        .query_map([owner], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<_>>()?;

    rows.into_iter()
        .map(|(key, json)| Ok((key, serde_json::from_str(&json)?)))
        .collect()
}

pub(crate) fn upsert_attr(
    conn: &Connection,
    table: AttrTable,
    owner: i64,
    key: &str,
    value: &Value,
) -> Result<()> {
    let owner_column = table.owner_column();
    let sql = format!(
        "INSERT INTO {table} ({owner_column}, key, value_json) VALUES (?1, ?2, ?3)
         ON CONFLICT({owner_column}, key) DO UPDATE SET value_json = excluded.value_json",
        table = table.table(),
    );
    conn.prepare_cached(&sql)?
        .execute(params![owner, key, serde_json::to_string(value)?])?;
    Ok(())
}

// ==================
// Encoding Helpers
// ==================

/// Value-type tag for a float column; REAL cannot hold NaN.
pub(crate) fn encode_float(value: f64) -> (Option<f64>, &'static str) {
    if value.is_nan() {
        (None, "NAN")
    } else if value.is_infinite() && value.is_sign_positive() {
        (None, "INF_POS")
    } else if value.is_infinite() {
        (None, "INF_NEG")
    } else {
        (Some(value), "FINITE")
    }
}

pub(crate) fn decode_float(value: Option<f64>, value_type: &str) -> f64 {
    match value_type {
        "INF_POS" => f64::INFINITY,
        "INF_NEG" => f64::NEG_INFINITY,
        "NAN" => f64::NAN,
        _ => value.unwrap_or(f64::NAN),
    }
}

pub(crate) fn from_millis(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.and_then(DateTime::from_timestamp_millis)
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_open_memory() {
        let storage = SqliteStorage::open_memory();
        assert!(storage.is_ok());
        let storage = storage.unwrap();
        assert_eq!(storage.current_version().unwrap(), storage.head_version());
    }

    #[test]
    fn test_open_rejects_other_drivers() {
        let err = SqliteStorage::open("mysql://localhost/db", StorageConfig::default()).unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }

    #[test]
    fn test_study_crud() {
        let storage = SqliteStorage::open_memory().unwrap();

        let id = storage
            .create_study(Some("alpha"), &[StudyDirection::Maximize])
            .unwrap();
        assert_eq!(storage.get_study_id_from_name("alpha").unwrap(), id);
        assert_eq!(storage.get_study_name(id).unwrap(), "alpha");
        assert_eq!(
            storage.get_study_directions(id).unwrap(),
            vec![StudyDirection::Maximize]
        );

        storage.delete_study(id).unwrap();
        assert!(matches!(
            storage.get_study_name(id).unwrap_err(),
            Error::StudyNotFound { .. }
        ));
        assert!(matches!(
            storage.delete_study(id).unwrap_err(),
            Error::StudyNotFound { .. }
        ));
    }

    #[test]
    fn test_duplicate_study_name() {
        let storage = SqliteStorage::open_memory().unwrap();
        storage
            .create_study(Some("dup"), &[StudyDirection::Minimize])
            .unwrap();

        let err = storage
            .create_study(Some("dup"), &[StudyDirection::Minimize])
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateStudyName { ref name } if name == "dup"));
        assert_eq!(storage.get_all_studies().unwrap().len(), 1);
    }

    #[test]
    fn test_generated_names_and_directions() {
        let storage = SqliteStorage::open_memory().unwrap();
        let a = storage
            .create_study(None, &[StudyDirection::Minimize, StudyDirection::Maximize])
            .unwrap();
        let b = storage.create_study(None, &[StudyDirection::Minimize]).unwrap();

        let name_a = storage.get_study_name(a).unwrap();
        assert!(name_a.starts_with("no-name-"));
        assert_ne!(name_a, storage.get_study_name(b).unwrap());
        assert_eq!(storage.get_study_directions(a).unwrap().len(), 2);

        assert!(matches!(
            storage.create_study(None, &[]).unwrap_err(),
            Error::InvalidArgument(_)
        ));
    }

    #[test]
    fn test_study_attrs_upsert_by_key() {
        let storage = SqliteStorage::open_memory().unwrap();
        let id = storage.create_study(Some("s"), &[StudyDirection::Minimize]).unwrap();

        storage.set_study_user_attr(id, "a", &json!(1)).unwrap();
        storage.set_study_user_attr(id, "b", &json!({"x": [1, 2]})).unwrap();
        storage.set_study_user_attr(id, "a", &json!("over")).unwrap();
        storage.set_study_system_attr(id, "a", &json!(true)).unwrap();

        let user = storage.get_study_user_attrs(id).unwrap();
        assert_eq!(user.len(), 2);
        assert_eq!(user["a"], json!("over"));
        assert_eq!(user["b"], json!({"x": [1, 2]}));
        assert_eq!(storage.get_study_system_attrs(id).unwrap()["a"], json!(true));

        assert!(matches!(
            storage.set_study_user_attr(999, "a", &json!(1)).unwrap_err(),
            Error::StudyNotFound { .. }
        ));
        assert!(matches!(
            storage.get_study_user_attrs(999).unwrap_err(),
            Error::StudyNotFound { .. }
        ));
    }

    #[test]
    fn test_float_encoding() {
        for v in [0.0, -1.5, f64::MAX, f64::INFINITY, f64::NEG_INFINITY] {
            let (stored, kind) = encode_float(v);
            assert_eq!(decode_float(stored, kind).to_bits(), v.to_bits());
        }
        let (stored, kind) = encode_float(f64::NAN);
        assert_eq!(kind, "NAN");
        assert!(decode_float(stored, kind).is_nan());
    }

    #[test]
    fn test_incompatible_store_refused() {
        let url = StorageUrl::memory();
        let raw = url.connect(std::time::Duration::from_secs(1)).unwrap();
        crate::storage::version::migrate_to(&raw, "v1.3.0.a").unwrap();

        let err = SqliteStorage::open_url(url.clone(), StorageConfig::default()).unwrap_err();
        assert!(matches!(err, Error::SchemaIncompatible { .. }));

        let storage =
            SqliteStorage::open_url(url, StorageConfig::default().skip_compatibility_check(true))
                .unwrap();
        assert_eq!(storage.upgrade().unwrap(), vec!["v2.4.0.a", "v2.6.0.a"]);
        storage.version_manager().check_compatibility(false).unwrap();
    }
}
