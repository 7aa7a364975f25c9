//! Trial operations.
//!
//! The central piece is the merge behind [`SqliteStorage::update_trial`]:
//! scalar fields (state, values, completion time) replace the stored value,
//! while map fields (params, attributes, intermediate values) are upserted
//! key by key. Two writers touching disjoint keys of one trial therefore
//! never clobber each other.
//!
//! Trial numbers are allocated as `MAX(number) + 1` inside the INSERT itself,
//! under the unique `(study_id, number)` index. A racing creator that loses
//! gets a unique violation and retries in a fresh transaction.

use crate::error::{Error, Result};
use crate::model::{
    Distribution, FrozenTrial, StudyDirection, StudyId, TrialId, TrialState, TrialUpdate,
};
use crate::storage::sqlite::{
    decode_float, encode_float, ensure_study, from_millis, load_attrs, load_directions,
    now_millis, upsert_attr, AttrTable, SqliteStorage,
};
use crate::storage::transaction::{read_snapshot, with_transaction};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, warn};

/// How often a trial creation is retried after losing a number race.
pub const MAX_CREATE_TRIAL_RETRIES: usize = 8;

/// Upper bound on ids bound into a single `IN (...)` predicate.
pub const MAX_IN_CLAUSE_PARAMS: usize = 500;

impl SqliteStorage {
    // ===============
    // Trial Creation
    // ===============

    /// Create a trial in a study.
    ///
    /// Without a template the trial starts RUNNING with `datetime_start` set
    /// to now and empty maps. With a template every field is copied except
    /// the id and number, which are always allocated fresh.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StudyNotFound`], validation errors for a bad
    /// template, or [`Error::UniqueConstraintViolation`] if every retry lost
    /// the race for a number.
    pub fn create_trial(
        &self,
        study_id: StudyId,
        template: Option<&FrozenTrial>,
    ) -> Result<TrialId> {
        self.create_trial_with(study_id, |tx| insert_trial(tx, study_id, template))
    }

    /// Run `insert` in fresh transactions until it stops losing number races.
    fn create_trial_with<F>(&self, study_id: StudyId, mut insert: F) -> Result<TrialId>
    where
        F: FnMut(&Connection) -> Result<TrialId>,
    {
        for attempt in 0..=MAX_CREATE_TRIAL_RETRIES {
            match with_transaction(&self.conn, "create_trial", |tx| insert(tx)) {
                Err(e) if e.is_unique_violation() => {
                    debug!(study_id, attempt, error = %e, "Trial number taken, retrying");
                }
                Ok(trial_id) => {
                    debug!(study_id, trial_id, "Created trial");
                    return Ok(trial_id);
                }
                Err(e) => return Err(e),
            }
        }

        warn!(study_id, "Giving up on trial creation after repeated number races");
        Err(Error::UniqueConstraintViolation(format!(
            "could not allocate a trial number in study {study_id} after {} attempts",
            MAX_CREATE_TRIAL_RETRIES + 1
        )))
    }

    // ============
    // Trial Reads
    // ============

    /// Load a full trial snapshot.
    ///
    /// With a grace period configured, a RUNNING trial whose heartbeat went
    /// stale is failed first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TrialNotFound`] if the trial does not exist.
    pub fn get_trial(&self, trial_id: TrialId) -> Result<FrozenTrial> {
        if self.config.grace_period.is_some() {
            self.reconcile(trial_id)?;
        }

        read_snapshot(&self.conn, |conn| load_trials(conn, &[trial_id]))?
            .pop()
            .ok_or_else(|| Error::TrialNotFound {
                id: trial_id.to_string(),
            })
    }

    /// Trials of a study ordered by number.
    ///
    /// `excluded` may be arbitrarily large: it is applied to the candidate
    /// id list here rather than bound into SQL, and sub-rows are then loaded
    /// in chunks of [`MAX_IN_CLAUSE_PARAMS`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::StudyNotFound`] if the study does not exist.
    pub fn get_trials(
        &self,
        study_id: StudyId,
        states: Option<&[TrialState]>,
        excluded: Option<&HashSet<TrialId>>,
    ) -> Result<Vec<FrozenTrial>> {
        if self.config.grace_period.is_some() {
            self.fail_stale_trials(study_id)?;
        }

        read_snapshot(&self.conn, |conn| {
            ensure_study(conn, study_id)?;

            let mut ids = trial_ids(conn, study_id, states)?;
            if let Some(excluded) = excluded {
                ids.retain(|id| !excluded.contains(id));
            }
            load_trials(conn, &ids)
        })
    }

    /// Number of trials in a study, optionally restricted to some states.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StudyNotFound`] if the study does not exist.
    pub fn get_n_trials(&self, study_id: StudyId, states: Option<&[TrialState]>) -> Result<usize> {
        read_snapshot(&self.conn, |conn| {
            ensure_study(conn, study_id)?;
            Ok(trial_ids(conn, study_id, states)?.len())
        })
    }

    /// The best COMPLETE trial of a single-objective study.
    ///
    /// NaN objective values never win. Ties go to the lower number.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for a multi-objective study.
    pub fn get_best_trial(&self, study_id: StudyId) -> Result<Option<FrozenTrial>> {
        read_snapshot(&self.conn, |conn| {
            let directions = load_directions(conn, study_id)?;
            let [direction] = directions.as_slice() else {
                return Err(Error::InvalidArgument(format!(
                    "best trial is only defined for single-objective studies; study {study_id} \
                     has {} directions",
                    directions.len()
                )));
            };
            best_trial(conn, study_id, *direction)
        })
    }

    /// Storage id of the trial with a given number.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TrialNotFound`] if the study has no such number.
    pub fn get_trial_id_from_study_id_trial_number(
        &self,
        study_id: StudyId,
        number: i64,
    ) -> Result<TrialId> {
        self.conn
            .query_row(
                "SELECT trial_id FROM trials WHERE study_id = ?1 AND number = ?2",
                params![study_id, number],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| Error::TrialNotFound {
                id: format!("study {study_id} number {number}"),
            })
    }

    /// # Errors
    ///
    /// Returns [`Error::TrialNotFound`] if the trial does not exist.
    pub fn get_trial_number_from_id(&self, trial_id: TrialId) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT number FROM trials WHERE trial_id = ?1",
                [trial_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| Error::TrialNotFound {
                id: trial_id.to_string(),
            })
    }

    /// Params of a trial in internal representation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TrialNotFound`] if the trial does not exist.
    pub fn get_trial_params(&self, trial_id: TrialId) -> Result<BTreeMap<String, f64>> {
        read_snapshot(&self.conn, |conn| {
            trial_header(conn, trial_id)?;
            let params = conn
                .prepare_cached(
                    "SELECT param_name, param_value FROM trial_params WHERE trial_id = ?1",
                )?
                .query_map([trial_id], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<_>>()?;
            Ok(params)
        })
    }

    /// One param of a trial in internal representation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TrialNotFound`] or [`Error::ParamNotFound`].
    pub fn get_trial_param(&self, trial_id: TrialId, name: &str) -> Result<f64> {
        read_snapshot(&self.conn, |conn| {
            trial_header(conn, trial_id)?;
            conn.query_row(
                "SELECT param_value FROM trial_params WHERE trial_id = ?1 AND param_name = ?2",
                params![trial_id, name],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| Error::ParamNotFound {
                trial_id,
                name: name.to_string(),
            })
        })
    }

    /// # Errors
    ///
    /// Returns [`Error::TrialNotFound`] if the trial does not exist.
    pub fn get_trial_user_attrs(&self, trial_id: TrialId) -> Result<BTreeMap<String, Value>> {
        read_snapshot(&self.conn, |conn| {
            trial_header(conn, trial_id)?;
            load_attrs(conn, AttrTable::TrialUser, trial_id)
        })
    }

    /// # Errors
    ///
    /// Returns [`Error::TrialNotFound`] if the trial does not exist.
    pub fn get_trial_system_attrs(&self, trial_id: TrialId) -> Result<BTreeMap<String, Value>> {
        read_snapshot(&self.conn, |conn| {
            trial_header(conn, trial_id)?;
            load_attrs(conn, AttrTable::TrialSystem, trial_id)
        })
    }

    // ==============
    // Trial Updates
    // ==============

    /// Merge a partial update into a stored trial, atomically.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TrialNotFound`], [`Error::InvalidStateTransition`]
    /// for a finished trial, [`Error::IncompatibleDistribution`] for a param
    /// whose distribution conflicts with the study's, or
    /// [`Error::InvalidArgument`] for malformed values.
    pub fn update_trial(&self, trial_id: TrialId, update: &TrialUpdate) -> Result<()> {
        with_transaction(&self.conn, "update_trial", |tx| merge_update(tx, trial_id, update))
    }

    /// Set state and, optionally, objective values.
    ///
    /// Returns `false` without writing when asked to move a trial that is not
    /// WAITING into RUNNING; that is how a worker learns another worker has
    /// already claimed an enqueued trial.
    ///
    /// # Errors
    ///
    /// See [`SqliteStorage::update_trial`].
    pub fn set_trial_state_values(
        &self,
        trial_id: TrialId,
        state: TrialState,
        values: Option<&[f64]>,
    ) -> Result<bool> {
        with_transaction(&self.conn, "set_trial_state_values", |tx| {
            let (_, current) = trial_header(tx, trial_id)?;
            if state == TrialState::Running && current != TrialState::Waiting {
                if current.is_finished() {
                    return Err(Error::InvalidStateTransition {
                        trial_id,
                        state: current,
                    });
                }
                return Ok(false);
            }

            let mut update = TrialUpdate::new().state(state);
            if let Some(values) = values {
                update = update.values(values.to_vec());
            }
            merge_update(tx, trial_id, &update)?;
            Ok(true)
        })
    }

    /// Set one param from its internal representation.
    ///
    /// # Errors
    ///
    /// See [`SqliteStorage::update_trial`].
    pub fn set_trial_param(
        &self,
        trial_id: TrialId,
        name: &str,
        internal: f64,
        distribution: &Distribution,
    ) -> Result<()> {
        self.update_trial(
            trial_id,
            &TrialUpdate::new().param(name, internal, distribution.clone()),
        )
    }

    /// # Errors
    ///
    /// See [`SqliteStorage::update_trial`].
    pub fn set_trial_intermediate_value(&self, trial_id: TrialId, step: i64, value: f64) -> Result<()> {
        self.update_trial(trial_id, &TrialUpdate::new().intermediate_value(step, value))
    }

    /// # Errors
    ///
    /// See [`SqliteStorage::update_trial`].
    pub fn set_trial_user_attr(&self, trial_id: TrialId, key: &str, value: Value) -> Result<()> {
        self.update_trial(trial_id, &TrialUpdate::new().user_attr(key, value))
    }

    /// # Errors
    ///
    /// See [`SqliteStorage::update_trial`].
    pub fn set_trial_system_attr(&self, trial_id: TrialId, key: &str, value: Value) -> Result<()> {
        self.update_trial(trial_id, &TrialUpdate::new().system_attr(key, value))
    }
}

// =============
// Write Helpers
// =============

fn insert_trial(
    conn: &Connection,
    study_id: StudyId,
    template: Option<&FrozenTrial>,
) -> Result<TrialId> {
    let directions = load_directions(conn, study_id)?;

    let (state, datetime_start, datetime_complete) = match template {
        Some(t) => (
            t.state,
            t.datetime_start.map(|d| d.timestamp_millis()),
            t.datetime_complete.map(|d| d.timestamp_millis()),
        ),
        None => (TrialState::Running, Some(now_millis()), None),
    };

    conn.prepare_cached(
        "INSERT INTO trials (study_id, number, state, datetime_start, datetime_complete)
         SELECT ?1, COALESCE(MAX(number), -1) + 1, ?2, ?3, ?4 FROM trials WHERE study_id = ?1",
    )?
    .execute(params![study_id, state.as_str(), datetime_start, datetime_complete])?;
    let trial_id = conn.last_insert_rowid();

    let Some(template) = template else {
        return Ok(trial_id);
    };

    if let Some(values) = &template.values {
        if template.state != TrialState::Complete {
            return Err(Error::InvalidArgument(format!(
                "objective values can only be stored on a COMPLETE trial, not {}",
                template.state
            )));
        }
        check_values(values, directions.len())?;
        write_values(conn, trial_id, values)?;
    }
    for (name, internal) in &template.params {
        let distribution = template.distributions.get(name).ok_or_else(|| {
            Error::InvalidArgument(format!("param '{name}' has no distribution"))
        })?;
        write_param(conn, study_id, trial_id, name, *internal, distribution)?;
    }
    for (key, value) in &template.user_attrs {
        upsert_attr(conn, AttrTable::TrialUser, trial_id, key, value)?;
    }
    for (key, value) in &template.system_attrs {
        upsert_attr(conn, AttrTable::TrialSystem, trial_id, key, value)?;
    }
    for (step, value) in &template.intermediate_values {
        write_intermediate_value(conn, trial_id, *step, *value)?;
    }

    Ok(trial_id)
}

/// Apply `update` to `trial_id` inside the caller's transaction.
fn merge_update(conn: &Connection, trial_id: TrialId, update: &TrialUpdate) -> Result<()> {
    let (study_id, current) = trial_header(conn, trial_id)?;
    if current.is_finished() {
        return Err(Error::InvalidStateTransition {
            trial_id,
            state: current,
        });
    }

    if update.is_empty() {
        return Ok(());
    }

    let next = update.state.unwrap_or(current);
    if update.datetime_complete.is_some() && !next.is_finished() {
        return Err(Error::InvalidArgument(format!(
            "a completion time can only be set when the trial finishes, not while {next}"
        )));
    }

    if let Some(values) = &update.values {
        if next != TrialState::Complete {
            return Err(Error::InvalidArgument(format!(
                "objective values can only be stored on a COMPLETE trial, not {next}"
            )));
        }
        check_values(values, load_directions(conn, study_id)?.len())?;
        write_values(conn, trial_id, values)?;
    }

    if let Some(state) = update.state {
        conn.prepare_cached("UPDATE trials SET state = ?1 WHERE trial_id = ?2")?
            .execute(params![state.as_str(), trial_id])?;

        if state == TrialState::Running && current == TrialState::Waiting {
            conn.prepare_cached("UPDATE trials SET datetime_start = ?1 WHERE trial_id = ?2")?
                .execute(params![now_millis(), trial_id])?;
        }
        if state.is_finished() {
            let completed = update
                .datetime_complete
                .map_or_else(now_millis, |d| d.timestamp_millis());
            conn.prepare_cached("UPDATE trials SET datetime_complete = ?1 WHERE trial_id = ?2")?
                .execute(params![completed, trial_id])?;
        }
    }

    for (name, (internal, distribution)) in &update.params {
        write_param(conn, study_id, trial_id, name, *internal, distribution)?;
    }
    for (key, value) in &update.user_attrs {
        upsert_attr(conn, AttrTable::TrialUser, trial_id, key, value)?;
    }
    for (key, value) in &update.system_attrs {
        upsert_attr(conn, AttrTable::TrialSystem, trial_id, key, value)?;
    }
    for (step, value) in &update.intermediate_values {
        write_intermediate_value(conn, trial_id, *step, *value)?;
    }

    if update.state.is_some_and(|s| s != current) {
        debug!(trial_id, from = %current, to = %next, "Trial state changed");
    }
    Ok(())
}

fn check_values(values: &[f64], n_directions: usize) -> Result<()> {
    if values.len() == n_directions {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!(
            "expected {n_directions} objective value(s), got {}",
            values.len()
        )))
    }
}

/// Values are a scalar field: the whole vector is replaced.
fn write_values(conn: &Connection, trial_id: TrialId, values: &[f64]) -> Result<()> {
    conn.prepare_cached("DELETE FROM trial_values WHERE trial_id = ?1")?
        .execute([trial_id])?;

    let mut stmt = conn.prepare_cached(
        "INSERT INTO trial_values (trial_id, objective, value, value_type) VALUES (?1, ?2, ?3, ?4)",
    )?;
    for (objective, value) in values.iter().enumerate() {
        let (stored, value_type) = encode_float(*value);
        stmt.execute(params![trial_id, objective, stored, value_type])?;
    }
    Ok(())
}

fn write_param(
    conn: &Connection,
    study_id: StudyId,
    trial_id: TrialId,
    name: &str,
    internal: f64,
    distribution: &Distribution,
) -> Result<()> {
    distribution.validate()?;
    if !distribution.contains(internal) {
        return Err(Error::InvalidArgument(format!(
            "value {internal} of param '{name}' is outside its {}",
            distribution.name()
        )));
    }

    // Any earlier definition of this name in the study fixes its domain.
    let existing: Option<String> = conn
        .prepare_cached(
            "SELECT p.distribution_json FROM trial_params p
             JOIN trials t ON t.trial_id = p.trial_id
             WHERE t.study_id = ?1 AND p.param_name = ?2
             LIMIT 1",
        )?
        .query_row(params![study_id, name], |row| row.get(0))
        .optional()?;
    if let Some(json) = existing {
        let existing = Distribution::from_json(&json)?;
        if !existing.is_compatible_with(distribution) {
            return Err(Error::IncompatibleDistribution {
                name: name.to_string(),
                message: format!(
                    "{} conflicts with the study's {}",
                    distribution.to_json(),
                    existing.to_json()
                ),
            });
        }
    }

    conn.prepare_cached(
        "INSERT INTO trial_params (trial_id, param_name, param_value, distribution_json)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(trial_id, param_name) DO UPDATE SET
             param_value = excluded.param_value,
             distribution_json = excluded.distribution_json",
    )?
    .execute(params![trial_id, name, internal, distribution.to_json()])?;
    Ok(())
}

fn write_intermediate_value(conn: &Connection, trial_id: TrialId, step: i64, value: f64) -> Result<()> {
    if step < 0 {
        return Err(Error::InvalidArgument(format!(
            "intermediate value step must be non-negative, got {step}"
        )));
    }

    let (stored, value_type) = encode_float(value);
    conn.prepare_cached(
        "INSERT INTO trial_intermediate_values
             (trial_id, step, intermediate_value, intermediate_value_type)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(trial_id, step) DO UPDATE SET
             intermediate_value = excluded.intermediate_value,
             intermediate_value_type = excluded.intermediate_value_type",
    )?
    .execute(params![trial_id, step, stored, value_type])?;
    Ok(())
}

// ============
// Read Helpers
// ============

/// Study and state of a trial.
pub(crate) fn trial_header(conn: &Connection, trial_id: TrialId) -> Result<(StudyId, TrialState)> {
    conn.prepare_cached("SELECT study_id, state FROM trials WHERE trial_id = ?1")?
        .query_row([trial_id], |row| {
            Ok((row.get(0)?, TrialState::from_db(&row.get::<_, String>(1)?)))
        })
        .optional()?
        .ok_or_else(|| Error::TrialNotFound {
            id: trial_id.to_string(),
        })
}

fn trial_ids(
    conn: &Connection,
    study_id: StudyId,
    states: Option<&[TrialState]>,
) -> Result<Vec<TrialId>> {
    let mut sql = String::from("SELECT trial_id FROM trials WHERE study_id = ?");
    let mut bind = vec![SqlValue::Integer(study_id)];

    if let Some(states) = states {
        if states.is_empty() {
            return Ok(Vec::new());
        }
        sql.push_str(&format!(" AND state IN ({})", placeholders(states.len())));
        bind.extend(states.iter().map(|s| SqlValue::Text(s.as_str().to_string())));
    }
    sql.push_str(" ORDER BY number");

    let ids = conn
        .prepare(&sql)?
        .query_map(params_from_iter(bind), |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;
    Ok(ids)
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Best COMPLETE trial for one objective direction.
pub(crate) fn best_trial(
    conn: &Connection,
    study_id: StudyId,
    direction: StudyDirection,
) -> Result<Option<FrozenTrial>> {
    let order = match direction {
        StudyDirection::Minimize => "ASC",
        StudyDirection::Maximize => "DESC",
    };
    let sql = format!(
        "SELECT t.trial_id FROM trials t
         JOIN trial_values v ON v.trial_id = t.trial_id AND v.objective = 0
         WHERE t.study_id = ?1 AND t.state = 'COMPLETE' AND v.value_type != 'NAN'
         ORDER BY CASE v.value_type WHEN 'INF_NEG' THEN -1 WHEN 'INF_POS' THEN 1 ELSE 0 END {order},
                  v.value {order},
                  t.number ASC
         LIMIT 1"
    );

    let best: Option<TrialId> = conn
        .query_row(&sql, [study_id], |row| row.get(0))
        .optional()?;
    match best {
        Some(trial_id) => Ok(load_trials(conn, &[trial_id])?.pop()),
        None => Ok(None),
    }
}

/// Load full trials, keeping the order of `ids`. Missing ids are skipped.
pub(crate) fn load_trials(conn: &Connection, ids: &[TrialId]) -> Result<Vec<FrozenTrial>> {
    let mut trials: HashMap<TrialId, FrozenTrial> = HashMap::with_capacity(ids.len());

    for chunk in ids.chunks(MAX_IN_CLAUSE_PARAMS) {
        load_chunk(conn, chunk, &mut trials)?;
    }

    Ok(ids.iter().filter_map(|id| trials.remove(id)).collect())
}

fn load_chunk(
    conn: &Connection,
    chunk: &[TrialId],
    trials: &mut HashMap<TrialId, FrozenTrial>,
) -> Result<()> {
    let marks = placeholders(chunk.len());

    let mut stmt = conn.prepare(&format!(
        "SELECT trial_id, number, state, datetime_start, datetime_complete
         FROM trials WHERE trial_id IN ({marks})"
    ))?;
    let rows = stmt.query_map(params_from_iter(chunk), |row| {
        let mut trial = FrozenTrial::template(TrialState::from_db(&row.get::<_, String>(2)?));
        trial.trial_id = row.get(0)?;
        trial.number = row.get(1)?;
        trial.datetime_start = from_millis(row.get(3)?);
        trial.datetime_complete = from_millis(row.get(4)?);
        Ok(trial)
    })?;
    for trial in rows {
        let trial = trial?;
        trials.insert(trial.trial_id, trial);
    }

    let mut stmt = conn.prepare(&format!(
        "SELECT trial_id, value, value_type FROM trial_values
         WHERE trial_id IN ({marks}) ORDER BY trial_id, objective"
    ))?;
    let rows = stmt.query_map(params_from_iter(chunk), |row| {
        Ok((
            row.get::<_, TrialId>(0)?,
            decode_float(row.get(1)?, &row.get::<_, String>(2)?),
        ))
    })?;
    for row in rows {
        let (trial_id, value) = row?;
        if let Some(trial) = trials.get_mut(&trial_id) {
            trial.values.get_or_insert_with(Vec::new).push(value);
        }
    }

    let mut stmt = conn.prepare(&format!(
        "SELECT trial_id, param_name, param_value, distribution_json FROM trial_params
         WHERE trial_id IN ({marks})"
    ))?;
    let rows: Vec<(TrialId, String, f64, String)> = stmt
        .query_map(params_from_iter(chunk), |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })?
        .collect::<rusqlite::Result<_>>()?;
    for (trial_id, name, value, json) in rows {
        if let Some(trial) = trials.get_mut(&trial_id) {
            trial
                .distributions
                .insert(name.clone(), Distribution::from_json(&json)?);
            trial.params.insert(name, value);
        }
    }

    for table in [AttrTable::TrialUser, AttrTable::TrialSystem] {
        let mut stmt = conn.prepare(&format!(
            "SELECT trial_id, key, value_json FROM {} WHERE trial_id IN ({marks})",
            table.table()
        ))?;
        let rows: Vec<(TrialId, String, String)> = stmt
            .query_map(params_from_iter(chunk), |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<rusqlite::Result<_>>()?;
        for (trial_id, key, json) in rows {
            if let Some(trial) = trials.get_mut(&trial_id) {
                let attrs = if table == AttrTable::TrialSystem {
                    &mut trial.system_attrs
                } else {
                    &mut trial.user_attrs
                };
                attrs.insert(key, serde_json::from_str(&json)?);
            }
        }
    }

    let mut stmt = conn.prepare(&format!(
        "SELECT trial_id, step, intermediate_value, intermediate_value_type
         FROM trial_intermediate_values WHERE trial_id IN ({marks})"
    ))?;
    let rows = stmt.query_map(params_from_iter(chunk), |row| {
        Ok((
            row.get::<_, TrialId>(0)?,
            row.get::<_, i64>(1)?,
            decode_float(row.get(2)?, &row.get::<_, String>(3)?),
        ))
    })?;
    for row in rows {
        let (trial_id, step, value) = row?;
        if let Some(trial) = trials.get_mut(&trial_id) {
            trial.intermediate_values.insert(step, value);
        }
    }

    Ok(())
}
