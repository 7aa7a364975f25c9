//! Trial liveness.
//!
//! A worker running a trial keeps a [`HeartbeatGuard`] alive for as long as
//! it works on the trial. The guard owns a background thread with its own
//! connection that stamps the trial's heartbeat row on a fixed interval.
//! Dropping the guard stops and joins the thread, so every way out of the
//! work scope (return, `?`, panic) cancels it.
//!
//! Nobody polls for dead workers. Instead, reads reconcile: when a grace
//! period is configured, [`SqliteStorage::get_trial`] and
//! [`SqliteStorage::get_trials`] first fail RUNNING trials whose last
//! heartbeat is older than the grace period. Heartbeats are stamped and
//! compared on the store's clock, never on a worker's.

use crate::error::{Error, Result};
use crate::model::{StudyId, TrialId, TrialState};
use crate::storage::schema::STORE_NOW_MS;
use crate::storage::sqlite::{now_millis, SqliteStorage};
use crate::storage::transaction::with_transaction;
use crate::storage::trials::trial_header;
use rusqlite::{params, Connection};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

impl SqliteStorage {
    /// Whether a background heartbeat is configured.
    #[must_use]
    pub fn is_heartbeat_enabled(&self) -> bool {
        self.config.heartbeat_interval.is_some()
    }

    #[must_use]
    pub fn get_heartbeat_interval(&self) -> Option<Duration> {
        self.config.heartbeat_interval
    }

    /// Stamp the trial's heartbeat with the store's current time.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TrialNotFound`] if the trial does not exist.
    pub fn record_heartbeat(&self, trial_id: TrialId) -> Result<()> {
        with_transaction(&self.conn, "record_heartbeat", |tx| {
            trial_header(tx, trial_id)?;
            stamp(tx, trial_id)
        })
    }

    /// Start the background heartbeat for a RUNNING trial.
    ///
    /// Records one heartbeat immediately, so a fresh trial is never judged
    /// stale before the first tick. Returns `None` when no interval is
    /// configured.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TrialNotFound`], [`Error::InvalidArgument`] if the
    /// trial is not RUNNING, or an error opening the recorder's connection.
    pub fn start_heartbeat(&self, trial_id: TrialId) -> Result<Option<HeartbeatGuard>> {
        let Some(interval) = self.config.heartbeat_interval else {
            return Ok(None);
        };

        with_transaction(&self.conn, "start_heartbeat", |tx| {
            let (_, state) = trial_header(tx, trial_id)?;
            if state != TrialState::Running {
                return Err(Error::InvalidArgument(format!(
                    "heartbeats are only recorded for RUNNING trials; trial {trial_id} is {state}"
                )));
            }
            stamp(tx, trial_id)
        })?;

        let conn = self.url.connect(self.config.busy_timeout)?;
        HeartbeatGuard::spawn(conn, trial_id, interval).map(Some)
    }

    /// Run `f` with a heartbeat kept alive for `trial_id`.
    ///
    /// The heartbeat is stopped before this returns, whatever `f` does.
    ///
    /// # Errors
    ///
    /// Returns the error from starting the heartbeat, or `f`'s error.
    pub fn with_heartbeat<F, R>(&self, trial_id: TrialId, f: F) -> Result<R>
    where
        F: FnOnce(&Self) -> Result<R>,
    {
        let guard = self.start_heartbeat(trial_id)?;
        let out = f(self);
        drop(guard);
        out
    }

    /// RUNNING trials of a study whose heartbeat is older than the grace
    /// period. Trials that never recorded a heartbeat are not tracked and
    /// never stale.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_stale_trial_ids(&self, study_id: StudyId) -> Result<Vec<TrialId>> {
        let Some(grace) = self.config.grace_period else {
            return Ok(Vec::new());
        };
        stale_trial_ids(&self.conn, study_id, grace)
    }

    /// Fail every stale RUNNING trial of a study.
    ///
    /// Returns the ids of the trials this call failed. A trial another worker
    /// already failed (or completed) in the meantime is left alone.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails.
    pub fn fail_stale_trials(&self, study_id: StudyId) -> Result<Vec<TrialId>> {
        let Some(grace) = self.config.grace_period else {
            return Ok(Vec::new());
        };

        let failed = with_transaction(&self.conn, "fail_stale_trials", |tx| {
            let mut failed = Vec::new();
            for trial_id in stale_trial_ids(tx, study_id, grace)? {
                if mark_failed(tx, trial_id)? {
                    failed.push(trial_id);
                }
            }
            Ok(failed)
        })?;

        for trial_id in &failed {
            warn!(study_id, trial_id, "Failed trial with stale heartbeat");
        }
        Ok(failed)
    }

    /// Fail one trial if its heartbeat is stale.
    ///
    /// Returns whether the trial was failed by this call. A missing trial is
    /// not an error here; the read that follows reports it.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails.
    pub fn reconcile(&self, trial_id: TrialId) -> Result<bool> {
        let Some(grace) = self.config.grace_period else {
            return Ok(false);
        };

        let failed = with_transaction(&self.conn, "reconcile", |tx| {
            let stale = tx
                .prepare_cached(&format!(
                    "SELECT 1 FROM trials t
                     JOIN trial_heartbeats h ON h.trial_id = t.trial_id
                     WHERE t.trial_id = ?1 AND t.state = 'RUNNING'
                       AND h.heartbeat < {STORE_NOW_MS} - ?2"
                ))?
                .exists(params![trial_id, grace_millis(grace)])?;
            if stale {
                mark_failed(tx, trial_id)
            } else {
                Ok(false)
            }
        })?;

        if failed {
            warn!(trial_id, "Failed trial with stale heartbeat");
        }
        Ok(failed)
    }
}

fn stamp(conn: &Connection, trial_id: TrialId) -> Result<()> {
    conn.prepare_cached(&format!(
        "INSERT INTO trial_heartbeats (trial_id, heartbeat) VALUES (?1, {STORE_NOW_MS})
         ON CONFLICT(trial_id) DO UPDATE SET heartbeat = excluded.heartbeat"
    ))?
    .execute([trial_id])?;
    Ok(())
}

/// Stamp only while the trial is still RUNNING; `false` once it has finished.
fn stamp_running(conn: &Connection, trial_id: TrialId) -> Result<bool> {
    let changed = conn
        .prepare_cached(&format!(
            "INSERT INTO trial_heartbeats (trial_id, heartbeat)
             SELECT trial_id, {STORE_NOW_MS} FROM trials WHERE trial_id = ?1 AND state = 'RUNNING'
             ON CONFLICT(trial_id) DO UPDATE SET heartbeat = excluded.heartbeat"
        ))?
        .execute([trial_id])?;
    Ok(changed == 1)
}

fn stale_trial_ids(conn: &Connection, study_id: StudyId, grace: Duration) -> Result<Vec<TrialId>> {
    let ids = conn
        .prepare_cached(&format!(
            "SELECT t.trial_id FROM trials t
             JOIN trial_heartbeats h ON h.trial_id = t.trial_id
             WHERE t.study_id = ?1 AND t.state = 'RUNNING'
               AND h.heartbeat < {STORE_NOW_MS} - ?2
             ORDER BY t.number"
        ))?
        .query_map(params![study_id, grace_millis(grace)], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;
    Ok(ids)
}

fn mark_failed(conn: &Connection, trial_id: TrialId) -> Result<bool> {
    let changed = conn
        .prepare_cached(
            "UPDATE trials SET state = 'FAIL', datetime_complete = ?1
             WHERE trial_id = ?2 AND state = 'RUNNING'",
        )?
        .execute(params![now_millis(), trial_id])?;
    Ok(changed == 1)
}

fn grace_millis(grace: Duration) -> i64 {
    i64::try_from(grace.as_millis()).unwrap_or(i64::MAX)
}

/// Background heartbeat recorder for one trial.
///
/// Stops on [`HeartbeatGuard::stop`], on drop, or by itself at the first
/// tick after the trial leaves RUNNING.
#[derive(Debug)]
pub struct HeartbeatGuard {
    trial_id: TrialId,
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl HeartbeatGuard {
    fn spawn(conn: Connection, trial_id: TrialId, interval: Duration) -> Result<Self> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let handle = thread::Builder::new()
            .name(format!("heartbeat-{trial_id}"))
            .spawn(move || {
                debug!(trial_id, ?interval, "Heartbeat started");
                // A message or a dropped sender both mean stop.
                while let Err(RecvTimeoutError::Timeout) = stop_rx.recv_timeout(interval) {
                    match stamp_running(&conn, trial_id) {
                        Ok(true) => {}
                        Ok(false) => {
                            debug!(trial_id, "Trial finished");
                            break;
                        }
                        Err(e) => warn!(trial_id, error = %e, "Failed to record heartbeat"),
                    }
                }
                debug!(trial_id, "Heartbeat stopped");
            })?;

        Ok(Self {
            trial_id,
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    #[must_use]
    pub const fn trial_id(&self) -> TrialId {
        self.trial_id
    }

    /// Stop recording and wait for the recorder to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            // The recorder may already be gone; dropping the sender is enough.
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(trial_id = self.trial_id, "Heartbeat thread panicked");
            }
        }
    }
}

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::model::StudyDirection;

    fn file_storage(dir: &tempfile::TempDir, config: StorageConfig) -> SqliteStorage {
        let locator = format!("sqlite:///{}", dir.path().join("hb.db").display());
        SqliteStorage::open(&locator, config).unwrap()
    }

    fn heartbeat_of(storage: &SqliteStorage, trial_id: TrialId) -> Option<i64> {
        storage
            .conn()
            .query_row(
                "SELECT heartbeat FROM trial_heartbeats WHERE trial_id = ?1",
                [trial_id],
                |row| row.get(0),
            )
            .ok()
    }

    fn backdate(storage: &SqliteStorage, trial_id: TrialId, ms: i64) {
        storage
            .conn()
            .execute(
                "UPDATE trial_heartbeats SET heartbeat = heartbeat - ?1 WHERE trial_id = ?2",
                params![ms, trial_id],
            )
            .unwrap();
    }

    #[test]
    fn test_disabled_by_default() {
        let storage = SqliteStorage::open_memory().unwrap();
        let study_id = storage.create_study(None, &[StudyDirection::Minimize]).unwrap();
        let trial_id = storage.create_trial(study_id, None).unwrap();

        assert!(!storage.is_heartbeat_enabled());
        assert!(storage.get_heartbeat_interval().is_none());
        assert!(storage.start_heartbeat(trial_id).unwrap().is_none());
        assert!(storage.fail_stale_trials(study_id).unwrap().is_empty());
        assert!(!storage.reconcile(trial_id).unwrap());
    }

    #[test]
    fn test_record_upserts_one_row() {
        let storage = SqliteStorage::open_memory().unwrap();
        let study_id = storage.create_study(None, &[StudyDirection::Minimize]).unwrap();
        let trial_id = storage.create_trial(study_id, None).unwrap();

        storage.record_heartbeat(trial_id).unwrap();
        backdate(&storage, trial_id, 10_000);
        let old = heartbeat_of(&storage, trial_id).unwrap();
        storage.record_heartbeat(trial_id).unwrap();
        assert!(heartbeat_of(&storage, trial_id).unwrap() > old);

        let rows: i64 = storage
            .conn()
            .query_row("SELECT COUNT(*) FROM trial_heartbeats", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);

        assert!(matches!(
            storage.record_heartbeat(999).unwrap_err(),
            Error::TrialNotFound { .. }
        ));
    }

    #[test]
    fn test_stale_trial_fails_on_next_read() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig::default().with_grace_period(Duration::from_secs(30));
        let storage = file_storage(&dir, config);
        let study_id = storage.create_study(None, &[StudyDirection::Minimize]).unwrap();
        let silent = storage.create_trial(study_id, None).unwrap();
        let alive = storage.create_trial(study_id, None).unwrap();
        let untracked = storage.create_trial(study_id, None).unwrap();

        storage.record_heartbeat(silent).unwrap();
        storage.record_heartbeat(alive).unwrap();
        assert!(storage.get_stale_trial_ids(study_id).unwrap().is_empty());

        backdate(&storage, silent, 60_000);
        assert_eq!(storage.get_stale_trial_ids(study_id).unwrap(), vec![silent]);

        let trial = storage.get_trial(silent).unwrap();
        assert_eq!(trial.state, TrialState::Fail);
        assert!(trial.datetime_complete.is_some());

        let states: Vec<TrialState> = storage
            .get_trials(study_id, None, None)
            .unwrap()
            .iter()
            .map(|t| t.state)
            .collect();
        assert_eq!(states, vec![TrialState::Fail, TrialState::Running, TrialState::Running]);
        assert_eq!(storage.get_trial(untracked).unwrap().state, TrialState::Running);
    }

    #[test]
    fn test_other_worker_reconciles_via_get_trials() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig::default().with_grace_period(Duration::from_secs(5));
        let dead_worker = file_storage(&dir, config.clone());
        let study_id = dead_worker.create_study(None, &[StudyDirection::Minimize]).unwrap();
        let trial_id = dead_worker.create_trial(study_id, None).unwrap();
        dead_worker.record_heartbeat(trial_id).unwrap();
        backdate(&dead_worker, trial_id, 10_000);
        drop(dead_worker);

        let survivor = file_storage(&dir, config);
        let failed = survivor
            .get_trials(study_id, Some(&[TrialState::Fail]), None)
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].trial_id, trial_id);

        // Already reconciled; nothing left to fail.
        assert!(survivor.fail_stale_trials(study_id).unwrap().is_empty());
    }

    #[test]
    fn test_finished_trials_are_never_failed() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig::default().with_grace_period(Duration::from_secs(1));
        let storage = file_storage(&dir, config);
        let study_id = storage.create_study(None, &[StudyDirection::Minimize]).unwrap();
        let trial_id = storage.create_trial(study_id, None).unwrap();
        storage.record_heartbeat(trial_id).unwrap();
        storage
            .set_trial_state_values(trial_id, TrialState::Complete, Some(&[1.0]))
            .unwrap();
        backdate(&storage, trial_id, 60_000);

        assert_eq!(storage.get_trial(trial_id).unwrap().state, TrialState::Complete);
    }

    #[test]
    fn test_guard_keeps_trial_alive_then_stops() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig::default()
            .with_heartbeat_interval(Duration::from_millis(50))
            .with_grace_period(Duration::from_millis(1500));
        let storage = file_storage(&dir, config);
        let study_id = storage.create_study(None, &[StudyDirection::Minimize]).unwrap();
        let trial_id = storage.create_trial(study_id, None).unwrap();

        let guard = storage.start_heartbeat(trial_id).unwrap().unwrap();
        assert_eq!(guard.trial_id(), trial_id);
        let first = heartbeat_of(&storage, trial_id).unwrap();

        thread::sleep(Duration::from_millis(2000));
        // Longer than the grace period, but the recorder kept stamping.
        assert_eq!(storage.get_trial(trial_id).unwrap().state, TrialState::Running);
        assert!(heartbeat_of(&storage, trial_id).unwrap() > first);

        drop(guard);
        let last = heartbeat_of(&storage, trial_id).unwrap();
        thread::sleep(Duration::from_millis(300));
        assert_eq!(heartbeat_of(&storage, trial_id).unwrap(), last);

        thread::sleep(Duration::from_millis(1500));
        assert_eq!(storage.get_trial(trial_id).unwrap().state, TrialState::Fail);
    }

    #[test]
    fn test_recorder_stops_once_trial_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig::default().with_heartbeat_interval(Duration::from_millis(20));
        let storage = file_storage(&dir, config);
        let study_id = storage.create_study(None, &[StudyDirection::Minimize]).unwrap();
        let trial_id = storage.create_trial(study_id, None).unwrap();

        storage
            .with_heartbeat(trial_id, |s| {
                s.set_trial_state_values(trial_id, TrialState::Complete, Some(&[0.5]))?;
                thread::sleep(Duration::from_millis(100));
                let last = heartbeat_of(s, trial_id).unwrap();
                thread::sleep(Duration::from_millis(200));
                assert_eq!(heartbeat_of(s, trial_id).unwrap(), last);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_with_heartbeat_stops_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig::default().with_heartbeat_interval(Duration::from_millis(20));
        let storage = file_storage(&dir, config);
        let study_id = storage.create_study(None, &[StudyDirection::Minimize]).unwrap();
        let trial_id = storage.create_trial(study_id, None).unwrap();

        let err = storage
            .with_heartbeat(trial_id, |s| {
                s.set_trial_user_attr(trial_id, "step", serde_json::json!(1))?;
                Err::<(), _>(Error::Other("objective raised".to_string()))
            })
            .unwrap_err();
        assert!(matches!(err, Error::Other(_)));

        let last = heartbeat_of(&storage, trial_id).unwrap();
        thread::sleep(Duration::from_millis(200));
        assert_eq!(heartbeat_of(&storage, trial_id).unwrap(), last);
    }

    #[test]
    fn test_start_requires_running_trial() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig::default().with_heartbeat_interval(Duration::from_secs(1));
        let storage = file_storage(&dir, config);
        let study_id = storage.create_study(None, &[StudyDirection::Minimize]).unwrap();
        let waiting = storage
            .create_trial(
                study_id,
                Some(&crate::model::FrozenTrial::template(TrialState::Waiting)),
            )
            .unwrap();

        assert!(matches!(
            storage.start_heartbeat(waiting).unwrap_err(),
            Error::InvalidArgument(_)
        ));
        assert!(matches!(
            storage.start_heartbeat(12345).unwrap_err(),
            Error::TrialNotFound { .. }
        ));
        assert!(heartbeat_of(&storage, waiting).is_none());
    }
}
