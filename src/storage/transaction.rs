//! Scoped transactions.
//!
//! [`with_transaction`] is the only way storage code writes. It guarantees:
//! - commit when the closure returns `Ok`
//! - rollback, then the closure's own error, when it returns `Err`
//! - rollback, then the commit error, when the commit itself fails
//! - rollback on unwind, since the transaction guard is dropped
//!
//! Scopes nest. When the connection is already inside a transaction, the
//! inner scope runs under a SAVEPOINT: its success is a RELEASE, never a
//! COMMIT, so only the outermost scope decides durability, and an outer
//! failure discards everything the inner scopes did.

use crate::error::Result;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::{debug, warn};

const SAVEPOINT: &str = "trialstore_scope";

/// Run `f` inside a write transaction (or a savepoint when nested).
///
/// Outermost scopes begin with `BEGIN IMMEDIATE` so that concurrent writers
/// queue on the busy timeout instead of failing a read→write lock upgrade.
///
/// # Errors
///
/// Returns the closure's error, or the database error from begin/commit.
pub fn with_transaction<F, R>(conn: &Connection, op: &str, f: F) -> Result<R>
where
    F: FnOnce(&Connection) -> Result<R>,
{
    if !conn.is_autocommit() {
        return with_savepoint(conn, op, f);
    }

    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    debug!(op, "Transaction started");

    match f(&tx) {
        Ok(value) => {
            // On commit failure the guard is dropped still open, which rolls back.
            tx.commit()?;
            debug!(op, "Transaction committed");
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) = tx.rollback() {
                warn!(op, error = %rollback_err, "Rollback failed");
            }
            debug!(op, error = %e, "Transaction rolled back");
            Err(e)
        }
    }
}

/// Run `f` against one consistent read snapshot.
///
/// Multi-table reads (a trial and its sub-rows) must not straddle another
/// writer's commit. Inside an existing transaction the closure simply runs.
///
/// # Errors
///
/// Returns the closure's error, or the database error from begin.
pub fn read_snapshot<F, R>(conn: &Connection, f: F) -> Result<R>
where
    F: FnOnce(&Connection) -> Result<R>,
{
    if !conn.is_autocommit() {
        return f(conn);
    }

    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Deferred)?;
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
}

fn with_savepoint<F, R>(conn: &Connection, op: &str, f: F) -> Result<R>
where
    F: FnOnce(&Connection) -> Result<R>,
{
    conn.execute_batch(&format!("SAVEPOINT {SAVEPOINT}"))?;
    debug!(op, "Savepoint started");

    match f(conn) {
        Ok(value) => {
            conn.execute_batch(&format!("RELEASE {SAVEPOINT}"))?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) =
                conn.execute_batch(&format!("ROLLBACK TO {SAVEPOINT}; RELEASE {SAVEPOINT}"))
            {
                warn!(op, error = %rollback_err, "Savepoint rollback failed");
            }
            debug!(op, error = %e, "Savepoint rolled back");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (x INTEGER PRIMARY KEY)").unwrap();
        conn
    }

    fn count(conn: &Connection) -> i64 {
        conn.query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn test_commit_on_success() {
        let conn = setup();
        let out = with_transaction(&conn, "insert", |tx| {
            tx.execute("INSERT INTO t VALUES (1)", [])?;
            Ok(7)
        })
        .unwrap();

        assert_eq!(out, 7);
        assert_eq!(count(&conn), 1);
        assert!(conn.is_autocommit());
    }

    #[test]
    fn test_rollback_and_propagate_on_error() {
        let conn = setup();
        let err = with_transaction(&conn, "insert", |tx| {
            tx.execute("INSERT INTO t VALUES (1)", [])?;
            Err::<(), _>(Error::Other("boom".to_string()))
        })
        .unwrap_err();

        assert!(matches!(err, Error::Other(ref m) if m == "boom"));
        assert_eq!(count(&conn), 0);
        assert!(conn.is_autocommit());
    }

    #[test]
    fn test_rollback_on_panic() {
        let conn = setup();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _: Result<()> = with_transaction(&conn, "panic", |tx| {
                tx.execute("INSERT INTO t VALUES (1)", [])?;
                panic!("worker died");
            });
        }));

        assert!(result.is_err());
        assert_eq!(count(&conn), 0);
        assert!(conn.is_autocommit());
    }

    #[test]
    fn test_nested_scope_does_not_commit() {
        let conn = setup();
        let err = with_transaction(&conn, "outer", |tx| {
            with_transaction(tx, "inner", |inner| {
                inner.execute("INSERT INTO t VALUES (1)", [])?;
                Ok(())
            })?;
            // Inner work is visible inside the outer scope...
            assert_eq!(count(tx), 1);
            Err::<(), _>(Error::Other("outer failed".to_string()))
        })
        .unwrap_err();

        // ...but discarded with it.
        assert!(matches!(err, Error::Other(_)));
        assert_eq!(count(&conn), 0);
    }

    #[test]
    fn test_nested_failure_rolls_back_only_inner() {
        let conn = setup();
        with_transaction(&conn, "outer", |tx| {
            tx.execute("INSERT INTO t VALUES (1)", [])?;
            let inner = with_transaction(tx, "inner", |inner| {
                inner.execute("INSERT INTO t VALUES (2)", [])?;
                Err::<(), _>(Error::Other("inner failed".to_string()))
            });
            assert!(inner.is_err());
            Ok(())
        })
        .unwrap();

        assert_eq!(count(&conn), 1);
    }

    #[test]
    fn test_commit_failure_rolls_back() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             CREATE TABLE parent (id INTEGER PRIMARY KEY);
             CREATE TABLE child (
                 id INTEGER PRIMARY KEY,
                 parent_id INTEGER REFERENCES parent(id) DEFERRABLE INITIALLY DEFERRED
             );",
        )
        .unwrap();

        // The deferred foreign key is only checked at COMMIT.
        let err = with_transaction(&conn, "orphan", |tx| {
            tx.execute("INSERT INTO child (id, parent_id) VALUES (1, 99)", [])?;
            Ok(())
        })
        .unwrap_err();

        assert!(matches!(err, Error::Database(_)));
        assert!(conn.is_autocommit());
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM child", [], |row| row.get(0))
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_read_snapshot() {
        let conn = setup();
        conn.execute("INSERT INTO t VALUES (1)", []).unwrap();
        let n = read_snapshot(&conn, |c| Ok(count(c))).unwrap();
        assert_eq!(n, 1);
        assert!(conn.is_autocommit());
    }
}
