//! SQLite storage layer for trialstore.
//!
//! This module provides the persistence layer using SQLite with:
//! - WAL mode so readers never block the writer
//! - Scoped transactions for atomic multi-row writes
//! - An ordered migration chain gated at open time
//! - Heartbeat-based detection of crashed workers
//!
//! # Submodules
//!
//! - [`schema`] - Base table layout and catalog helpers
//! - [`migrations`] - The ordered chain of schema versions
//! - [`version`] - Reading, checking and upgrading the schema version
//! - [`transaction`] - Commit/rollback scopes with savepoint nesting
//! - [`sqlite`] - The storage handle and study operations
//! - [`trials`] - Trial creation, merge-updates and batched reads
//! - [`heartbeat`] - Liveness recording and stale-trial reconciliation
//! - [`url`] - Storage locator parsing

pub mod heartbeat;
pub mod migrations;
pub mod schema;
pub mod sqlite;
pub mod transaction;
pub mod trials;
pub mod url;
pub mod version;

pub use heartbeat::HeartbeatGuard;
pub use sqlite::SqliteStorage;
pub use transaction::with_transaction;
pub use trials::{MAX_CREATE_TRIAL_RETRIES, MAX_IN_CLAUSE_PARAMS};
pub use url::StorageUrl;
pub use version::{VersionInfo, VersionManager};
