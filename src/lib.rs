//! trialstore - persistent trial storage for distributed hyperparameter
//! optimization.
//!
//! Many workers, possibly on different machines, share one SQLite store.
//! They coordinate only through its transactions and unique constraints.
//!
//! # Architecture
//!
//! - [`model`] - Data types (studies, trials, distributions, updates)
//! - [`storage`] - SQLite database layer, schema versions and heartbeats
//! - [`config`] - Storage locator and settings resolution
//! - [`cli`] - Maintenance command-line interface using clap
//! - [`error`] - Error types and handling
//!
//! # Example
//!
//! ```no_run
//! use trialstore::model::{StudyDirection, TrialState};
//! use trialstore::storage::SqliteStorage;
//!
//! # fn main() -> trialstore::Result<()> {
//! let storage = SqliteStorage::open_memory()?;
//! let study_id = storage.create_study(Some("demo"), &[StudyDirection::Minimize])?;
//! let trial_id = storage.create_trial(study_id, None)?;
//! storage.set_trial_state_values(trial_id, TrialState::Complete, Some(&[0.25]))?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod error;
pub mod model;
pub mod storage;
pub mod validate;

pub use error::{Error, Result};
