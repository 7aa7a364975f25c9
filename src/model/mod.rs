//! Data models for trialstore.
//!
//! This module contains the value types handed across the storage boundary:
//! - Study directions and summaries
//! - Trials, their states, and partial updates
//! - Parameter distributions

pub mod distribution;
pub mod study;
pub mod trial;

pub use distribution::Distribution;
pub use study::{StudyDirection, StudyId, StudySummary};
pub use trial::{FrozenTrial, TrialId, TrialState, TrialUpdate};
