//! Study model for trialstore.
//!
//! A study is a named optimization run. Its directions are fixed at creation;
//! its attributes stay mutable for the study's whole lifetime.

use crate::error::Error;
use crate::model::FrozenTrial;
use crate::validate::normalize_direction;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Storage identifier of a study.
pub type StudyId = i64;

/// Optimization direction of one objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StudyDirection {
    Minimize,
    Maximize,
}

impl StudyDirection {
    /// Get the string representation for storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Minimize => "MINIMIZE",
            Self::Maximize => "MAXIMIZE",
        }
    }
}

impl fmt::Display for StudyDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StudyDirection {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_direction(s) {
            Ok(canonical) if canonical == "maximize" => Ok(Self::Maximize),
            Ok(_) => Ok(Self::Minimize),
            Err((input, suggestion)) => Err(Error::InvalidArgument(match suggestion {
                Some(s) => format!("unknown direction '{input}' (did you mean '{s}'?)"),
                None => format!("unknown direction '{input}'"),
            })),
        }
    }
}

/// Overview of one stored study.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudySummary {
    pub study_id: StudyId,
    pub study_name: String,
    pub directions: Vec<StudyDirection>,
    pub user_attrs: BTreeMap<String, serde_json::Value>,
    pub system_attrs: BTreeMap<String, serde_json::Value>,
    pub n_trials: usize,
    /// Start time of the earliest trial, if any trial has started.
    pub datetime_start: Option<DateTime<Utc>>,
    /// Best completed trial; only tracked for single-objective studies.
    pub best_trial: Option<FrozenTrial>,
}
