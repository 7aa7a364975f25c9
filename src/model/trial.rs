//! Trial model for trialstore.
//!
//! Trials are single parameter-evaluation attempts within a study. Their
//! state only ever leaves RUNNING (or WAITING) once; COMPLETE, PRUNED and
//! FAIL are terminal.

use crate::error::Error;
use crate::model::Distribution;
use crate::validate::normalize_state;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Storage identifier of a trial.
pub type TrialId = i64;

/// Trial lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TrialState {
    Waiting,
    Running,
    Complete,
    Pruned,
    Fail,
}

impl TrialState {
    /// Every state, in lifecycle order.
    pub const ALL: [Self; 5] = [
        Self::Waiting,
        Self::Running,
        Self::Complete,
        Self::Pruned,
        Self::Fail,
    ];

    /// Get the string representation for storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "WAITING",
            Self::Running => "RUNNING",
            Self::Complete => "COMPLETE",
            Self::Pruned => "PRUNED",
            Self::Fail => "FAIL",
        }
    }

    /// Parse the stored representation.
    ///
    /// Unknown values map to FAIL so a corrupt row can never be resumed.
    #[must_use]
    pub fn from_db(s: &str) -> Self {
        match s {
            "WAITING" => Self::Waiting,
            "RUNNING" => Self::Running,
            "COMPLETE" => Self::Complete,
            "PRUNED" => Self::Pruned,
            _ => Self::Fail,
        }
    }

    /// Whether the state is terminal.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        matches!(self, Self::Complete | Self::Pruned | Self::Fail)
    }
}

impl fmt::Display for TrialState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrialState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_state(s) {
            Ok(canonical) => Ok(Self::from_db(&canonical.to_uppercase())),
            Err((input, suggestion)) => Err(Error::InvalidArgument(match suggestion {
                Some(s) => format!("unknown trial state '{input}' (did you mean '{s}'?)"),
                None => format!("unknown trial state '{input}'"),
            })),
        }
    }
}

/// A snapshot of a stored trial.
///
/// Params are kept in their internal numeric representation next to the
/// distribution that produced them; use [`FrozenTrial::external_params`] to
/// get the user-facing values back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrozenTrial {
    /// Storage identifier (ignored when the trial is used as a template).
    pub trial_id: TrialId,
    /// Sequence number within the study (re-allocated for templates).
    pub number: i64,
    pub state: TrialState,
    /// Objective values; one per study direction.
    pub values: Option<Vec<f64>>,
    pub datetime_start: Option<DateTime<Utc>>,
    pub datetime_complete: Option<DateTime<Utc>>,
    pub params: BTreeMap<String, f64>,
    pub distributions: BTreeMap<String, Distribution>,
    pub user_attrs: BTreeMap<String, serde_json::Value>,
    pub system_attrs: BTreeMap<String, serde_json::Value>,
    pub intermediate_values: BTreeMap<i64, f64>,
}

impl FrozenTrial {
    /// Build an unsaved trial to be passed as a creation template.
    #[must_use]
    pub fn template(state: TrialState) -> Self {
        Self {
            trial_id: -1,
            number: -1,
            state,
            values: None,
            datetime_start: None,
            datetime_complete: None,
            params: BTreeMap::new(),
            distributions: BTreeMap::new(),
            user_attrs: BTreeMap::new(),
            system_attrs: BTreeMap::new(),
            intermediate_values: BTreeMap::new(),
        }
    }

    /// Attach a param in its external representation.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is outside the distribution.
    pub fn with_param(
        mut self,
        name: &str,
        value: &serde_json::Value,
        distribution: Distribution,
    ) -> Result<Self, Error> {
        let internal = distribution.to_internal_repr(value)?;
        self.params.insert(name.to_string(), internal);
        self.distributions.insert(name.to_string(), distribution);
        Ok(self)
    }

    /// The single objective value, if this is a single-objective trial.
    #[must_use]
    pub fn value(&self) -> Option<f64> {
        match self.values.as_deref() {
            Some([v]) => Some(*v),
            _ => None,
        }
    }

    /// Params converted back to their external representation.
    #[must_use]
    pub fn external_params(&self) -> BTreeMap<String, serde_json::Value> {
        self.params
            .iter()
            .filter_map(|(name, internal)| {
                self.distributions
                    .get(name)
                    .map(|d| (name.clone(), d.to_external_repr(*internal)))
            })
            .collect()
    }

    /// Most recent intermediate value (highest step), if any.
    #[must_use]
    pub fn last_step(&self) -> Option<i64> {
        self.intermediate_values.keys().next_back().copied()
    }
}

/// A partial trial update.
///
/// Scalar fields replace the stored value when present. Map fields are merged
/// key by key: supplied keys are inserted or overwritten, every other stored
/// key is left alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrialUpdate {
    pub state: Option<TrialState>,
    pub values: Option<Vec<f64>>,
    pub datetime_complete: Option<DateTime<Utc>>,
    /// Param name → (internal value, distribution).
    pub params: BTreeMap<String, (f64, Distribution)>,
    pub user_attrs: BTreeMap<String, serde_json::Value>,
    pub system_attrs: BTreeMap<String, serde_json::Value>,
    pub intermediate_values: BTreeMap<i64, f64>,
}

impl TrialUpdate {
    /// Create an empty update.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn state(mut self, state: TrialState) -> Self {
        self.state = Some(state);
        self
    }

    #[must_use]
    pub fn values(mut self, values: Vec<f64>) -> Self {
        self.values = Some(values);
        self
    }

    #[must_use]
    pub fn datetime_complete(mut self, at: DateTime<Utc>) -> Self {
        self.datetime_complete = Some(at);
        self
    }

    #[must_use]
    pub fn param(mut self, name: &str, internal: f64, distribution: Distribution) -> Self {
        self.params.insert(name.to_string(), (internal, distribution));
        self
    }

    #[must_use]
    pub fn user_attr(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.user_attrs.insert(key.to_string(), value.into());
        self
    }

    #[must_use]
    pub fn system_attr(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.system_attrs.insert(key.to_string(), value.into());
        self
    }

    #[must_use]
    pub fn intermediate_value(mut self, step: i64, value: f64) -> Self {
        self.intermediate_values.insert(step, value);
        self
    }

    /// Whether the update touches nothing at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.is_none()
            && self.values.is_none()
            && self.datetime_complete.is_none()
            && self.params.is_empty()
            && self.user_attrs.is_empty()
            && self.system_attrs.is_empty()
            && self.intermediate_values.is_empty()
    }
}
