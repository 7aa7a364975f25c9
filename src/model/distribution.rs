//! Parameter distributions.
//!
//! A distribution describes the valid domain of one parameter and converts
//! between the user-facing value and the internal `f64` that is stored in
//! `trial_params.param_value`. Categorical params are stored as the index of
//! the chosen value.
//!
//! Distributions are persisted as JSON of the form
//! `{"name": "UniformDistribution", "attributes": {"low": 0.0, "high": 1.0}}`.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Domain of a single parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "attributes")]
pub enum Distribution {
    /// Continuous range `[low, high)`.
    #[serde(rename = "UniformDistribution")]
    Uniform { low: f64, high: f64 },

    /// Continuous range `[low, high)` sampled in log space.
    #[serde(rename = "LogUniformDistribution")]
    LogUniform { low: f64, high: f64 },

    /// Range `[low, high]` quantized by `q`.
    #[serde(rename = "DiscreteUniformDistribution")]
    DiscreteUniform { low: f64, high: f64, q: f64 },

    /// Integer range `[low, high]` with a fixed step.
    #[serde(rename = "IntUniformDistribution")]
    IntUniform {
        low: i64,
        high: i64,
        #[serde(default = "default_step")]
        step: i64,
    },

    /// Integer range `[low, high]` sampled in log space.
    #[serde(rename = "IntLogUniformDistribution")]
    IntLogUniform { low: i64, high: i64 },

    /// One of a fixed set of scalar choices.
    #[serde(rename = "CategoricalDistribution")]
    Categorical { choices: Vec<Value> },
}

const fn default_step() -> i64 {
    1
}

impl Distribution {
    /// Short variant name, as used in the persisted JSON.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Uniform { .. } => "UniformDistribution",
            Self::LogUniform { .. } => "LogUniformDistribution",
            Self::DiscreteUniform { .. } => "DiscreteUniformDistribution",
            Self::IntUniform { .. } => "IntUniformDistribution",
            Self::IntLogUniform { .. } => "IntLogUniformDistribution",
            Self::Categorical { .. } => "CategoricalDistribution",
        }
    }

    /// Check that the bounds, step and choices are well-formed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        let problem = match self {
            Self::Uniform { low, high } if low > high => {
                Some(format!("low {low} is greater than high {high}"))
            }
            Self::LogUniform { low, high } if low > high => {
                Some(format!("low {low} is greater than high {high}"))
            }
            Self::LogUniform { low, .. } if *low <= 0.0 => {
                Some(format!("log-uniform low must be positive, got {low}"))
            }
            Self::DiscreteUniform { low, high, .. } if low > high => {
                Some(format!("low {low} is greater than high {high}"))
            }
            Self::DiscreteUniform { q, .. } if *q <= 0.0 => {
                Some(format!("q must be positive, got {q}"))
            }
            Self::IntUniform { low, high, .. } if low > high => {
                Some(format!("low {low} is greater than high {high}"))
            }
            Self::IntUniform { step, .. } if *step <= 0 => {
                Some(format!("step must be positive, got {step}"))
            }
            Self::IntLogUniform { low, high } if low > high => {
                Some(format!("low {low} is greater than high {high}"))
            }
            Self::IntLogUniform { low, .. } if *low < 1 => {
                Some(format!("int-log-uniform low must be at least 1, got {low}"))
            }
            Self::Categorical { choices } if choices.is_empty() => {
                Some("categorical choices must not be empty".to_string())
            }
            Self::Categorical { choices } => choices
                .iter()
                .find(|c| c.is_array() || c.is_object())
                .map(|c| format!("categorical choice {c} is not a scalar")),
            _ => None,
        };

        match problem {
            Some(msg) => Err(Error::InvalidArgument(format!("{}: {msg}", self.name()))),
            None => Ok(()),
        }
    }

    /// Whether an internal value lies inside the domain.
    #[must_use]
    #[allow(clippy::float_cmp, clippy::cast_precision_loss)]
    pub fn contains(&self, internal: f64) -> bool {
        if internal.is_nan() {
            return false;
        }
        match self {
            Self::Uniform { low, high } | Self::LogUniform { low, high } => {
                if low == high {
                    internal == *low
                } else {
                    *low <= internal && internal < *high
                }
            }
            Self::DiscreteUniform { low, high, .. } => *low <= internal && internal <= *high,
            Self::IntUniform { low, high, .. } | Self::IntLogUniform { low, high } => {
                internal.fract() == 0.0 && (*low as f64) <= internal && internal <= (*high as f64)
            }
            Self::Categorical { choices } => {
                internal.fract() == 0.0 && 0.0 <= internal && internal < choices.len() as f64
            }
        }
    }

    /// Convert a user-facing value into its stored representation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the value has the wrong type,
    /// is not a categorical choice, or falls outside the domain.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    pub fn to_internal_repr(&self, value: &Value) -> Result<f64> {
        let internal = match self {
            Self::Categorical { choices } => choices
                .iter()
                .position(|c| c == value)
                .map(|idx| idx as f64)
                .ok_or_else(|| {
                    Error::InvalidArgument(format!("{value} is not one of the choices {choices:?}"))
                })?,
            Self::IntUniform { .. } | Self::IntLogUniform { .. } => {
                let int = value.as_i64().or_else(|| {
                    value
                        .as_f64()
                        .filter(|f| f.fract() == 0.0)
                        .map(|f| f as i64)
                });
                int.ok_or_else(|| {
                    Error::InvalidArgument(format!("{value} is not an integer"))
                })? as f64
            }
            _ => value
                .as_f64()
                .ok_or_else(|| Error::InvalidArgument(format!("{value} is not a number")))?,
        };

        if self.contains(internal) {
            Ok(internal)
        } else {
            Err(Error::InvalidArgument(format!(
                "{value} is outside {}",
                self.to_json()
            )))
        }
    }

    /// Convert a stored value back to its user-facing form.
    ///
    /// Out-of-range categorical indices come back as `null`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn to_external_repr(&self, internal: f64) -> Value {
        match self {
            Self::Categorical { choices } => {
                if internal < 0.0 {
                    return Value::Null;
                }
                choices.get(internal as usize).cloned().unwrap_or(Value::Null)
            }
            Self::IntUniform { .. } | Self::IntLogUniform { .. } => Value::from(internal as i64),
            _ => Value::from(internal),
        }
    }

    /// Whether two distributions may describe the same param name.
    ///
    /// The variant must match; categorical params must also keep the same
    /// choices, since stored indices would otherwise change meaning.
    #[must_use]
    pub fn is_compatible_with(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Categorical { choices: a }, Self::Categorical { choices: b }) => a == b,
            _ => std::mem::discriminant(self) == std::mem::discriminant(other),
        }
    }

    /// Serialize to the persisted JSON form.
    #[must_use]
    pub fn to_json(&self) -> String {
        // Serialization of plain numbers and scalar JSON values cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Parse the persisted JSON form.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if the text is not a known distribution.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
