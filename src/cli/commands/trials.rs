//! Trials command implementation.

use super::open_storage;
use crate::error::{Error, Result};
use crate::model::TrialState;
use crate::validate::find_similar_names;

/// Execute the trials command.
///
/// # Errors
///
/// Returns an error if the state is unknown, or the study does not exist.
pub fn execute(storage: Option<&str>, study: &str, state: Option<&str>, json: bool) -> Result<()> {
    let state = state.map(str::parse::<TrialState>).transpose()?;
    let storage = open_storage(storage, false)?;

    let study_id = match storage.get_study_id_from_name(study) {
        Err(Error::StudyNotFound { id }) => {
            if !json {
                let names: Vec<String> = storage
                    .get_all_studies()?
                    .into_iter()
                    .map(|s| s.study_name)
                    .collect();
                let similar = find_similar_names(&id, &names, 3);
                if !similar.is_empty() {
                    eprintln!("Did you mean: {}?", similar.join(", "));
                }
            }
            return Err(Error::StudyNotFound { id });
        }
        other => other?,
    };
    let states = state.map(|s| vec![s]);
    let trials = storage.get_trials(study_id, states.as_deref(), None)?;

    if json {
        println!("{}", serde_json::to_string(&trials)?);
        return Ok(());
    }

    if trials.is_empty() {
        println!("No trials.");
        return Ok(());
    }

    println!("{:<7} {:<9} {:<24} {:>6}  PARAMS", "NUMBER", "STATE", "VALUES", "STEP");
    for trial in &trials {
        let values = trial.values.as_ref().map_or_else(
            || "-".to_string(),
            |v| {
                v.iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            },
        );
        let params = trial
            .external_params()
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join(" ");
        let step = trial
            .last_step()
            .map_or_else(|| "-".to_string(), |s| s.to_string());
        println!(
            "{:<7} {:<9} {:<24} {step:>6}  {params}",
            trial.number,
            trial.state.as_str(),
            values
        );
    }
    Ok(())
}
