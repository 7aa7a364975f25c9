//! Studies command implementation.

use super::open_storage;
use crate::error::Result;
use crate::model::StudyDirection;

/// Execute the studies command.
///
/// # Errors
///
/// Returns an error if the store cannot be opened or read.
pub fn execute(storage: Option<&str>, json: bool) -> Result<()> {
    let storage = open_storage(storage, false)?;
    let studies = storage.get_all_studies()?;

    if json {
        println!("{}", serde_json::to_string(&studies)?);
        return Ok(());
    }

    if studies.is_empty() {
        println!("No studies.");
        return Ok(());
    }

    println!("{:<6} {:<32} {:<20} {:>8}  BEST", "ID", "NAME", "DIRECTIONS", "TRIALS");
    for study in &studies {
        let directions = study
            .directions
            .iter()
            .map(StudyDirection::as_str)
            .collect::<Vec<_>>()
            .join(",");
        let best = study
            .best_trial
            .as_ref()
            .and_then(|t| t.value().map(|v| format!("{v} (#{})", t.number)))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<6} {:<32} {:<20} {:>8}  {best}",
            study.study_id, study.study_name, directions, study.n_trials
        );
    }
    Ok(())
}
