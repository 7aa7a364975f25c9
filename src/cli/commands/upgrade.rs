//! Upgrade command implementation.

use super::open_storage;
use crate::error::Result;
use serde::Serialize;

#[derive(Serialize)]
struct UpgradeOutput {
    from: String,
    to: String,
    applied: Vec<&'static str>,
}

/// Execute the upgrade command.
///
/// Opens the store with the compatibility check bypassed, then applies every
/// pending migration.
///
/// # Errors
///
/// Returns an error if the store cannot be opened or a migration fails.
pub fn execute(storage: Option<&str>, json: bool) -> Result<()> {
    let storage = open_storage(storage, true)?;

    let from = storage.current_version()?;
    let applied = storage.upgrade()?;
    let to = storage.current_version()?;

    if json {
        let output = UpgradeOutput { from, to, applied };
        println!("{}", serde_json::to_string(&output)?);
        return Ok(());
    }

    if applied.is_empty() {
        println!("Storage is already at the latest version {to}");
    } else {
        println!("Upgraded storage from {from} to {to}");
        for tag in &applied {
            println!("  applied {tag}");
        }
    }
    Ok(())
}
