//! Command implementations.

pub mod studies;
pub mod trials;
pub mod upgrade;
pub mod version;

use crate::config::{resolve_storage_url, StorageConfig};
use crate::error::{Error, Result};
use crate::storage::SqliteStorage;

/// Open the storage selected by `--storage`, the environment or the default.
fn open_storage(explicit: Option<&str>, skip_compatibility_check: bool) -> Result<SqliteStorage> {
    let locator = resolve_storage_url(explicit).ok_or_else(|| {
        Error::Config("could not determine the home directory; pass --storage".to_string())
    })?;

    let mut config = StorageConfig::from_env()?;
    if skip_compatibility_check {
        config = config.skip_compatibility_check(true);
    }
    SqliteStorage::open(&locator, config)
}
