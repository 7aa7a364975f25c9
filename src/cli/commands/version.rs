//! Version command implementation.

use crate::error::Result;
use crate::storage::migrations::{head_tag, HEAD_SCHEMA_VERSION, MIGRATIONS};
use serde::Serialize;

#[derive(Serialize)]
struct VersionOutput<'a> {
    version: &'a str,
    build: &'a str,
    schema_version: i64,
    schema_tag: &'a str,
    known_schema_tags: Vec<&'a str>,
}

/// Execute the version command.
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn execute(json: bool) -> Result<()> {
    let version = env!("CARGO_PKG_VERSION");
    let build = if cfg!(debug_assertions) {
        "dev"
    } else {
        "release"
    };

    if json {
        let output = VersionOutput {
            version,
            build,
            schema_version: HEAD_SCHEMA_VERSION,
            schema_tag: head_tag(),
            known_schema_tags: MIGRATIONS.iter().rev().map(|m| m.version).collect(),
        };
        let payload = serde_json::to_string(&output)?;
        println!("{payload}");
        return Ok(());
    }

    println!("trialstore version {version} ({build})");
    println!("schema {} (version {HEAD_SCHEMA_VERSION})", head_tag());
    Ok(())
}
