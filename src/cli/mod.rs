//! CLI definitions using clap.

use clap::{Parser, Subcommand};

pub mod commands;

/// Maintenance tool for trialstore databases
#[derive(Parser, Debug)]
#[command(name = "trialstore", author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Storage locator (default: sqlite:///~/.trialstore/trialstore.db)
    #[arg(long, global = true, env = "TRIALSTORE_STORAGE")]
    pub storage: Option<String>,

    /// Output as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Increase logging verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode (no output except errors)
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Upgrade the storage schema to the latest version
    Upgrade,

    /// Print library and schema version information
    Version,

    /// List stored studies
    Studies,

    /// List the trials of a study
    Trials {
        /// Study name
        study: String,

        /// Only show trials in this state (running, complete, pruned, fail, waiting)
        #[arg(long, short)]
        state: Option<String>,
    },
}
