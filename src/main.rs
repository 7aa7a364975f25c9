//! trialstore CLI entry point.

use clap::Parser;
use std::process::ExitCode;
use trialstore::cli::commands;
use trialstore::cli::{Cli, Commands};
use trialstore::error::Error;

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up tracing based on verbosity
    init_tracing(cli.verbose, cli.quiet);

    // Run the command and handle errors
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if cli.json {
                eprintln!("{}", e.to_structured_json());
            } else if !cli.quiet {
                if let Some(hint) = e.hint() {
                    eprintln!("Error: {e}\n  Hint: {hint}");
                } else {
                    eprintln!("Error: {e}");
                }
            }
            ExitCode::from(e.exit_code())
        }
    }
}

fn init_tracing(verbose: u8, quiet: bool) {
    use tracing_subscriber::EnvFilter;

    if quiet {
        return;
    }

    // Honor RUST_LOG if set, otherwise use verbosity flag
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match verbose {
            0 => EnvFilter::new("warn"),
            1 => EnvFilter::new("info"),
            2 => EnvFilter::new("debug,rusqlite=info"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn run(cli: &Cli) -> Result<(), Error> {
    let storage = cli.storage.as_deref();

    match &cli.command {
        Commands::Upgrade => commands::upgrade::execute(storage, cli.json),
        Commands::Version => commands::version::execute(cli.json),
        Commands::Studies => commands::studies::execute(storage, cli.json),
        Commands::Trials { study, state } => {
            commands::trials::execute(storage, study, state.as_deref(), cli.json)
        }
    }
}
