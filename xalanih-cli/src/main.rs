//! Xalanih CLI - schema version control for SQL databases

use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod output;

use commands::{apply, logs, new, status, validate, GlobalArgs, Reported};

/// Xalanih - apply ordered SQL migrations exactly once
#[derive(Parser)]
#[command(name = "xalanih", version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending migrations
    Apply {
        /// Show what would be applied without applying it
        #[arg(long)]
        dry_run: bool,
        /// Abort at the next statement boundary after SECS seconds
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
        /// How long to wait for another run to finish
        #[arg(long, value_name = "SECS")]
        lock_timeout: Option<u64>,
        /// Fail when an applied migration was edited afterwards
        #[arg(long)]
        verify_checksums: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show applied, pending and drifted migrations
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check migration syntax without connecting
    Validate {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Create the next migration file
    New {
        /// What the migration does, e.g. "add email to users"
        description: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// View and manage the run log
    Logs {
        #[command(subcommand)]
        command: logs::LogsCommands,
    },
}

impl Commands {
    fn json(&self) -> bool {
        match self {
            Commands::Apply { json, .. }
            | Commands::Status { json }
            | Commands::Validate { json }
            | Commands::New { json, .. } => *json,
            Commands::Logs { .. } => false,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let json = cli.command.json();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(Reported(code)) = e.downcast_ref::<Reported>() {
                return ExitCode::from(*code);
            }
            match e.downcast::<xalanih_core::Error>() {
                Ok(err) => {
                    let code = err.exit_code();
                    output::failure(err, json);
                    ExitCode::from(code)
                }
                Err(e) => {
                    eprintln!("{:#}", e);
                    ExitCode::FAILURE
                }
            }
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let global = cli.global;
    match cli.command {
        Commands::Apply {
            dry_run,
            timeout,
            lock_timeout,
            verify_checksums,
            json,
        } => apply::run(
            &global,
            apply::ApplyArgs {
                dry_run,
                timeout,
                lock_timeout,
                verify_checksums,
                json,
            },
        ),
        Commands::Status { json } => status::run(&global, json),
        Commands::Validate { json } => validate::run(&global, json),
        Commands::New { description, json } => new::run(&global, description, json),
        Commands::Logs { command } => logs::run(command),
    }
}
