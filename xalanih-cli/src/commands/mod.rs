//! CLI command implementations

pub mod apply;
pub mod logs;
pub mod new;
pub mod status;
pub mod validate;

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use xalanih_core::config::{Config, CONFIG_FILE};
use xalanih_core::services::{xalanih_home, LogEvent, LoggingService};
use xalanih_core::{EventSink, OperationResult, XalanihContext};

/// Connection and project options shared by every command.
///
/// Flags override `XALANIH_*` variables, which override the settings file.
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Settings file
    #[arg(long, global = true, default_value = CONFIG_FILE)]
    pub config: PathBuf,
    /// Database engine (duckdb, sqlite, postgres, mysql)
    #[arg(long, global = true)]
    pub engine: Option<String>,
    /// Connection URL, or database file for embedded engines
    #[arg(long, global = true)]
    pub connection_string: Option<String>,
    #[arg(long, global = true)]
    pub host: Option<String>,
    #[arg(long, global = true)]
    pub port: Option<u16>,
    #[arg(long, global = true)]
    pub user: Option<String>,
    #[arg(long, global = true)]
    pub password: Option<String>,
    #[arg(long, global = true)]
    pub database: Option<String>,
    /// Directory holding the NNNN_description.sql files
    #[arg(long, global = true)]
    pub migrations_dir: Option<PathBuf>,
    /// Tracking table name
    #[arg(long, global = true)]
    pub table: Option<String>,
}

impl GlobalArgs {
    /// Settings file plus environment, with these flags on top
    pub fn load_config(&self) -> Result<Config> {
        let mut config = Config::load(&self.config)?;

        if let Some(v) = &self.engine {
            config.engine = Some(v.clone());
        }
        if let Some(v) = &self.connection_string {
            config.connection_string = Some(v.clone());
        }
        if let Some(v) = &self.host {
            config.host = Some(v.clone());
        }
        if let Some(v) = self.port {
            config.port = Some(v);
        }
        if let Some(v) = &self.user {
            config.user = Some(v.clone());
        }
        if let Some(v) = &self.password {
            config.password = Some(v.clone());
        }
        if let Some(v) = &self.database {
            config.database = Some(v.clone());
        }
        if let Some(v) = &self.migrations_dir {
            config.migrations_dir = v.clone();
        }
        if let Some(v) = &self.table {
            config.table = v.clone();
        }
        Ok(config)
    }
}

/// The command already reported its failure; exit with this code
#[derive(Debug)]
pub struct Reported(pub u8);

impl std::fmt::Display for Reported {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "exit code {}", self.0)
    }
}

impl std::error::Error for Reported {}

/// Build the context from the merged configuration
pub fn get_context(global: &GlobalArgs) -> Result<XalanihContext> {
    Ok(XalanihContext::new(global.load_config()?)?)
}

/// Get the logging service for CLI operations
///
/// Returns None if logging fails to initialize (shouldn't block operations)
pub fn get_logger(command: &str) -> Option<LoggingService> {
    LoggingService::new(&xalanih_home(), env!("CARGO_PKG_VERSION"))
        .ok()
        .map(|l| l.with_command(command))
}

/// Print `data` inside a success envelope
pub fn print_json<T: Serialize>(data: T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&OperationResult::ok(data))?);
    Ok(())
}

/// Prints run events to the terminal and forwards them to the log database
pub struct ConsoleSink {
    logger: Option<LoggingService>,
    quiet: bool,
}

impl ConsoleSink {
    pub fn new(logger: Option<LoggingService>, quiet: bool) -> Self {
        Self { logger, quiet }
    }

    fn print(&self, event: &LogEvent) {
        let subject = event.identifier.as_deref().unwrap_or_default();
        match event.event.as_str() {
            "pending_count" => {
                let n = event.count.unwrap_or_default();
                println!("{}", format!("{} pending migration(s)", n).cyan());
            }
            "applying" => println!("  {} {}", "→".cyan(), subject),
            "applied" => println!("  {} {}", "✓".green(), subject),
            "drift" => println!(
                "{}",
                format!("warning: {} changed since it was applied", subject).yellow()
            ),
            "out_of_order" => println!(
                "{}",
                format!("warning: {} sorts before an applied migration", subject).yellow()
            ),
            "connect_retry" => println!(
                "{}",
                format!(
                    "database busy, retrying (attempt {})",
                    event.count.unwrap_or_default()
                )
                .dimmed()
            ),
            "failed" => eprintln!("{}", event.message().red()),
            "done" => {}
            _ => println!("{}", event.message().dimmed()),
        }
    }
}

impl EventSink for ConsoleSink {
    fn emit(&self, event: &LogEvent) {
        if !self.quiet {
            self.print(event);
        }
        if let Some(logger) = &self.logger {
            let _ = logger.log(event);
        }
    }
}
