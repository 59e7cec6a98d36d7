//! `xalanih logs` - inspect the local run log

use std::path::PathBuf;

use anyhow::Result;
use chrono::{TimeZone, Utc};
use clap::Subcommand;
use colored::Colorize;
use dialoguer::Confirm;
use xalanih_core::services::logging::now_ms;
use xalanih_core::services::{xalanih_home, LogEntry, LoggingService};

use super::print_json;
use crate::output;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Subcommand)]
pub enum LogsCommands {
    /// Show recent run events
    List {
        /// Number of entries to show
        #[arg(short, long, default_value = "50")]
        limit: usize,
        /// Only failures
        #[arg(long)]
        errors: bool,
        /// Only events for this migration, e.g. 0003_add_email
        #[arg(long, value_name = "ID")]
        migration: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete old entries
    Clear {
        /// Keep entries from the last N days
        #[arg(long, default_value = "30")]
        older_than_days: u64,
        /// Do not ask for confirmation
        #[arg(long, short = 'f')]
        force: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Entry counts per event and where the log lives
    Stats {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Copy the log database to a file
    Export {
        /// Destination path
        output: PathBuf,
    },
}

pub fn run(command: LogsCommands) -> Result<()> {
    let service = LoggingService::new(&xalanih_home(), env!("CARGO_PKG_VERSION"))?;

    match command {
        LogsCommands::List {
            limit,
            errors,
            migration,
            json,
        } => {
            let entries = match (&migration, errors) {
                (Some(id), _) => service.history(id, limit)?,
                (None, true) => service.get_errors(limit)?,
                (None, false) => service.get_recent(limit)?,
            };
            if json {
                return print_json(entries);
            }
            print_entries(entries, errors);
        }
        LogsCommands::Clear {
            older_than_days,
            force,
            json,
        } => {
            if !force && !json && !confirm_clear(older_than_days)? {
                output::info("Nothing deleted.");
                return Ok(());
            }
            let deleted = service.delete_before(now_ms() - older_than_days as i64 * DAY_MS)?;
            if json {
                return print_json(serde_json::json!({ "deleted": deleted }));
            }
            output::success(&format!("Deleted {} log entries", deleted));
        }
        LogsCommands::Stats { json } => {
            let total = service.count()?;
            let by_event = service.event_counts()?;
            let db_path = service.db_path().to_path_buf();
            let size_bytes = std::fs::metadata(&db_path).map(|m| m.len()).unwrap_or(0);

            if json {
                let events: serde_json::Map<_, _> = by_event
                    .into_iter()
                    .map(|(event, n)| (event, serde_json::Value::from(n)))
                    .collect();
                return print_json(serde_json::json!({
                    "totalEntries": total,
                    "events": events,
                    "databasePath": db_path.to_string_lossy(),
                    "databaseSizeBytes": size_bytes,
                }));
            }

            println!("{}", "Run log".bold());
            println!("  Entries:  {}", total);
            for (event, n) in &by_event {
                println!("    {:<14} {}", event, n);
            }
            println!("  Database: {}", db_path.display());
            println!("  Size:     {}", output::format_size(size_bytes));
        }
        LogsCommands::Export { output: path } => {
            let written = service.export(&path)?;
            output::success(&format!("Exported run log to {}", written.display()));
        }
    }

    Ok(())
}

fn confirm_clear(days: u64) -> Result<bool> {
    Ok(Confirm::new()
        .with_prompt(format!("Delete run log entries older than {} days?", days))
        .default(false)
        .interact()?)
}

fn format_timestamp(timestamp_ms: i64) -> String {
    Utc.timestamp_millis_opt(timestamp_ms)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| timestamp_ms.to_string())
}

/// What the event was about: a migration, a stage or a count
fn subject(entry: &LogEntry) -> String {
    entry
        .identifier
        .clone()
        .or_else(|| entry.stage.clone())
        .or_else(|| entry.count.map(|c| c.to_string()))
        .or_else(|| entry.engine.clone())
        .unwrap_or_default()
}

fn colored_event(event: &str) -> String {
    match event {
        "applied" => event.green().to_string(),
        "failed" => event.red().to_string(),
        "drift" | "out_of_order" => event.yellow().to_string(),
        _ => event.to_string(),
    }
}

fn print_entries(entries: Vec<LogEntry>, errors_only: bool) {
    if entries.is_empty() {
        output::info("No log entries found.");
        return;
    }

    let mut table = output::create_table();
    table.set_header(vec!["Time", "Command", "Event", "Subject"]);
    for entry in &entries {
        table.add_row(vec![
            format_timestamp(entry.timestamp),
            entry.command.clone().unwrap_or_default(),
            colored_event(&entry.event),
            subject(entry),
        ]);
    }
    println!("{}", table);

    let failures: Vec<&LogEntry> = entries
        .iter()
        .filter(|e| e.error_message.is_some())
        .collect();
    if errors_only || failures.is_empty() {
        return;
    }
    println!();
    println!("{}", "Failures:".red().bold());
    for entry in failures.iter().take(3) {
        println!(
            "  {} {}: {}",
            format_timestamp(entry.timestamp).dimmed(),
            subject(entry),
            entry.error_message.as_deref().unwrap_or_default()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(event: &str) -> LogEntry {
        LogEntry {
            id: 1,
            timestamp: 0,
            app_version: "0.1.0".to_string(),
            platform: "linux".to_string(),
            command: Some("apply".to_string()),
            event: event.to_string(),
            identifier: None,
            stage: None,
            engine: None,
            count: None,
            error_message: None,
        }
    }

    #[test]
    fn test_subject_prefers_identifier() {
        let mut e = entry("failed");
        e.stage = Some("locking".to_string());
        assert_eq!(subject(&e), "locking");
        e.identifier = Some("0002_b".to_string());
        assert_eq!(subject(&e), "0002_b");

        let mut pending = entry("pending_count");
        pending.count = Some(4);
        assert_eq!(subject(&pending), "4");
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0), "1970-01-01 00:00:00");
    }
}
