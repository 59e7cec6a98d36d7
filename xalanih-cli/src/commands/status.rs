//! Status command - applied, pending and drifted migrations

use anyhow::Result;
use colored::Colorize;
use xalanih_core::StatusKind;

use super::{get_context, print_json, GlobalArgs};
use crate::output;

pub fn run(global: &GlobalArgs, json: bool) -> Result<()> {
    let ctx = get_context(global)?;
    let report = ctx.status()?;

    if json {
        return print_json(&report);
    }

    if report.is_empty() {
        println!("No migrations found in {}", ctx.config.migrations_dir.display());
        return Ok(());
    }

    let mut table = output::create_table();
    table.set_header(vec!["Migration", "Status", "Applied at"]);
    for entry in &report {
        let status = match entry.status {
            StatusKind::Applied => entry.status.as_str().green(),
            StatusKind::Pending => entry.status.as_str().cyan(),
            StatusKind::Drifted => entry.status.as_str().yellow(),
            StatusKind::Missing => entry.status.as_str().red(),
        };
        let applied_at = entry
            .applied_at
            .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        table.add_row(vec![entry.identifier.clone(), status.to_string(), applied_at]);
    }
    println!("{}", table);

    let pending = report
        .iter()
        .filter(|e| e.status == StatusKind::Pending)
        .count();
    println!();
    if pending == 0 {
        output::success("Database is up to date");
    } else {
        output::info(&format!("{} pending migration(s)", pending));
    }
    Ok(())
}
