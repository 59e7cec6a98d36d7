//! Apply command - run pending migrations

use std::time::Duration;

use anyhow::Result;
use colored::Colorize;

use super::{get_context, get_logger, print_json, ConsoleSink, GlobalArgs};

pub struct ApplyArgs {
    pub dry_run: bool,
    pub timeout: Option<u64>,
    pub lock_timeout: Option<u64>,
    pub verify_checksums: bool,
    pub json: bool,
}

pub fn run(global: &GlobalArgs, args: ApplyArgs) -> Result<()> {
    let ctx = get_context(global)?;

    let mut options = ctx.config.run_options();
    options.dry_run = args.dry_run;
    options.verify_checksums |= args.verify_checksums;
    if let Some(secs) = args.lock_timeout {
        options.lock_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = args.timeout {
        options = options.with_timeout(Duration::from_secs(secs));
    }

    let sink = ConsoleSink::new(get_logger("apply"), args.json);
    let summary = ctx.apply(options, &sink)?;

    if args.json {
        return print_json(&summary);
    }

    if summary.dry_run {
        if summary.pending.is_empty() {
            println!("{}", "Nothing to apply".green());
        } else {
            println!("{}", "Would apply:".bold());
            for identifier in &summary.pending {
                println!("  • {}", identifier);
            }
        }
        return Ok(());
    }

    println!(
        "{}",
        format!(
            "Applied {} migration(s), {} already up to date ({} ms)",
            summary.applied_count, summary.skipped_count, summary.duration_ms
        )
        .green()
    );
    Ok(())
}
