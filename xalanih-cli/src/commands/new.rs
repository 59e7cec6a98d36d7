//! New command - create the next migration file

use anyhow::Result;
use colored::Colorize;
use dialoguer::Input;
use xalanih_core::Error;

use super::{get_context, print_json, GlobalArgs};

pub fn run(global: &GlobalArgs, description: Option<String>, json: bool) -> Result<()> {
    let ctx = get_context(global)?;

    let description = match description {
        Some(d) => d,
        None if !json && atty::is(atty::Stream::Stdin) => Input::new()
            .with_prompt("Describe the migration")
            .interact_text()?,
        None => return Err(Error::config("a migration description is required").into()),
    };

    let path = ctx.new_migration(&description)?;

    if json {
        print_json(serde_json::json!({ "path": path.to_string_lossy() }))?;
    } else {
        println!("{} {}", "Created".green(), path.display());
    }
    Ok(())
}
