//! Validate command - offline syntax check of every migration

use anyhow::Result;
use xalanih_core::{Error, OperationResult};

use super::{get_context, print_json, GlobalArgs, Reported};
use crate::output;

pub fn run(global: &GlobalArgs, json: bool) -> Result<()> {
    let ctx = get_context(global)?;
    let issues = ctx.validate()?;

    let Some(first) = issues.first() else {
        return if json {
            print_json(&issues)
        } else {
            output::success("All migrations parsed");
            Ok(())
        };
    };
    let err = Error::invalid_migration(
        &first.identifier,
        format!("{} syntax issue(s) found", issues.len()),
    );

    if json {
        let mut result = OperationResult::fail(err.to_string());
        result.data = Some(&issues);
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Err(Reported(err.exit_code()).into());
    }

    let mut table = output::create_table();
    table.set_header(vec!["Migration", "Statement", "Line", "Problem"]);
    for issue in &issues {
        table.add_row(vec![
            issue.identifier.clone(),
            issue
                .statement_index
                .map(|i| (i + 1).to_string())
                .unwrap_or_else(|| "-".to_string()),
            issue.line.to_string(),
            issue.message.clone(),
        ]);
    }
    println!("{}", table);
    Err(err.into())
}
