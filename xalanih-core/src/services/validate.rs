//! Offline syntax check of migration files

use serde::Serialize;
use sqlparser::parser::Parser;

use crate::domain::result::Result;
use crate::domain::MigrationFile;
use crate::ports::DialectRequests;
use crate::splitter::{split_statements, SplitError};

/// One statement the engine's parser rejected
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    pub identifier: String,
    /// Position of the statement in its file; `None` when the file could not
    /// be split at all
    pub statement_index: Option<usize>,
    pub line: usize,
    pub message: String,
}

/// Parse every statement with the engine's `sqlparser` dialect.
///
/// The parser is stricter than some engines, so an issue is a warning
/// rather than proof the migration would fail.
pub struct ValidationService<'a> {
    requests: &'a dyn DialectRequests,
}

impl<'a> ValidationService<'a> {
    pub fn new(requests: &'a dyn DialectRequests) -> Self {
        Self { requests }
    }

    /// Issues across `files`, in file then statement order. Unreadable
    /// files are errors, not issues.
    pub fn validate(&self, files: &[MigrationFile]) -> Result<Vec<ValidationIssue>> {
        let mut issues = Vec::new();
        for file in files {
            issues.extend(self.validate_file(file)?);
        }
        Ok(issues)
    }

    pub fn validate_file(&self, file: &MigrationFile) -> Result<Vec<ValidationIssue>> {
        let content = file.content()?;
        let statements = match split_statements(&content, &self.requests.lexicon()) {
            Ok(statements) => statements,
            Err(e @ SplitError::Unterminated { line, .. }) => {
                return Ok(vec![ValidationIssue {
                    identifier: file.identifier().to_string(),
                    statement_index: None,
                    line,
                    message: e.to_string(),
                }]);
            }
        };

        let dialect = self.requests.parser_dialect();
        Ok(statements
            .iter()
            .filter_map(|statement| {
                Parser::parse_sql(dialect.as_ref(), &statement.sql)
                    .err()
                    .map(|e| ValidationIssue {
                        identifier: file.identifier().to_string(),
                        statement_index: Some(statement.index),
                        line: statement.line,
                        message: clean_parser_message(&e.to_string()),
                    })
            })
            .collect())
    }
}

fn clean_parser_message(msg: &str) -> String {
    msg.trim_start_matches("sql parser error: ").to_string()
}
