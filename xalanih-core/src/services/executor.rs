//! Migration executor - runs the statements of one migration file

use std::time::Instant;

use crate::domain::migration::{checksum_of, wants_no_transaction};
use crate::domain::result::{DriverError, Error, Result};
use crate::domain::{DialectProfile, MigrationFile};
use crate::ports::Connection;
use crate::splitter::{split_statements, Statement};

/// What happened while executing one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReport {
    pub identifier: String,
    pub statements: usize,
    /// Statements and completion hook ran inside one transaction
    pub transactional: bool,
}

/// A migration file split into statements, ready to run
#[derive(Debug, Clone)]
pub struct PreparedMigration {
    pub identifier: String,
    /// SHA-256 of the text the statements were split from
    pub checksum: String,
    pub statements: Vec<Statement>,
    pub transactional: bool,
}

fn deadline_passed(deadline: Option<Instant>) -> bool {
    deadline.map(|d| Instant::now() >= d).unwrap_or(false)
}

pub struct MigrationExecutor<'a> {
    profile: &'a DialectProfile,
}

impl<'a> MigrationExecutor<'a> {
    pub fn new(profile: &'a DialectProfile) -> Self {
        Self { profile }
    }

    /// Read and split `file`. Lexical errors are reported before anything
    /// touches the database.
    pub fn prepare(&self, file: &MigrationFile) -> Result<PreparedMigration> {
        let content = file.content()?;
        let statements = split_statements(&content, &self.profile.lexicon)
            .map_err(|e| Error::invalid_migration(file.identifier(), e.to_string()))?;
        Ok(PreparedMigration {
            identifier: file.identifier().to_string(),
            checksum: checksum_of(&content),
            statements,
            transactional: self.profile.transactional_ddl && !wants_no_transaction(&content),
        })
    }

    pub fn execute(&self, conn: &mut dyn Connection, file: &MigrationFile) -> Result<ExecutionReport> {
        self.execute_with(conn, file, None, |_, _| Ok(()))
    }

    /// Execute `file`, then call `on_complete` before the work is committed.
    /// The hook sees the prepared migration, so its checksum is that of the
    /// text that actually ran.
    ///
    /// On transactional engines the statements and `on_complete` share one
    /// transaction, and any failure rolls all of it back. Otherwise every
    /// statement commits on its own; a failure after the first statement
    /// is a `PartialMigration`. The deadline is checked before each
    /// statement.
    pub fn execute_with<F>(
        &self,
        conn: &mut dyn Connection,
        file: &MigrationFile,
        deadline: Option<Instant>,
        on_complete: F,
    ) -> Result<ExecutionReport>
    where
        F: FnOnce(&mut dyn Connection, &PreparedMigration) -> Result<()>,
    {
        let prepared = self.prepare(file)?;
        if deadline_passed(deadline) {
            return Err(Error::Cancelled {
                identifier: Some(prepared.identifier),
            });
        }

        if prepared.transactional {
            self.run_in_transaction(conn, &prepared, deadline, on_complete)?;
        } else {
            self.run_autocommit(conn, &prepared, deadline)?;
            on_complete(conn, &prepared)?;
        }

        Ok(ExecutionReport {
            identifier: prepared.identifier,
            statements: prepared.statements.len(),
            transactional: prepared.transactional,
        })
    }

    fn run_in_transaction<F>(
        &self,
        conn: &mut dyn Connection,
        prepared: &PreparedMigration,
        deadline: Option<Instant>,
        on_complete: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut dyn Connection, &PreparedMigration) -> Result<()>,
    {
        let failure = |statement_index: usize, line: usize, source: DriverError| {
            Error::MigrationExecution {
                identifier: prepared.identifier.clone(),
                statement_index,
                line,
                source,
            }
        };

        conn.execute_batch(&self.profile.begin_sql).map_err(|e| {
            failure(
                0,
                0,
                DriverError::new(e.kind, format!("could not begin transaction: {}", e.message)),
            )
        })?;

        for statement in &prepared.statements {
            if deadline_passed(deadline) {
                self.rollback(conn);
                return Err(Error::Cancelled {
                    identifier: Some(prepared.identifier.clone()),
                });
            }
            if let Err(e) = conn.execute_batch(&statement.sql) {
                self.rollback(conn);
                return Err(failure(statement.index, statement.line, e));
            }
        }

        if let Err(e) = on_complete(conn, prepared) {
            self.rollback(conn);
            return Err(e);
        }

        conn.execute_batch(&self.profile.commit_sql).map_err(|e| {
            self.rollback(conn);
            failure(
                prepared.statements.len(),
                0,
                DriverError::new(e.kind, format!("could not commit: {}", e.message)),
            )
        })
    }

    fn run_autocommit(
        &self,
        conn: &mut dyn Connection,
        prepared: &PreparedMigration,
        deadline: Option<Instant>,
    ) -> Result<()> {
        for (committed, statement) in prepared.statements.iter().enumerate() {
            if deadline_passed(deadline) {
                if committed == 0 {
                    return Err(Error::Cancelled {
                        identifier: Some(prepared.identifier.clone()),
                    });
                }
                return Err(Error::PartialMigration {
                    identifier: prepared.identifier.clone(),
                    statement_index: statement.index,
                    committed,
                    source: DriverError::timeout("deadline exceeded"),
                });
            }
            if let Err(source) = conn.execute_batch(&statement.sql) {
                if committed == 0 {
                    return Err(Error::MigrationExecution {
                        identifier: prepared.identifier.clone(),
                        statement_index: statement.index,
                        line: statement.line,
                        source,
                    });
                }
                return Err(Error::PartialMigration {
                    identifier: prepared.identifier.clone(),
                    statement_index: statement.index,
                    committed,
                    source,
                });
            }
        }
        Ok(())
    }

    /// Best effort; the original failure is what gets reported
    fn rollback(&self, conn: &mut dyn Connection) {
        let _ = conn.execute_batch(&self.profile.rollback_sql);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::file_lock::IN_MEMORY;
    use crate::adapters::sqlite::{SqliteConnection, SqliteRequests};
    use crate::ports::DialectRequests;
    use std::time::Duration;

    fn setup() -> (SqliteConnection, DialectProfile) {
        (
            SqliteConnection::open(IN_MEMORY).unwrap(),
            SqliteRequests.render("xalanih_history"),
        )
    }

    fn table_exists(conn: &mut SqliteConnection, table: &str) -> bool {
        !conn
            .query(&SqliteRequests.check_table_exists(table), &[table])
            .unwrap()
            .is_empty()
    }

    #[test]
    fn test_executes_every_statement() {
        let (mut conn, profile) = setup();
        let file = MigrationFile::embedded(
            "0001_init.sql",
            "CREATE TABLE users (id INTEGER PRIMARY KEY, note TEXT);\n\
             INSERT INTO users (note) VALUES ('contains a ; semicolon');",
        );

        let report = MigrationExecutor::new(&profile)
            .execute(&mut conn, &file)
            .unwrap();
        assert_eq!(report.statements, 2);
        assert!(report.transactional);

        let rows = conn.query("SELECT note FROM users", &[]).unwrap();
        assert_eq!(rows, vec![vec![Some("contains a ; semicolon".to_string())]]);
    }

    #[test]
    fn test_failure_rolls_back_whole_file() {
        let (mut conn, profile) = setup();
        let file = MigrationFile::embedded(
            "0002_broken.sql",
            "CREATE TABLE a (id INTEGER);\nCREATE TABLE b (id INTEGER);\nNOT VALID SQL;",
        );

        let err = MigrationExecutor::new(&profile)
            .execute(&mut conn, &file)
            .unwrap_err();
        match err {
            Error::MigrationExecution {
                identifier,
                statement_index,
                line,
                ..
            } => {
                assert_eq!(identifier, "0002_broken");
                assert_eq!(statement_index, 2);
                assert_eq!(line, 3);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(!table_exists(&mut conn, "a"));
        assert!(!table_exists(&mut conn, "b"));
    }

    #[test]
    fn test_completion_hook_failure_rolls_back() {
        let (mut conn, profile) = setup();
        let file = MigrationFile::embedded("0001_a.sql", "CREATE TABLE a (id INTEGER);");

        let err = MigrationExecutor::new(&profile)
            .execute_with(&mut conn, &file, None, |_, _| {
                Err(Error::LedgerWrite {
                    identifier: "0001_a".into(),
                    source: DriverError::unique_violation("duplicate"),
                })
            })
            .unwrap_err();
        assert!(matches!(err, Error::LedgerWrite { .. }));
        assert!(!table_exists(&mut conn, "a"));
    }

    #[test]
    fn test_hook_checksum_matches_executed_text() {
        let (mut conn, profile) = setup();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0001_a.sql");
        let original = "CREATE TABLE a (id INTEGER);";
        std::fs::write(&path, original).unwrap();
        let file = MigrationFile::from_path(&path).unwrap();

        let mut seen = None;
        MigrationExecutor::new(&profile)
            .execute_with(&mut conn, &file, None, |_, prepared| {
                // edited on disk after it was read
                std::fs::write(&path, "CREATE TABLE b (id INTEGER);").unwrap();
                seen = Some(prepared.checksum.clone());
                Ok(())
            })
            .unwrap();

        assert_eq!(seen.as_deref(), Some(checksum_of(original).as_str()));
        assert_ne!(seen, Some(file.checksum().unwrap()));
        assert!(table_exists(&mut conn, "a"));
    }

    #[test]
    fn test_no_transaction_partial_failure() {
        let (mut conn, profile) = setup();
        let file = MigrationFile::embedded(
            "0003_partial.sql",
            "-- xalanih:no-transaction\nCREATE TABLE a (id INTEGER);\nCREATE TABLE a (id INTEGER);",
        );

        let err = MigrationExecutor::new(&profile)
            .execute(&mut conn, &file)
            .unwrap_err();
        match err {
            Error::PartialMigration {
                statement_index,
                committed,
                ..
            } => {
                assert_eq!(statement_index, 1);
                assert_eq!(committed, 1);
            }
            other => panic!("unexpected error: {}", other),
        }
        // the first statement autocommitted
        assert!(table_exists(&mut conn, "a"));
    }

    #[test]
    fn test_no_transaction_first_statement_failure_is_plain() {
        let (mut conn, profile) = setup();
        let file = MigrationFile::embedded(
            "0003_bad.sql",
            "-- xalanih:no-transaction\nNOT VALID SQL;",
        );
        let err = MigrationExecutor::new(&profile)
            .execute(&mut conn, &file)
            .unwrap_err();
        assert!(matches!(err, Error::MigrationExecution { .. }));
    }

    #[test]
    fn test_unterminated_literal_runs_nothing() {
        let (mut conn, profile) = setup();
        let file = MigrationFile::embedded(
            "0004_bad.sql",
            "CREATE TABLE a (id INTEGER);\nINSERT INTO a VALUES ('oops);",
        );
        let err = MigrationExecutor::new(&profile)
            .execute(&mut conn, &file)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidMigration { .. }));
        assert!(!table_exists(&mut conn, "a"));
    }

    #[test]
    fn test_passed_deadline_cancels_before_work() {
        let (mut conn, profile) = setup();
        let file = MigrationFile::embedded("0001_a.sql", "CREATE TABLE a (id INTEGER);");
        let deadline = Instant::now() - Duration::from_millis(1);

        let err = MigrationExecutor::new(&profile)
            .execute_with(&mut conn, &file, Some(deadline), |_, _| Ok(()))
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled { identifier: Some(ref id) } if id == "0001_a"));
        assert!(!table_exists(&mut conn, "a"));
    }

    #[test]
    fn test_non_transactional_profile_autocommits() {
        let (mut conn, mut profile) = setup();
        profile.transactional_ddl = false;
        let file = MigrationFile::embedded(
            "0001_a.sql",
            "CREATE TABLE a (id INTEGER);\nCREATE TABLE a (id INTEGER);",
        );
        let err = MigrationExecutor::new(&profile)
            .execute(&mut conn, &file)
            .unwrap_err();
        assert!(matches!(err, Error::PartialMigration { .. }));
    }
}
