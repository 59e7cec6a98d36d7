//! Xalanih Core - schema version control for SQL databases
//!
//! Applies ordered SQL migration files to a target database exactly once,
//! recording each application in a tracking table inside that database.
//! The crate follows hexagonal architecture:
//!
//! - **domain**: Migration files, ledger records, run options and errors
//! - **ports**: Trait definitions for external dependencies (Connection, Driver, DialectRequests, EventSink)
//! - **services**: Factory, ledger, executor, runner and logging
//! - **adapters**: Concrete engines (DuckDB, SQLite, PostgreSQL, MySQL)

pub mod adapters;
pub mod config;
pub mod domain;
pub mod log_migrations;
pub mod ports;
pub mod services;
pub mod splitter;

use std::path::PathBuf;

use config::Config;
use services::*;

// Re-export commonly used types at crate root
pub use domain::result::{DriverError, Error, OperationResult, Result};
pub use domain::{
    AppliedRecord, MigrationFile, MigrationStatus, RunOptions, RunState, RunSummary, StatusKind,
};
pub use ports::{ConnectionParams, EventSink, MemorySink, NullSink};

/// Main context for Xalanih operations
///
/// Binds a configuration to a connection factory with every built-in
/// engine registered. This is the entry point the CLI works through.
pub struct XalanihContext {
    pub config: Config,
    pub factory: ConnectionFactory,
}

impl XalanihContext {
    /// Create a new context; fails when the configured table name is invalid
    pub fn new(config: Config) -> Result<Self> {
        let factory = ConnectionFactory::builtin().with_table(&config.table)?;
        Ok(Self { config, factory })
    }

    /// Migration files of the configured directory, in apply order
    pub fn migrations(&self) -> Result<Vec<MigrationFile>> {
        domain::discover_migrations(&self.config.migrations_dir)
    }

    /// Apply pending migrations
    pub fn apply(&self, options: RunOptions, sink: &dyn EventSink) -> Result<RunSummary> {
        let engine = self.config.engine()?;
        let files = self.migrations()?;
        MigrationRunner::new(&self.factory).with_options(options).run(
            engine,
            &self.config.connection_params(),
            &files,
            sink,
        )
    }

    pub fn status(&self) -> Result<Vec<MigrationStatus>> {
        let engine = self.config.engine()?;
        let files = self.migrations()?;
        MigrationRunner::new(&self.factory).status(
            engine,
            &self.config.connection_params(),
            &files,
        )
    }

    /// Syntax issues across all migrations; needs no connection
    pub fn validate(&self) -> Result<Vec<ValidationIssue>> {
        let driver = self.factory.resolve(self.config.engine()?)?;
        ValidationService::new(driver.requests()).validate(&self.migrations()?)
    }

    /// Create the next migration file with a header comment and return its
    /// path. The migrations directory is created when missing.
    pub fn new_migration(&self, description: &str) -> Result<PathBuf> {
        let dir = &self.config.migrations_dir;
        let existing = if dir.exists() {
            self.migrations()?
        } else {
            std::fs::create_dir_all(dir)?;
            Vec::new()
        };

        let name = domain::next_migration_name(&existing, description)?;
        let path = dir.join(&name);
        if path.exists() {
            return Err(Error::config(format!("{} already exists", path.display())));
        }
        std::fs::write(&path, format!("-- {}\n\n", description.trim()))?;
        Ok(path)
    }
}
