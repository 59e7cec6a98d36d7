//! Service layer - migration orchestration
//!
//! Services coordinate domain logic and port interactions. Each service
//! focuses on one step of a run.

pub mod executor;
pub mod factory;
pub mod ledger;
pub mod logging;
pub mod runner;
pub mod validate;

pub use executor::{ExecutionReport, MigrationExecutor, PreparedMigration};
pub use factory::{ConnectionFactory, DEFAULT_TABLE};
pub use ledger::MigrationLedger;
pub use logging::{xalanih_home, LogEntry, LogEvent, LoggingService};
pub use runner::MigrationRunner;
pub use validate::{ValidationIssue, ValidationService};
