//! Core domain types
//!
//! Plain data structures with validation logic. No database access lives
//! here; reading migration files from disk is the only I/O.

pub mod dialect;
pub mod migration;
pub mod record;
pub mod result;
pub mod run;

pub use dialect::DialectProfile;
pub use migration::{
    discover_migrations, next_migration_name, order_migrations, MigrationFile, MigrationSource,
};
pub use record::AppliedRecord;
pub use run::{MigrationStatus, RunOptions, RunState, RunSummary, StatusKind};
