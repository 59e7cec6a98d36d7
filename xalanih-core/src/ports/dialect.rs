//! DialectRequests port - per-engine SQL for the tracking table

use sqlparser::dialect::Dialect;

use crate::domain::DialectProfile;
use crate::splitter::Lexicon;

/// Generates the engine-specific statements the ledger needs.
///
/// The four tracking-table statements read and write every column as text,
/// so adapters only ever bind and fetch strings.
pub trait DialectRequests: Send + Sync {
    /// Canonical engine name
    fn name(&self) -> &'static str;

    /// Query taking the table name as its only parameter; returns at least
    /// one row when the table exists
    fn check_table_exists(&self, table: &str) -> String;

    fn create_table(&self, table: &str) -> String;

    /// Insert taking identifier, applied_at and checksum as text parameters
    fn insert_record(&self, table: &str) -> String;

    /// Select `identifier, applied_at, checksum` as text, ordered by identifier
    fn select_applied(&self, table: &str) -> String;

    fn begin(&self) -> &'static str {
        "BEGIN"
    }

    fn commit(&self) -> &'static str {
        "COMMIT"
    }

    fn rollback(&self) -> &'static str {
        "ROLLBACK"
    }

    /// Whether DDL can be rolled back
    fn transactional_ddl(&self) -> bool {
        true
    }

    fn lexicon(&self) -> Lexicon;

    /// Parser dialect for syntax validation
    fn parser_dialect(&self) -> Box<dyn Dialect>;

    /// Render the profile for `table`
    fn render(&self, table: &str) -> DialectProfile {
        DialectProfile {
            engine: self.name().to_string(),
            table: table.to_string(),
            check_table_exists_sql: self.check_table_exists(table),
            create_table_sql: self.create_table(table),
            insert_record_sql: self.insert_record(table),
            select_applied_sql: self.select_applied(table),
            begin_sql: self.begin().to_string(),
            commit_sql: self.commit().to_string(),
            rollback_sql: self.rollback().to_string(),
            transactional_ddl: self.transactional_ddl(),
            lexicon: self.lexicon(),
        }
    }
}
