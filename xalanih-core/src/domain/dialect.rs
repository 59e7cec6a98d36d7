//! Rendered dialect profile for one engine and tracking table

use crate::splitter::Lexicon;

/// Everything the ledger and executor need to talk to one engine.
///
/// Built once by the connection factory from the engine's
/// `DialectRequests`; read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialectProfile {
    /// Canonical engine name (`sqlite`, `postgres`, ...)
    pub engine: String,
    /// Tracking table name
    pub table: String,
    /// One text parameter (table name); returns a row when the table exists
    pub check_table_exists_sql: String,
    pub create_table_sql: String,
    /// Three text parameters: identifier, applied_at, checksum
    pub insert_record_sql: String,
    /// Returns `identifier, applied_at, checksum` as text, ordered by identifier
    pub select_applied_sql: String,
    pub begin_sql: String,
    pub commit_sql: String,
    pub rollback_sql: String,
    /// DDL statements take part in transactions
    pub transactional_ddl: bool,
    pub lexicon: Lexicon,
}
