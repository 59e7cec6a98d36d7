//! Log database migrations - embedded SQL files
//!
//! Migrations are compiled into the binary at build time using include_str!
//! and applied with the same runner that serves user migrations.

use crate::domain::MigrationFile;

/// All log migrations, embedded at compile time.
/// Format: (filename, sql_content)
///
/// When adding a migration, create `NNNN_description.sql` next to this file
/// and add an entry here.
pub const LOG_MIGRATIONS: &[(&str, &str)] = &[(
    "0001_create_sys_logs.sql",
    include_str!("0001_create_sys_logs.sql"),
)];

/// The log migrations as runnable migration files
pub fn log_migrations() -> Vec<MigrationFile> {
    LOG_MIGRATIONS
        .iter()
        .map(|&(name, sql)| MigrationFile::embedded(name, sql))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_migrations_are_ordered_and_named() {
        let files = log_migrations();
        let mut sorted = files.clone();
        crate::domain::order_migrations(&mut sorted);
        assert_eq!(files, sorted);
        assert_eq!(files[0].identifier(), "0001_create_sys_logs");
    }
}
