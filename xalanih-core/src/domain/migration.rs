//! Migration files - discovery, ordering and content access

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::domain::result::{Error, Result};

/// File extension of migration files (matched case-insensitively)
pub const MIGRATION_EXTENSION: &str = "sql";

/// Width of the sequence prefix when a directory has no migrations yet
const DEFAULT_SEQUENCE_WIDTH: usize = 4;

fn no_transaction_directive() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?mi)^\s*--\s*xalanih:no-transaction\s*$").expect("valid directive regex")
    })
}

fn slug_separator() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-z0-9]+").expect("valid slug regex"))
}

/// Where a migration's SQL comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationSource {
    File(PathBuf),
    /// SQL compiled into the binary with `include_str!`
    Embedded(&'static str),
}

/// One ordered, uniquely named unit of forward schema change
///
/// The content is only read when [`MigrationFile::content`] is called.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFile {
    identifier: String,
    source: MigrationSource,
}

impl MigrationFile {
    /// Build a migration from a file path; the identifier is the file name
    /// without its extension.
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let identifier = path
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                Error::Discovery(format!("invalid migration file name: {}", path.display()))
            })?
            .to_string();
        Ok(Self {
            identifier,
            source: MigrationSource::File(path),
        })
    }

    /// Build a migration from embedded SQL. `name` may carry the `.sql`
    /// extension, as in `("0001_init.sql", include_str!("0001_init.sql"))`.
    pub fn embedded(name: &str, sql: &'static str) -> Self {
        let identifier = strip_extension(name).to_string();
        Self {
            identifier,
            source: MigrationSource::Embedded(sql),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn source(&self) -> &MigrationSource {
        &self.source
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.source {
            MigrationSource::File(path) => Some(path),
            MigrationSource::Embedded(_) => None,
        }
    }

    /// Read the SQL text of the migration
    pub fn content(&self) -> Result<Cow<'static, str>> {
        match &self.source {
            MigrationSource::Embedded(sql) => Ok(Cow::Borrowed(sql)),
            MigrationSource::File(path) => std::fs::read_to_string(path)
                .map(Cow::Owned)
                .map_err(|e| {
                    Error::invalid_migration(
                        &self.identifier,
                        format!("cannot read {}: {}", path.display(), e),
                    )
                }),
        }
    }

    /// SHA-256 of the content, hex encoded
    pub fn checksum(&self) -> Result<String> {
        Ok(checksum_of(&self.content()?))
    }
}

/// SHA-256 of migration text, hex encoded
pub fn checksum_of(sql: &str) -> String {
    hex::encode(Sha256::digest(sql.as_bytes()))
}

/// True when the file opts out of the per-file transaction with a
/// `-- xalanih:no-transaction` line.
pub fn wants_no_transaction(sql: &str) -> bool {
    no_transaction_directive().is_match(sql)
}

fn strip_extension(name: &str) -> &str {
    match name.rsplit_once('.') {
        Some((stem, ext)) if ext.eq_ignore_ascii_case(MIGRATION_EXTENSION) && !stem.is_empty() => {
            stem
        }
        _ => name,
    }
}

/// Sort migrations into apply order.
///
/// Identifiers compare byte-wise. Discovery and the runner both use this
/// function so the order is the same everywhere.
pub fn order_migrations(files: &mut [MigrationFile]) {
    files.sort_by(|a, b| a.identifier.as_bytes().cmp(b.identifier.as_bytes()));
}

/// Fail on the first repeated identifier. `files` must already be ordered.
pub fn ensure_unique(files: &[MigrationFile]) -> Result<()> {
    for pair in files.windows(2) {
        if pair[0].identifier == pair[1].identifier {
            return Err(Error::DuplicateMigration(pair[0].identifier.clone()));
        }
    }
    Ok(())
}

/// List the `.sql` files of `dir` in apply order
pub fn discover_migrations(dir: &Path) -> Result<Vec<MigrationFile>> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        Error::Discovery(format!(
            "cannot read migrations directory {}: {}",
            dir.display(),
            e
        ))
    })?;

    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let is_hidden = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with('.'))
            .unwrap_or(true);
        let is_sql = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case(MIGRATION_EXTENSION))
            .unwrap_or(false);
        if is_sql && !is_hidden {
            files.push(MigrationFile::from_path(path)?);
        }
    }

    order_migrations(&mut files);
    ensure_unique(&files)?;
    Ok(files)
}

/// File name for the next migration: sequence number one past the highest
/// existing prefix, zero padded to the width already in use.
pub fn next_migration_name(existing: &[MigrationFile], description: &str) -> Result<String> {
    let slug = slug_separator()
        .replace_all(&description.to_lowercase(), "_")
        .trim_matches('_')
        .to_string();
    if slug.is_empty() {
        return Err(Error::config(
            "migration description must contain letters or digits",
        ));
    }

    let mut highest: u64 = 0;
    let mut width = DEFAULT_SEQUENCE_WIDTH;
    for file in existing {
        let digits: String = file
            .identifier()
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        if let Ok(n) = digits.parse::<u64>() {
            highest = highest.max(n);
            width = digits.len();
        }
    }

    Ok(format!(
        "{:0width$}_{}.{}",
        highest + 1,
        slug,
        MIGRATION_EXTENSION,
        width = width
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_identifier_is_file_stem() {
        let file = MigrationFile::from_path("/tmp/migrations/0001_create_users.sql").unwrap();
        assert_eq!(file.identifier(), "0001_create_users");
        assert!(file.path().is_some());

        let embedded = MigrationFile::embedded("0001_sys_logs.sql", "SELECT 1");
        assert_eq!(embedded.identifier(), "0001_sys_logs");
        assert_eq!(embedded.content().unwrap(), "SELECT 1");
    }

    #[test]
    fn test_discovery_orders_and_filters() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("0002_b.sql"), "SELECT 2;").unwrap();
        std::fs::write(dir.path().join("0010_c.SQL"), "SELECT 3;").unwrap();
        std::fs::write(dir.path().join("0001_a.sql"), "SELECT 1;").unwrap();
        std::fs::write(dir.path().join("README.md"), "docs").unwrap();
        std::fs::write(dir.path().join(".0000_hidden.sql"), "SELECT 0;").unwrap();
        std::fs::create_dir(dir.path().join("0003_dir.sql")).unwrap();

        let files = discover_migrations(dir.path()).unwrap();
        let ids: Vec<&str> = files.iter().map(|f| f.identifier()).collect();
        assert_eq!(ids, vec!["0001_a", "0002_b", "0010_c"]);
    }

    #[test]
    fn test_discovery_rejects_duplicate_identifiers() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("0001_a.sql"), "SELECT 1;").unwrap();
        std::fs::write(dir.path().join("0001_a.SQL"), "SELECT 1;").unwrap();

        match discover_migrations(dir.path()) {
            Err(Error::DuplicateMigration(id)) => assert_eq!(id, "0001_a"),
            // case-insensitive filesystems keep only one of the two files
            Ok(files) => assert_eq!(files.len(), 1),
            Err(other) => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_discovery_missing_directory() {
        let dir = tempdir().unwrap();
        let err = discover_migrations(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, Error::Discovery(_)));
    }

    #[test]
    fn test_content_is_read_lazily() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0001_a.sql");
        std::fs::write(&path, "SELECT 1;").unwrap();
        let file = MigrationFile::from_path(&path).unwrap();

        std::fs::write(&path, "SELECT 2;").unwrap();
        assert_eq!(file.content().unwrap(), "SELECT 2;");

        std::fs::remove_file(&path).unwrap();
        assert!(matches!(
            file.content(),
            Err(Error::InvalidMigration { .. })
        ));
    }

    #[test]
    fn test_checksum_tracks_content() {
        let a = checksum_of("CREATE TABLE users (id INT);");
        let b = checksum_of("CREATE TABLE users (id INT);");
        let c = checksum_of("CREATE TABLE users (id BIGINT);");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_no_transaction_directive() {
        assert!(wants_no_transaction(
            "-- xalanih:no-transaction\nCREATE INDEX CONCURRENTLY i ON t (c);"
        ));
        assert!(wants_no_transaction("  --XALANIH:NO-TRANSACTION  \nSELECT 1;"));
        assert!(!wants_no_transaction("SELECT '-- xalanih:no-transaction';"));
    }

    #[test]
    fn test_next_migration_name() {
        assert_eq!(
            next_migration_name(&[], "Create users").unwrap(),
            "0001_create_users.sql"
        );

        let existing = vec![
            MigrationFile::embedded("001_init.sql", ""),
            MigrationFile::embedded("007_add-email.sql", ""),
        ];
        assert_eq!(
            next_migration_name(&existing, "  Add  index!! ").unwrap(),
            "008_add_index.sql"
        );
        assert!(next_migration_name(&existing, "!!!").is_err());
    }

    #[test]
    fn test_order_uses_byte_order() {
        let mut files = vec![
            MigrationFile::embedded("0002_b", ""),
            MigrationFile::embedded("0001_z", ""),
            MigrationFile::embedded("0001_a", ""),
        ];
        order_migrations(&mut files);
        let ids: Vec<&str> = files.iter().map(|f| f.identifier()).collect();
        assert_eq!(ids, vec!["0001_a", "0001_z", "0002_b"]);
        assert!(ensure_unique(&files).is_ok());

        files.push(MigrationFile::embedded("0002_b.sql", ""));
        order_migrations(&mut files);
        assert!(matches!(
            ensure_unique(&files),
            Err(Error::DuplicateMigration(_))
        ));
    }
}
