//! Advisory locks for embedded engines, backed by lock files next to the
//! database file

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;

use fs2::FileExt;

use crate::domain::result::DriverError;
use crate::ports::DriverResult;

/// Path used by embedded engines for a private in-memory database
pub const IN_MEMORY: &str = ":memory:";

/// Lock files held by one connection
///
/// In-memory databases cannot be shared between connections, so locking
/// always succeeds for them.
#[derive(Debug)]
pub struct FileLocks {
    database: Option<PathBuf>,
    held: HashMap<String, File>,
}

impl FileLocks {
    pub fn for_database(path: &str) -> Self {
        let database = if path == IN_MEMORY || path.is_empty() {
            None
        } else {
            Some(PathBuf::from(path))
        };
        Self {
            database,
            held: HashMap::new(),
        }
    }

    /// Lock file for `name`: `<database>.<name>.lock`
    pub fn lock_path(&self, name: &str) -> Option<PathBuf> {
        let database = self.database.as_ref()?;
        let safe: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
            .collect();
        let mut file_name = database.file_name()?.to_os_string();
        file_name.push(format!(".{}.lock", safe));
        Some(database.with_file_name(file_name))
    }

    pub fn try_lock(&mut self, name: &str) -> DriverResult<bool> {
        if self.held.contains_key(name) {
            return Ok(true);
        }
        let Some(path) = self.lock_path(name) else {
            return Ok(true);
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| {
                DriverError::other(format!("cannot open lock file {}: {}", path.display(), e))
            })?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                self.held.insert(name.to_string(), file);
                Ok(true)
            }
            Err(e) if is_contended(&e) => Ok(false),
            Err(e) => Err(DriverError::other(format!(
                "cannot lock {}: {}",
                path.display(),
                e
            ))),
        }
    }

    pub fn unlock(&mut self, name: &str) -> DriverResult<()> {
        if let Some(file) = self.held.remove(name) {
            FileExt::unlock(&file)
                .map_err(|e| DriverError::other(format!("cannot release lock {}: {}", name, e)))?;
        }
        Ok(())
    }

    pub fn release_all(&mut self) {
        for (_, file) in self.held.drain() {
            let _ = FileExt::unlock(&file);
        }
    }
}

impl Drop for FileLocks {
    fn drop(&mut self) {
        self.release_all();
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_in_memory_always_locks() {
        let mut locks = FileLocks::for_database(IN_MEMORY);
        assert!(locks.lock_path("xalanih_history").is_none());
        assert!(locks.try_lock("xalanih_history").unwrap());
        locks.unlock("xalanih_history").unwrap();
    }

    #[test]
    fn test_second_holder_is_refused_until_release() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("app.db");
        let db = db.to_str().unwrap();

        let mut first = FileLocks::for_database(db);
        let mut second = FileLocks::for_database(db);

        assert!(first.try_lock("xalanih_history").unwrap());
        assert!(!second.try_lock("xalanih_history").unwrap());
        // other names are independent
        assert!(second.try_lock("other").unwrap());

        first.unlock("xalanih_history").unwrap();
        assert!(second.try_lock("xalanih_history").unwrap());
    }

    #[test]
    fn test_lock_path_sits_next_to_database() {
        let locks = FileLocks::for_database("/data/app.duckdb");
        assert_eq!(
            locks.lock_path("my table"),
            Some(PathBuf::from("/data/app.duckdb.my_table.lock"))
        );
    }
}
