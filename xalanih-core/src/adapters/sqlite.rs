//! SQLite driver

use std::time::Duration;

use rusqlite::types::ValueRef;
use sqlparser::dialect::{Dialect, SQLiteDialect};

use crate::adapters::file_lock::{FileLocks, IN_MEMORY};
use crate::domain::result::DriverError;
use crate::ports::{Connection, ConnectionParams, DialectRequests, Driver, DriverResult, Row};
use crate::splitter::Lexicon;

/// How long SQLite waits on a locked database file before failing a statement
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn driver_error(err: rusqlite::Error) -> DriverError {
    if let rusqlite::Error::SqliteFailure(failure, _) = &err {
        if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
            || failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
        {
            return DriverError::unique_violation(err.to_string());
        }
    }
    DriverError::other(err.to_string())
}

/// Tracking-table SQL for SQLite
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteRequests;

impl DialectRequests for SqliteRequests {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn check_table_exists(&self, _table: &str) -> String {
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?".to_string()
    }

    fn create_table(&self, table: &str) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             identifier TEXT PRIMARY KEY NOT NULL, \
             applied_at TEXT NOT NULL, \
             checksum TEXT)",
            table
        )
    }

    fn insert_record(&self, table: &str) -> String {
        format!(
            "INSERT INTO {} (identifier, applied_at, checksum) VALUES (?, ?, ?)",
            table
        )
    }

    fn select_applied(&self, table: &str) -> String {
        format!(
            "SELECT identifier, applied_at, checksum FROM {} ORDER BY identifier",
            table
        )
    }

    fn lexicon(&self) -> Lexicon {
        Lexicon::SQLITE
    }

    fn parser_dialect(&self) -> Box<dyn Dialect> {
        Box::new(SQLiteDialect {})
    }
}

/// Opens SQLite database files (or `:memory:`)
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteDriver;

impl Driver for SqliteDriver {
    fn requests(&self) -> &dyn DialectRequests {
        &SqliteRequests
    }

    fn connect(&self, params: &ConnectionParams) -> DriverResult<Box<dyn Connection>> {
        let path = params.embedded_path().ok_or_else(|| {
            DriverError::connection("sqlite needs a database path or :memory:")
        })?;
        Ok(Box::new(SqliteConnection::open(path)?))
    }
}

pub struct SqliteConnection {
    conn: rusqlite::Connection,
    locks: FileLocks,
}

impl SqliteConnection {
    pub fn open(path: &str) -> DriverResult<Self> {
        let conn = if path == IN_MEMORY {
            rusqlite::Connection::open_in_memory()
        } else {
            rusqlite::Connection::open(path)
        }
        .map_err(|e| DriverError::connection(format!("failed to open {}: {}", path, e)))?;

        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| DriverError::connection(format!("failed to set busy timeout: {}", e)))?;

        Ok(Self {
            conn,
            locks: FileLocks::for_database(path),
        })
    }
}

fn value_to_text(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Some(format!("<blob {} bytes>", bytes.len())),
    }
}

impl Connection for SqliteConnection {
    fn execute_batch(&mut self, sql: &str) -> DriverResult<()> {
        self.conn.execute_batch(sql).map_err(driver_error)
    }

    fn execute(&mut self, sql: &str, params: &[&str]) -> DriverResult<u64> {
        self.conn
            .execute(sql, rusqlite::params_from_iter(params.iter()))
            .map(|n| n as u64)
            .map_err(driver_error)
    }

    fn query(&mut self, sql: &str, params: &[&str]) -> DriverResult<Vec<Row>> {
        let mut stmt = self.conn.prepare(sql).map_err(driver_error)?;
        let column_count = stmt.column_count();
        let mut rows = stmt
            .query(rusqlite::params_from_iter(params.iter()))
            .map_err(driver_error)?;

        let mut result = Vec::new();
        while let Some(row) = rows.next().map_err(driver_error)? {
            let mut values = Vec::with_capacity(column_count);
            for i in 0..column_count {
                values.push(value_to_text(row.get_ref(i).map_err(driver_error)?));
            }
            result.push(values);
        }
        Ok(result)
    }

    fn try_lock(&mut self, name: &str) -> DriverResult<bool> {
        self.locks.try_lock(name)
    }

    fn unlock(&mut self, name: &str) -> DriverResult<()> {
        self.locks.unlock(name)
    }

    fn close(self: Box<Self>) -> DriverResult<()> {
        let SqliteConnection { conn, mut locks } = *self;
        locks.release_all();
        conn.close().map_err(|(_, e)| driver_error(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory() -> SqliteConnection {
        SqliteConnection::open(IN_MEMORY).unwrap()
    }

    #[test]
    fn test_profile_rendering() {
        let profile = SqliteRequests.render("history");
        assert_eq!(profile.engine, "sqlite");
        assert_eq!(
            profile.insert_record_sql,
            "INSERT INTO history (identifier, applied_at, checksum) VALUES (?, ?, ?)"
        );
        assert_eq!(profile.begin_sql, "BEGIN");
        assert_eq!(profile.lexicon, Lexicon::SQLITE);
    }

    #[test]
    fn test_query_reads_text_columns() {
        let mut conn = memory();
        conn.execute_batch("CREATE TABLE t (id INTEGER, name TEXT)")
            .unwrap();
        conn.execute("INSERT INTO t VALUES (1, ?)", &["alpha"]).unwrap();
        conn.execute_batch("INSERT INTO t VALUES (2, NULL)").unwrap();

        let rows = conn.query("SELECT id, name FROM t ORDER BY id", &[]).unwrap();
        assert_eq!(
            rows,
            vec![
                vec![Some("1".to_string()), Some("alpha".to_string())],
                vec![Some("2".to_string()), None],
            ]
        );
    }

    #[test]
    fn test_unique_violation_is_classified() {
        let mut conn = memory();
        conn.execute_batch("CREATE TABLE t (id TEXT PRIMARY KEY)").unwrap();
        conn.execute("INSERT INTO t VALUES (?)", &["a"]).unwrap();
        let err = conn.execute("INSERT INTO t VALUES (?)", &["a"]).unwrap_err();
        assert!(err.is_unique_violation(), "{}", err);

        let err = conn.execute_batch("CREATE TABLE t (id TEXT)").unwrap_err();
        assert!(!err.is_unique_violation());
    }

    #[test]
    fn test_ddl_rolls_back() {
        let mut conn = memory();
        conn.execute_batch("BEGIN").unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER)").unwrap();
        conn.execute_batch("ROLLBACK").unwrap();

        let rows = conn
            .query(&SqliteRequests.check_table_exists("t"), &["t"])
            .unwrap();
        assert!(rows.is_empty());
    }
}
