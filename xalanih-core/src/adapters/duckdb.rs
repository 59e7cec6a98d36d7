//! DuckDB driver

use std::fmt::Display;
use std::path::Path;
use std::thread;
use std::time::Duration;

use duckdb::types::ValueRef;
use sqlparser::dialect::{Dialect, DuckDbDialect};

use crate::adapters::file_lock::{FileLocks, IN_MEMORY};
use crate::domain::result::DriverError;
use crate::ports::{
    Connection, ConnectionParams, DialectRequests, Driver, DriverResult, EventSink, NullSink, Row,
};
use crate::services::logging::LogEvent;
use crate::splitter::Lexicon;

/// Maximum number of retries when the database file is locked
const MAX_RETRIES: u32 = 5;

/// Initial retry delay in milliseconds (doubles each retry: 50, 100, 200, 400, 800ms)
const INITIAL_RETRY_DELAY_MS: u64 = 50;

/// Check if an error message indicates a file locking issue that should be retried
fn is_retryable_error(err_msg: &str) -> bool {
    let lower = err_msg.to_lowercase();
    // Windows error messages
    lower.contains("being used by another process")
        || lower.contains("cannot access the file")
        // Unix/macOS error messages
        || lower.contains("resource temporarily unavailable")
        || lower.contains("database is locked")
        || lower.contains("could not set lock on file")
        || lower.contains("file is already open")
}

fn is_unique_violation(err_msg: &str) -> bool {
    let lower = err_msg.to_lowercase();
    lower.contains("duplicate key")
        || lower.contains("violates primary key")
        || lower.contains("violates unique constraint")
}

fn driver_error(err: duckdb::Error) -> DriverError {
    let message = err.to_string();
    if is_unique_violation(&message) {
        DriverError::unique_violation(message)
    } else {
        DriverError::other(message)
    }
}

/// Tracking-table SQL for DuckDB
#[derive(Debug, Default, Clone, Copy)]
pub struct DuckDbRequests;

impl DialectRequests for DuckDbRequests {
    fn name(&self) -> &'static str {
        "duckdb"
    }

    fn check_table_exists(&self, _table: &str) -> String {
        "SELECT table_name FROM information_schema.tables \
         WHERE table_schema = current_schema() AND table_name = ?"
            .to_string()
    }

    fn create_table(&self, table: &str) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             identifier VARCHAR PRIMARY KEY, \
             applied_at TIMESTAMP NOT NULL, \
             checksum VARCHAR)",
            table
        )
    }

    fn insert_record(&self, table: &str) -> String {
        format!(
            "INSERT INTO {} (identifier, applied_at, checksum) \
             VALUES (?, CAST(? AS TIMESTAMP), ?)",
            table
        )
    }

    fn select_applied(&self, table: &str) -> String {
        format!(
            "SELECT identifier, CAST(applied_at AS VARCHAR), checksum \
             FROM {} ORDER BY identifier",
            table
        )
    }

    fn begin(&self) -> &'static str {
        "BEGIN TRANSACTION"
    }

    fn lexicon(&self) -> Lexicon {
        Lexicon::DUCKDB
    }

    fn parser_dialect(&self) -> Box<dyn Dialect> {
        Box::new(DuckDbDialect {})
    }
}

/// Opens DuckDB database files (or `:memory:`)
#[derive(Debug, Default, Clone, Copy)]
pub struct DuckDbDriver;

impl Driver for DuckDbDriver {
    fn requests(&self) -> &dyn DialectRequests {
        &DuckDbRequests
    }

    fn connect(&self, params: &ConnectionParams) -> DriverResult<Box<dyn Connection>> {
        self.connect_with_events(params, &NullSink)
    }

    fn connect_with_events(
        &self,
        params: &ConnectionParams,
        sink: &dyn EventSink,
    ) -> DriverResult<Box<dyn Connection>> {
        let path = params.embedded_path().ok_or_else(|| {
            DriverError::connection("duckdb needs a database path or :memory:")
        })?;
        Ok(Box::new(DuckDbConnection::open_with_events(path, sink)?))
    }
}

/// Call `open` until it succeeds or fails with a non-lock error, backing
/// off exponentially. Each retry is reported to `sink` as `connect_retry=N`.
fn retry_while_busy<T, E: Display>(
    mut open: impl FnMut() -> Result<T, E>,
    sink: &dyn EventSink,
) -> DriverResult<T> {
    let mut last_error = None;

    for attempt in 0..MAX_RETRIES {
        match open() {
            Ok(value) => return Ok(value),
            Err(e) => {
                let err_msg = e.to_string();
                if is_retryable_error(&err_msg) && attempt < MAX_RETRIES - 1 {
                    sink.emit(
                        &LogEvent::new("connect_retry")
                            .with_engine("duckdb")
                            .with_count(u64::from(attempt) + 1),
                    );
                    thread::sleep(Duration::from_millis(
                        INITIAL_RETRY_DELAY_MS * 2u64.pow(attempt),
                    ));
                    last_error = Some(err_msg);
                    continue;
                }
                return Err(DriverError::connection(err_msg));
            }
        }
    }

    Err(DriverError::connection(last_error.unwrap_or_else(|| {
        format!("failed to open database after {} retries", MAX_RETRIES)
    })))
}

/// One DuckDB session plus the lock files it holds
pub struct DuckDbConnection {
    conn: duckdb::Connection,
    locks: FileLocks,
}

impl DuckDbConnection {
    /// Open a database file, retrying with exponential backoff while another
    /// process holds it.
    pub fn open(path: &str) -> DriverResult<Self> {
        Self::open_with_events(path, &NullSink)
    }

    pub fn open_with_events(path: &str, sink: &dyn EventSink) -> DriverResult<Self> {
        let conn = retry_while_busy(|| Self::try_open_connection(path), sink)?;
        Ok(Self {
            conn,
            locks: FileLocks::for_database(path),
        })
    }

    fn try_open_connection(path: &str) -> duckdb::Result<duckdb::Connection> {
        // Extension autoloading stays off; cached extensions in ~/.duckdb may
        // not match the bundled engine
        let config = duckdb::Config::default().enable_autoload_extension(false)?;
        if path == IN_MEMORY {
            duckdb::Connection::open_in_memory_with_flags(config)
        } else {
            duckdb::Connection::open_with_flags(Path::new(path), config)
        }
    }
}

fn value_to_text(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Boolean(b) => Some(b.to_string()),
        ValueRef::TinyInt(i) => Some(i.to_string()),
        ValueRef::SmallInt(i) => Some(i.to_string()),
        ValueRef::Int(i) => Some(i.to_string()),
        ValueRef::BigInt(i) => Some(i.to_string()),
        ValueRef::HugeInt(i) => Some(i.to_string()),
        ValueRef::UTinyInt(i) => Some(i.to_string()),
        ValueRef::USmallInt(i) => Some(i.to_string()),
        ValueRef::UInt(i) => Some(i.to_string()),
        ValueRef::UBigInt(i) => Some(i.to_string()),
        ValueRef::Float(f) => Some(f.to_string()),
        ValueRef::Double(f) => Some(f.to_string()),
        ValueRef::Decimal(d) => Some(d.to_string()),
        ValueRef::Text(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Timestamp(_, micros) => chrono::DateTime::from_timestamp_micros(micros)
            .map(|dt| dt.naive_utc().to_string()),
        ValueRef::Blob(bytes) => Some(format!("<blob {} bytes>", bytes.len())),
        _ => Some(String::new()),
    }
}

impl Connection for DuckDbConnection {
    fn execute_batch(&mut self, sql: &str) -> DriverResult<()> {
        self.conn.execute_batch(sql).map_err(driver_error)
    }

    fn execute(&mut self, sql: &str, params: &[&str]) -> DriverResult<u64> {
        self.conn
            .execute(sql, duckdb::params_from_iter(params.iter()))
            .map(|n| n as u64)
            .map_err(driver_error)
    }

    fn query(&mut self, sql: &str, params: &[&str]) -> DriverResult<Vec<Row>> {
        let mut stmt = self.conn.prepare(sql).map_err(driver_error)?;
        let mut rows = stmt
            .query(duckdb::params_from_iter(params.iter()))
            .map_err(driver_error)?;

        let mut result = Vec::new();
        let mut column_count = 0;
        while let Some(row) = rows.next().map_err(driver_error)? {
            if result.is_empty() {
                column_count = row.as_ref().column_count();
            }
            let mut values = Vec::with_capacity(column_count);
            for i in 0..column_count {
                values.push(row.get_ref(i).ok().and_then(value_to_text));
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
        let DuckDbConnection { conn, mut locks } = *self;
        locks.release_all();
        conn.close().map_err(|(_, e)| driver_error(e))
    }
}
