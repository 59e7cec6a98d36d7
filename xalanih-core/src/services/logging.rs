//! Logging service - structured run events persisted to DuckDB
//!
//! Events describe what a run did (stages, migration identifiers, counts,
//! failures). Connection strings and credentials are never logged.
//!
//! The log database lives in the xalanih home directory (`XALANIH_HOME`, or
//! `~/.xalanih`) and its schema is itself managed by the migration runner.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};
use duckdb::Connection;
use serde::{Deserialize, Serialize};

use crate::adapters::DuckDbDriver;
use crate::log_migrations::log_migrations;
use crate::ports::{ConnectionParams, EventSink, NullSink};
use crate::services::factory::ConnectionFactory;
use crate::services::runner::MigrationRunner;

/// Environment variable overriding the home directory
pub const HOME_ENV: &str = "XALANIH_HOME";

/// File name of the log database inside the home directory
pub const LOG_DB_FILE: &str = "logs.duckdb";

/// Tracking table of the log database's own schema
const LOG_LEDGER_TABLE: &str = "sys_migrations";

/// Counter for generating unique IDs within the same millisecond
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a unique ID based on timestamp + counter
fn generate_id() -> u64 {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();

    // Lower 48 bits for the timestamp, upper 16 for the counter
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed) & 0xFFFF;
    (timestamp << 16) | counter
}

/// Current unix timestamp in milliseconds
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

fn detect_platform() -> &'static str {
    if cfg!(target_os = "macos") {
        "macos"
    } else if cfg!(target_os = "windows") {
        "windows"
    } else if cfg!(target_os = "linux") {
        "linux"
    } else {
        "unknown"
    }
}

/// Home directory for xalanih's own files
pub fn xalanih_home() -> PathBuf {
    if let Some(dir) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".xalanih")
}

/// One progress event of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl LogEvent {
    /// Create a new log event with just an event name
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            identifier: None,
            stage: None,
            engine: None,
            count: None,
            error_message: None,
        }
    }

    /// Migration the event refers to
    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    /// Run stage the event refers to, when no migration is involved
    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn with_engine(mut self, engine: impl Into<String>) -> Self {
        self.engine = Some(engine.into());
        self
    }

    pub fn with_count(mut self, count: u64) -> Self {
        self.count = Some(count);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.error_message.is_some()
    }

    /// Compact form: `event`, `event=count`, `event:subject` or
    /// `event:subject:error`
    pub fn message(&self) -> String {
        if let Some(count) = self.count {
            return format!("{}={}", self.event, count);
        }
        let subject = self.identifier.as_deref().or(self.stage.as_deref());
        match (subject, self.error_message.as_deref()) {
            (Some(subject), Some(error)) => format!("{}:{}:{}", self.event, subject, error),
            (Some(subject), None) => format!("{}:{}", self.event, subject),
            (None, Some(error)) => format!("{}::{}", self.event, error),
            (None, None) => self.event.clone(),
        }
    }
}

/// A log entry as stored in the database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: u64,
    pub timestamp: i64,
    pub app_version: String,
    pub platform: String,
    pub command: Option<String>,
    pub event: String,
    pub identifier: Option<String>,
    pub stage: Option<String>,
    pub engine: Option<String>,
    pub count: Option<i64>,
    pub error_message: Option<String>,
}

const ENTRY_COLUMNS: &str = "id, timestamp, app_version, platform, command, \
     event, identifier, stage, engine, item_count, error_message";

fn row_to_entry(row: &duckdb::Row) -> duckdb::Result<LogEntry> {
    Ok(LogEntry {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        app_version: row.get(2)?,
        platform: row.get(3)?,
        command: row.get(4)?,
        event: row.get(5)?,
        identifier: row.get(6)?,
        stage: row.get(7)?,
        engine: row.get(8)?,
        count: row.get(9)?,
        error_message: row.get(10)?,
    })
}

/// Persists run events to `logs.duckdb`
///
/// Used as an [`EventSink`]; write failures are dropped so logging never
/// fails a migration run.
pub struct LoggingService {
    conn: Mutex<Connection>,
    db_path: PathBuf,
    app_version: String,
    platform: &'static str,
    command: Option<String>,
}

impl LoggingService {
    /// Open or create `logs.duckdb` in `home` and bring its schema up to date
    pub fn new(home: &Path, app_version: impl Into<String>) -> Result<Self> {
        std::fs::create_dir_all(home)?;
        let db_path = home.join(LOG_DB_FILE);
        Self::run_migrations(&db_path)?;
        let conn = Connection::open(&db_path)?;

        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
            app_version: app_version.into(),
            platform: detect_platform(),
            command: None,
        })
    }

    /// Tag every following entry with the command that produced it
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    fn run_migrations(db_path: &Path) -> Result<()> {
        let mut factory = ConnectionFactory::new().with_table(LOG_LEDGER_TABLE)?;
        factory.register(&["duckdb"], Arc::new(DuckDbDriver));

        let path = db_path
            .to_str()
            .ok_or_else(|| anyhow!("log database path is not valid UTF-8"))?;
        MigrationRunner::new(&factory).run(
            "duckdb",
            &ConnectionParams::from_connection_string(path),
            &log_migrations(),
            &NullSink,
        )?;
        Ok(())
    }

    /// Record an event
    pub fn log(&self, event: &LogEvent) -> Result<()> {
        let conn = self.conn.lock().map_err(|e| anyhow!("Lock poisoned: {}", e))?;

        conn.execute(
            &format!(
                "INSERT INTO sys_logs ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                ENTRY_COLUMNS
            ),
            duckdb::params![
                generate_id(),
                now_ms(),
                &self.app_version,
                self.platform,
                &self.command,
                &event.event,
                &event.identifier,
                &event.stage,
                &event.engine,
                event.count.map(|c| c as i64),
                &event.error_message,
            ],
        )?;

        Ok(())
    }

    /// Most recent entries first
    pub fn get_recent(&self, limit: usize) -> Result<Vec<LogEntry>> {
        self.select("", limit)
    }

    /// Most recent failures first
    pub fn get_errors(&self, limit: usize) -> Result<Vec<LogEntry>> {
        self.select("WHERE error_message IS NOT NULL", limit)
    }

    /// Every event that named `identifier`, most recent first
    pub fn history(&self, identifier: &str, limit: usize) -> Result<Vec<LogEntry>> {
        let conn = self.conn.lock().map_err(|e| anyhow!("Lock poisoned: {}", e))?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sys_logs WHERE identifier = ? \
             ORDER BY timestamp DESC, id DESC LIMIT ?",
            ENTRY_COLUMNS
        ))?;

        let entries = stmt
            .query_map(duckdb::params![identifier, limit as i64], row_to_entry)?
            .filter_map(|r| r.ok())
            .collect();

        Ok(entries)
    }

    fn select(&self, filter: &str, limit: usize) -> Result<Vec<LogEntry>> {
        let conn = self.conn.lock().map_err(|e| anyhow!("Lock poisoned: {}", e))?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sys_logs {} ORDER BY timestamp DESC, id DESC LIMIT ?",
            ENTRY_COLUMNS, filter
        ))?;

        let entries = stmt
            .query_map([limit as i64], row_to_entry)?
            .filter_map(|r| r.ok())
            .collect();

        Ok(entries)
    }

    /// Entry count per event name, largest first
    pub fn event_counts(&self) -> Result<Vec<(String, u64)>> {
        let conn = self.conn.lock().map_err(|e| anyhow!("Lock poisoned: {}", e))?;

        let mut stmt = conn.prepare(
            "SELECT event, COUNT(*) FROM sys_logs GROUP BY event ORDER BY 2 DESC, 1",
        )?;
        let counts = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64)))?
            .collect::<duckdb::Result<Vec<_>>>()?;

        Ok(counts)
    }

    /// Get the total number of log entries
    pub fn count(&self) -> Result<u64> {
        let conn = self.conn.lock().map_err(|e| anyhow!("Lock poisoned: {}", e))?;
        let count: u64 = conn.query_row("SELECT COUNT(*) FROM sys_logs", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Delete logs older than the specified timestamp (unix ms)
    pub fn delete_before(&self, timestamp_ms: i64) -> Result<u64> {
        let conn = self.conn.lock().map_err(|e| anyhow!("Lock poisoned: {}", e))?;
        let deleted = conn.execute("DELETE FROM sys_logs WHERE timestamp < ?", [timestamp_ms])?;
        Ok(deleted as u64)
    }

    /// Copy the log database to `output_path` for troubleshooting
    pub fn export(&self, output_path: &Path) -> Result<PathBuf> {
        let conn = self.conn.lock().map_err(|e| anyhow!("Lock poisoned: {}", e))?;

        // Flush the WAL so the copy is complete
        conn.execute("CHECKPOINT", [])?;
        std::fs::copy(&self.db_path, output_path)?;

        Ok(output_path.to_path_buf())
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }
}

impl EventSink for LoggingService {
    fn emit(&self, event: &LogEvent) {
        let _ = self.log(event);
    }
}
