//! Migration runner - orchestrates one run against one database
//!
//! The run is a small state machine:
//! `Idle -> Connecting -> Locking -> EnsuringLedger -> Diffing -> Applying(i) -> Done`,
//! with `Failed` reachable from every non-terminal state. Migrations apply
//! strictly in identifier order and the run stops at the first failure, so
//! the ledger always holds a prefix-consistent history.

use std::collections::BTreeMap;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::domain::migration::{ensure_unique, order_migrations};
use crate::domain::result::{Error, Result};
use crate::domain::{
    AppliedRecord, DialectProfile, MigrationFile, MigrationStatus, RunOptions, RunState,
    RunSummary, StatusKind,
};
use crate::ports::{Connection, ConnectionParams, EventSink};
use crate::services::executor::MigrationExecutor;
use crate::services::factory::ConnectionFactory;
use crate::services::ledger::MigrationLedger;
use crate::services::logging::LogEvent;

/// First wait between lock attempts (doubles each retry)
const INITIAL_LOCK_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Longest wait between lock attempts
const MAX_LOCK_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Files sorted into apply order, rejecting duplicate identifiers
fn ordered(files: &[MigrationFile]) -> Result<Vec<MigrationFile>> {
    let mut files = files.to_vec();
    order_migrations(&mut files);
    ensure_unique(&files)?;
    Ok(files)
}

/// Outcome of comparing the files with the ledger
struct Plan {
    pending: Vec<MigrationFile>,
    skipped: usize,
}

pub struct MigrationRunner<'a> {
    factory: &'a ConnectionFactory,
    options: RunOptions,
    state: RunState,
}

impl<'a> MigrationRunner<'a> {
    pub fn new(factory: &'a ConnectionFactory) -> Self {
        Self {
            factory,
            options: RunOptions::default(),
            state: RunState::Idle,
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Current state; `Done` or `Failed` once a run has finished
    pub fn state(&self) -> RunState {
        self.state
    }

    /// Apply every pending migration of `files` to the database.
    ///
    /// The connection is closed on every exit path, and the advisory lock
    /// taken before touching the ledger is released before closing.
    pub fn run(
        &mut self,
        engine: &str,
        params: &ConnectionParams,
        files: &[MigrationFile],
        sink: &dyn EventSink,
    ) -> Result<RunSummary> {
        let started = Instant::now();
        self.state = RunState::Idle;

        let files = ordered(files).map_err(|e| self.fail(sink, None, e))?;

        self.transition(RunState::Connecting);
        sink.emit(&LogEvent::new("connecting").with_engine(engine));
        let (mut conn, profile) = self
            .factory
            .get_connection_with_events(engine, params, sink)
            .map_err(|e| self.fail(sink, None, e))?;

        let result = self.run_locked(conn.as_mut(), &profile, &files, sink);
        let closed = conn.close();

        let mut summary = result?;
        closed.map_err(|e| self.fail(sink, None, Error::Connection(e)))?;

        summary.duration_ms = started.elapsed().as_millis() as u64;
        self.transition(RunState::Done);
        sink.emit(&LogEvent::new("done").with_count(summary.applied_count as u64));
        Ok(summary)
    }

    fn run_locked(
        &mut self,
        conn: &mut dyn Connection,
        profile: &DialectProfile,
        files: &[MigrationFile],
        sink: &dyn EventSink,
    ) -> Result<RunSummary> {
        self.transition(RunState::Locking);
        sink.emit(&LogEvent::new("locking"));
        self.acquire_lock(conn, &profile.table)
            .map_err(|e| self.fail(sink, None, e))?;

        let result = self.run_migrations(conn, profile, files, sink);
        let released = conn.unlock(&profile.table);

        let summary = result?;
        released.map_err(|e| self.fail(sink, None, Error::Connection(e)))?;
        Ok(summary)
    }

    fn run_migrations(
        &mut self,
        conn: &mut dyn Connection,
        profile: &DialectProfile,
        files: &[MigrationFile],
        sink: &dyn EventSink,
    ) -> Result<RunSummary> {
        let ledger = MigrationLedger::new(profile);

        self.transition(RunState::EnsuringLedger);
        sink.emit(&LogEvent::new("ensuring_ledger"));
        // a dry run only reads; a missing table is an empty ledger
        let has_table = if self.options.dry_run {
            ledger.tracking_table_exists(conn)
        } else {
            ledger.ensure_tracking_table(conn).map(|_| true)
        }
        .map_err(|e| self.fail(sink, None, e))?;

        self.transition(RunState::Diffing);
        let applied = if has_table {
            ledger.list_applied(conn)
        } else {
            Ok(Vec::new())
        };
        let plan = applied
            .and_then(|applied| self.plan(files, &applied, sink))
            .map_err(|e| self.fail(sink, None, e))?;
        sink.emit(&LogEvent::new("pending_count").with_count(plan.pending.len() as u64));

        let mut summary = RunSummary {
            skipped_count: plan.skipped,
            pending: plan
                .pending
                .iter()
                .map(|f| f.identifier().to_string())
                .collect(),
            dry_run: self.options.dry_run,
            ..Default::default()
        };
        if self.options.dry_run {
            return Ok(summary);
        }

        let executor = MigrationExecutor::new(profile);
        for (i, file) in plan.pending.iter().enumerate() {
            self.transition(RunState::Applying(i));
            let identifier = file.identifier();
            sink.emit(&LogEvent::new("applying").with_identifier(identifier));

            let applied =
                executor.execute_with(conn, file, self.options.deadline, |conn, prepared| {
                    ledger.record(conn, identifier, Utc::now(), &prepared.checksum)
                });
            if let Err(e) = applied {
                return Err(self.fail(sink, Some(identifier), e));
            }

            sink.emit(&LogEvent::new("applied").with_identifier(identifier));
            summary.applied.push(identifier.to_string());
            summary.applied_count += 1;
        }

        Ok(summary)
    }

    /// Split `files` into applied and pending, reporting drift and
    /// out-of-order files on the way
    fn plan(
        &self,
        files: &[MigrationFile],
        applied: &[AppliedRecord],
        sink: &dyn EventSink,
    ) -> Result<Plan> {
        let recorded: BTreeMap<&str, &AppliedRecord> = applied
            .iter()
            .map(|r| (r.identifier.as_str(), r))
            .collect();
        let newest_applied = recorded.keys().next_back().copied();

        let mut plan = Plan {
            pending: Vec::new(),
            skipped: 0,
        };
        for file in files {
            let identifier = file.identifier();
            match recorded.get(identifier) {
                Some(record) => {
                    plan.skipped += 1;
                    if self.has_drifted(file, record)? {
                        sink.emit(&LogEvent::new("drift").with_identifier(identifier));
                        if self.options.verify_checksums {
                            return Err(Error::ChecksumMismatch {
                                identifier: identifier.to_string(),
                            });
                        }
                    }
                }
                None => {
                    if newest_applied.map(|newest| identifier < newest).unwrap_or(false) {
                        sink.emit(&LogEvent::new("out_of_order").with_identifier(identifier));
                    }
                    plan.pending.push(file.clone());
                }
            }
        }
        Ok(plan)
    }

    /// An unreadable file only counts as an error when checksums are verified
    fn has_drifted(&self, file: &MigrationFile, record: &AppliedRecord) -> Result<bool> {
        let Some(stored) = record.checksum.as_deref() else {
            return Ok(false);
        };
        match file.checksum() {
            Ok(current) => Ok(current != stored),
            Err(e) if self.options.verify_checksums => Err(e),
            Err(_) => Ok(false),
        }
    }

    /// Take the engine lock, retrying with exponential backoff until the
    /// lock timeout (or the run deadline) passes
    fn acquire_lock(&self, conn: &mut dyn Connection, name: &str) -> Result<()> {
        let started = Instant::now();
        let mut delay = INITIAL_LOCK_RETRY_DELAY;

        loop {
            if conn.try_lock(name).map_err(Error::Connection)? {
                return Ok(());
            }
            if self.options.deadline_passed() {
                return Err(Error::Cancelled { identifier: None });
            }
            let waited = started.elapsed();
            if waited >= self.options.lock_timeout {
                return Err(Error::LockTimeout {
                    waited_ms: waited.as_millis() as u64,
                });
            }
            thread::sleep(delay.min(self.options.lock_timeout - waited));
            delay = (delay * 2).min(MAX_LOCK_RETRY_DELAY);
        }
    }

    /// Read-only report of every migration against the ledger.
    ///
    /// Takes no lock and never creates the tracking table.
    pub fn status(
        &self,
        engine: &str,
        params: &ConnectionParams,
        files: &[MigrationFile],
    ) -> Result<Vec<MigrationStatus>> {
        let files = ordered(files)?;
        let (mut conn, profile) = self.factory.get_connection(engine, params)?;

        let ledger = MigrationLedger::new(&profile);
        let applied = ledger.tracking_table_exists(conn.as_mut()).and_then(|exists| {
            if exists {
                ledger.list_applied(conn.as_mut())
            } else {
                Ok(Vec::new())
            }
        });
        let closed = conn.close();
        let applied = applied?;
        closed.map_err(Error::Connection)?;

        let mut recorded: BTreeMap<&str, &AppliedRecord> = applied
            .iter()
            .map(|r| (r.identifier.as_str(), r))
            .collect();

        let mut report = Vec::with_capacity(files.len() + recorded.len());
        for file in &files {
            let entry = match recorded.remove(file.identifier()) {
                Some(record) => MigrationStatus {
                    identifier: file.identifier().to_string(),
                    status: if self.has_drifted(file, record)? {
                        StatusKind::Drifted
                    } else {
                        StatusKind::Applied
                    },
                    applied_at: Some(record.applied_at),
                },
                None => MigrationStatus {
                    identifier: file.identifier().to_string(),
                    status: StatusKind::Pending,
                    applied_at: None,
                },
            };
            report.push(entry);
        }
        report.extend(recorded.into_values().map(|record| MigrationStatus {
            identifier: record.identifier.clone(),
            status: StatusKind::Missing,
            applied_at: Some(record.applied_at),
        }));
        report.sort_by(|a, b| a.identifier.as_bytes().cmp(b.identifier.as_bytes()));
        Ok(report)
    }

    fn transition(&mut self, next: RunState) {
        self.state = next;
    }

    /// Move to `Failed` and report `err` under the migration identifier, or
    /// under the current stage when no migration is involved
    fn fail(&mut self, sink: &dyn EventSink, identifier: Option<&str>, err: Error) -> Error {
        let event = match identifier {
            Some(id) => LogEvent::new("failed").with_identifier(id),
            None => LogEvent::new("failed").with_stage(self.state.stage()),
        };
        sink.emit(&event.with_error(err.to_string()));
        self.state = RunState::Failed;
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::file_lock::FileLocks;
    use crate::ports::MemorySink;
    use tempfile::{tempdir, TempDir};

    fn sqlite_db() -> (TempDir, ConnectionParams) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.db");
        let params = ConnectionParams::from_connection_string(path.to_str().unwrap());
        (dir, params)
    }

    fn files(entries: &[(&str, &'static str)]) -> Vec<MigrationFile> {
        entries
            .iter()
            .map(|&(name, sql)| MigrationFile::embedded(name, sql))
            .collect()
    }

    #[test]
    fn test_run_reports_events_in_order() {
        let factory = ConnectionFactory::builtin();
        let (_dir, params) = sqlite_db();
        let sink = MemorySink::new();
        let migrations = files(&[
            ("0002_b", "CREATE TABLE b (id INTEGER);"),
            ("0001_a", "CREATE TABLE a (id INTEGER);"),
        ]);

        let mut runner = MigrationRunner::new(&factory);
        let summary = runner.run("sqlite", &params, &migrations, &sink).unwrap();

        assert_eq!(runner.state(), RunState::Done);
        assert_eq!(summary.applied, vec!["0001_a", "0002_b"]);
        assert_eq!(summary.applied_count, 2);
        assert_eq!(summary.skipped_count, 0);
        assert_eq!(
            sink.messages(),
            vec![
                "connecting",
                "locking",
                "ensuring_ledger",
                "pending_count=2",
                "applying:0001_a",
                "applied:0001_a",
                "applying:0002_b",
                "applied:0002_b",
                "done=2",
            ]
        );
    }

    #[test]
    fn test_second_run_is_a_no_op() {
        let factory = ConnectionFactory::builtin();
        let (_dir, params) = sqlite_db();
        let migrations = files(&[("0001_a", "CREATE TABLE a (id INTEGER);")]);

        MigrationRunner::new(&factory)
            .run("sqlite", &params, &migrations, &MemorySink::new())
            .unwrap();
        let summary = MigrationRunner::new(&factory)
            .run("sqlite", &params, &migrations, &MemorySink::new())
            .unwrap();

        assert_eq!(summary.applied_count, 0);
        assert_eq!(summary.skipped_count, 1);
    }

    #[test]
    fn test_failure_stops_the_run() {
        let factory = ConnectionFactory::builtin();
        let (_dir, params) = sqlite_db();
        let sink = MemorySink::new();
        let migrations = files(&[
            ("0001_a", "CREATE TABLE a (id INTEGER);"),
            ("0002_b", "CREATE TABLE broken (;"),
            ("0003_c", "CREATE TABLE c (id INTEGER);"),
        ]);

        let mut runner = MigrationRunner::new(&factory);
        let err = runner.run("sqlite", &params, &migrations, &sink).unwrap_err();

        assert!(matches!(err, Error::MigrationExecution { ref identifier, .. } if identifier == "0002_b"));
        assert_eq!(runner.state(), RunState::Failed);
        let messages = sink.messages();
        assert!(messages.iter().any(|m| m.starts_with("failed:0002_b:")));
        assert!(!messages.iter().any(|m| m.contains("0003_c")));

        let status = runner.status("sqlite", &params, &migrations).unwrap();
        let kinds: Vec<StatusKind> = status.iter().map(|s| s.status).collect();
        assert_eq!(
            kinds,
            vec![StatusKind::Applied, StatusKind::Pending, StatusKind::Pending]
        );
    }

    #[test]
    fn test_duplicate_identifiers_fail_before_connecting() {
        let factory = ConnectionFactory::builtin();
        let sink = MemorySink::new();
        let migrations = files(&[("0001_a", "SELECT 1;"), ("0001_a.sql", "SELECT 2;")]);

        let mut runner = MigrationRunner::new(&factory);
        let err = runner
            .run("notadb", &ConnectionParams::default(), &migrations, &sink)
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateMigration(_)));
        assert_eq!(sink.messages(), vec!["failed:idle:duplicate migration identifier: 0001_a"]);
    }

    #[test]
    fn test_unsupported_engine_fails_while_connecting() {
        let factory = ConnectionFactory::builtin();
        let sink = MemorySink::new();

        let mut runner = MigrationRunner::new(&factory);
        let err = runner
            .run("notadb", &ConnectionParams::default(), &[], &sink)
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedEngine(_)));
        assert_eq!(runner.state(), RunState::Failed);
        assert!(sink.messages()[1].starts_with("failed:connecting:"));
    }

    #[test]
    fn test_dry_run_applies_nothing() {
        let factory = ConnectionFactory::builtin();
        let (_dir, params) = sqlite_db();
        let migrations = files(&[("0001_a", "CREATE TABLE a (id INTEGER);")]);

        let options = RunOptions {
            dry_run: true,
            ..Default::default()
        };
        let summary = MigrationRunner::new(&factory)
            .with_options(options)
            .run("sqlite", &params, &migrations, &MemorySink::new())
            .unwrap();
        assert!(summary.dry_run);
        assert_eq!(summary.pending, vec!["0001_a"]);
        assert_eq!(summary.applied_count, 0);

        // nothing written, not even the tracking table
        let (mut conn, profile) = factory.get_connection("sqlite", &params).unwrap();
        assert!(!MigrationLedger::new(&profile)
            .tracking_table_exists(conn.as_mut())
            .unwrap());
        conn.close().unwrap();

        let status = MigrationRunner::new(&factory)
            .status("sqlite", &params, &migrations)
            .unwrap();
        assert_eq!(status[0].status, StatusKind::Pending);
    }

    #[test]
    fn test_drift_and_out_of_order_detection() {
        let factory = ConnectionFactory::builtin();
        let (_dir, params) = sqlite_db();

        MigrationRunner::new(&factory)
            .run(
                "sqlite",
                &params,
                &files(&[("0002_b", "CREATE TABLE b (id INTEGER);")]),
                &MemorySink::new(),
            )
            .unwrap();

        let changed = files(&[
            ("0001_a", "CREATE TABLE a (id INTEGER);"),
            ("0002_b", "CREATE TABLE b (id BIGINT);"),
        ]);

        let strict = RunOptions {
            verify_checksums: true,
            ..Default::default()
        };
        let err = MigrationRunner::new(&factory)
            .with_options(strict)
            .run("sqlite", &params, &changed, &MemorySink::new())
            .unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { ref identifier } if identifier == "0002_b"));

        let sink = MemorySink::new();
        let summary = MigrationRunner::new(&factory)
            .run("sqlite", &params, &changed, &sink)
            .unwrap();
        assert_eq!(summary.applied, vec!["0001_a"]);
        let messages = sink.messages();
        assert!(messages.contains(&"out_of_order:0001_a".to_string()));
        assert!(messages.contains(&"drift:0002_b".to_string()));

        let status = MigrationRunner::new(&factory)
            .status("sqlite", &params, &changed[..1])
            .unwrap();
        let kinds: Vec<(&str, StatusKind)> = status
            .iter()
            .map(|s| (s.identifier.as_str(), s.status))
            .collect();
        assert_eq!(
            kinds,
            vec![("0001_a", StatusKind::Applied), ("0002_b", StatusKind::Missing)]
        );
    }

    #[test]
    fn test_lock_timeout_when_lock_is_held() {
        let factory = ConnectionFactory::builtin();
        let (_dir, params) = sqlite_db();
        let path = params.connection_string.clone().unwrap();

        let mut holder = FileLocks::for_database(&path);
        assert!(holder.try_lock("xalanih_history").unwrap());

        let options = RunOptions {
            lock_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let mut runner = MigrationRunner::new(&factory).with_options(options);
        let err = runner
            .run("sqlite", &params, &files(&[("0001_a", "SELECT 1;")]), &MemorySink::new())
            .unwrap_err();
        assert!(matches!(err, Error::LockTimeout { waited_ms } if waited_ms >= 200));

        holder.unlock("xalanih_history").unwrap();
        MigrationRunner::new(&factory)
            .run("sqlite", &params, &files(&[("0001_a", "SELECT 1;")]), &MemorySink::new())
            .unwrap();
    }

    #[test]
    fn test_status_without_tracking_table_is_read_only() {
        let factory = ConnectionFactory::builtin();
        let (_dir, params) = sqlite_db();
        let migrations = files(&[("0001_a", "CREATE TABLE a (id INTEGER);")]);

        let status = MigrationRunner::new(&factory)
            .status("sqlite", &params, &migrations)
            .unwrap();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].status, StatusKind::Pending);

        let (mut conn, profile) = factory.get_connection("sqlite", &params).unwrap();
        assert!(!MigrationLedger::new(&profile)
            .tracking_table_exists(conn.as_mut())
            .unwrap());
    }

    #[test]
    fn test_expired_deadline_cancels() {
        let factory = ConnectionFactory::builtin();
        let (_dir, params) = sqlite_db();
        let options = RunOptions::default().with_timeout(Duration::ZERO);

        let err = MigrationRunner::new(&factory)
            .with_options(options)
            .run(
                "sqlite",
                &params,
                &files(&[("0001_a", "CREATE TABLE a (id INTEGER);")]),
                &MemorySink::new(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled { identifier: Some(ref id) } if id == "0001_a"));
    }
}
