//! Run options, states and results

use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default time to wait for another run's lock
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Lifecycle of one migration run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Connecting,
    Locking,
    EnsuringLedger,
    Diffing,
    /// Applying the pending migration at this position
    Applying(usize),
    Done,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Failed)
    }

    /// Stage name used in `failed:<stage>:<cause>` events
    pub fn stage(&self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Connecting => "connecting",
            RunState::Locking => "locking",
            RunState::EnsuringLedger => "ensuring_ledger",
            RunState::Diffing => "diffing",
            RunState::Applying(_) => "applying",
            RunState::Done => "done",
            RunState::Failed => "failed",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Applying(i) => write!(f, "applying({})", i),
            other => f.write_str(other.stage()),
        }
    }
}

/// Knobs for one run
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// How long to wait for a concurrent run to release the lock
    pub lock_timeout: Duration,
    /// Abort at the next statement boundary once this instant passes
    pub deadline: Option<Instant>,
    /// Report the plan without applying anything
    pub dry_run: bool,
    /// Fail when an applied migration's file changed since it was applied
    pub verify_checksums: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            deadline: None,
            dry_run: false,
            verify_checksums: false,
        }
    }
}

impl RunOptions {
    /// Set the deadline to `timeout` from now
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn deadline_passed(&self) -> bool {
        self.deadline.map(|d| Instant::now() >= d).unwrap_or(false)
    }
}

/// Outcome of a successful run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub applied_count: usize,
    /// Files already recorded in the ledger
    pub skipped_count: usize,
    pub duration_ms: u64,
    /// Identifiers applied by this run, in order
    pub applied: Vec<String>,
    /// Identifiers that were pending when the run started
    pub pending: Vec<String>,
    pub dry_run: bool,
}

/// Where one migration stands against the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Applied,
    Pending,
    /// Applied, but the file's checksum no longer matches
    Drifted,
    /// Recorded in the ledger with no file on disk
    Missing,
}

impl StatusKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusKind::Applied => "applied",
            StatusKind::Pending => "pending",
            StatusKind::Drifted => "drifted",
            StatusKind::Missing => "missing",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationStatus {
    pub identifier: String,
    pub status: StatusKind,
    pub applied_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names() {
        assert_eq!(RunState::EnsuringLedger.to_string(), "ensuring_ledger");
        assert_eq!(RunState::Applying(2).to_string(), "applying(2)");
        assert_eq!(RunState::Applying(2).stage(), "applying");
        assert!(RunState::Failed.is_terminal());
        assert!(!RunState::Diffing.is_terminal());
    }

    #[test]
    fn test_deadline() {
        let options = RunOptions::default();
        assert!(!options.deadline_passed());
        assert_eq!(options.lock_timeout, DEFAULT_LOCK_TIMEOUT);

        let options = RunOptions::default().with_timeout(Duration::ZERO);
        assert!(options.deadline_passed());
    }
}
