//! Migration ledger - the tracking table inside the target database

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::domain::record::{format_timestamp, parse_timestamp};
use crate::domain::result::{DriverError, Error, Result};
use crate::domain::{AppliedRecord, DialectProfile};
use crate::ports::Connection;

/// A concurrent creator can win the race between the existence check and
/// `CREATE TABLE IF NOT EXISTS`. Postgres reports that as a unique violation
/// on its catalog.
fn is_already_exists(err: &DriverError) -> bool {
    err.is_unique_violation() || err.message.to_lowercase().contains("already exists")
}

/// Reads and writes applied-migration records
pub struct MigrationLedger<'a> {
    profile: &'a DialectProfile,
}

impl<'a> MigrationLedger<'a> {
    pub fn new(profile: &'a DialectProfile) -> Self {
        Self { profile }
    }

    pub fn tracking_table_exists(&self, conn: &mut dyn Connection) -> Result<bool> {
        let rows = conn
            .query(
                &self.profile.check_table_exists_sql,
                &[self.profile.table.as_str()],
            )
            .map_err(Error::Ledger)?;
        Ok(!rows.is_empty())
    }

    /// Create the tracking table if it is missing. Returns whether this call
    /// created it.
    pub fn ensure_tracking_table(&self, conn: &mut dyn Connection) -> Result<bool> {
        if self.tracking_table_exists(conn)? {
            return Ok(false);
        }
        match conn.execute_batch(&self.profile.create_table_sql) {
            Ok(()) => Ok(true),
            Err(e) if is_already_exists(&e) => Ok(false),
            Err(e) => Err(Error::Ledger(e)),
        }
    }

    /// All records, ordered by identifier
    pub fn list_applied(&self, conn: &mut dyn Connection) -> Result<Vec<AppliedRecord>> {
        let rows = conn
            .query(&self.profile.select_applied_sql, &[])
            .map_err(Error::Ledger)?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let mut columns = row.into_iter();
            let identifier = columns.next().flatten().ok_or_else(|| {
                Error::Ledger(DriverError::other(format!(
                    "{} contains a row without identifier",
                    self.profile.table
                )))
            })?;
            let applied_at = columns
                .next()
                .flatten()
                .as_deref()
                .and_then(parse_timestamp)
                .ok_or_else(|| {
                    Error::Ledger(DriverError::other(format!(
                        "{} has an unreadable applied_at for {}",
                        self.profile.table, identifier
                    )))
                })?;
            let checksum = columns.next().flatten().filter(|c| !c.is_empty());
            records.push(AppliedRecord {
                identifier,
                applied_at,
                checksum,
            });
        }
        Ok(records)
    }

    pub fn applied_identifiers(&self, conn: &mut dyn Connection) -> Result<BTreeSet<String>> {
        Ok(self
            .list_applied(conn)?
            .into_iter()
            .map(|r| r.identifier)
            .collect())
    }

    /// Insert the record for `identifier` with bound parameters.
    ///
    /// A uniqueness violation means another run already applied the
    /// migration; it surfaces as `LedgerWrite` and must stop the run.
    /// Any other failure is a plain `Ledger` error.
    pub fn record(
        &self,
        conn: &mut dyn Connection,
        identifier: &str,
        applied_at: DateTime<Utc>,
        checksum: &str,
    ) -> Result<()> {
        let applied_at = format_timestamp(&applied_at);
        conn.execute(
            &self.profile.insert_record_sql,
            &[identifier, applied_at.as_str(), checksum],
        )
        .map(|_| ())
        .map_err(|source| {
            if source.is_unique_violation() {
                Error::LedgerWrite {
                    identifier: identifier.to_string(),
                    source,
                }
            } else {
                Error::Ledger(source)
            }
        })
    }
}
