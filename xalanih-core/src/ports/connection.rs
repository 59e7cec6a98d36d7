//! Connection port - synchronous database session abstraction

use crate::domain::result::DriverError;
use crate::ports::dialect::DialectRequests;
use crate::ports::events::EventSink;

pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// One result row; every column is read back as text
pub type Row = Vec<Option<String>>;

/// How to reach a database
///
/// Server engines use either the connection string or the discrete fields.
/// Embedded engines treat the connection string (or `database`) as a file
/// path; `:memory:` opens a private in-memory database.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionParams {
    pub connection_string: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
}

impl ConnectionParams {
    pub fn from_connection_string(value: impl Into<String>) -> Self {
        Self {
            connection_string: Some(value.into()),
            ..Default::default()
        }
    }

    /// Database path for embedded engines
    pub fn embedded_path(&self) -> Option<&str> {
        self.connection_string
            .as_deref()
            .or(self.database.as_deref())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// Exclusively owned session with the target database
///
/// Implementations block the calling thread for every round-trip.
pub trait Connection: Send {
    /// Run one or more statements that return no rows
    fn execute_batch(&mut self, sql: &str) -> DriverResult<()>;

    /// Run one statement with bound text parameters; returns affected rows
    fn execute(&mut self, sql: &str, params: &[&str]) -> DriverResult<u64>;

    /// Run one query with bound text parameters
    fn query(&mut self, sql: &str, params: &[&str]) -> DriverResult<Vec<Row>>;

    /// Try to take the named advisory lock without waiting
    fn try_lock(&mut self, name: &str) -> DriverResult<bool>;

    /// Release a lock taken with [`Connection::try_lock`]
    fn unlock(&mut self, name: &str) -> DriverResult<()>;

    fn close(self: Box<Self>) -> DriverResult<()>;
}

/// Engine driver: the dialect plus a way to open connections
pub trait Driver: Send + Sync {
    fn requests(&self) -> &dyn DialectRequests;

    fn connect(&self, params: &ConnectionParams) -> DriverResult<Box<dyn Connection>>;

    /// Like [`Driver::connect`], reporting progress such as busy retries
    /// to `sink`
    fn connect_with_events(
        &self,
        params: &ConnectionParams,
        _sink: &dyn EventSink,
    ) -> DriverResult<Box<dyn Connection>> {
        self.connect(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_path() {
        let params = ConnectionParams::from_connection_string(" /tmp/app.db ");
        assert_eq!(params.embedded_path(), Some("/tmp/app.db"));

        let params = ConnectionParams {
            database: Some("app.duckdb".into()),
            ..Default::default()
        };
        assert_eq!(params.embedded_path(), Some("app.duckdb"));

        assert_eq!(ConnectionParams::default().embedded_path(), None);
    }
}
