//! Connection factory - engine name to live connection plus dialect profile

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use regex::Regex;

use crate::adapters::{DuckDbDriver, MySqlDriver, PostgresDriver, SqliteDriver};
use crate::domain::result::{Error, Result};
use crate::domain::DialectProfile;
use crate::ports::{Connection, ConnectionParams, Driver, EventSink, NullSink};

/// Tracking table used when none is configured
pub const DEFAULT_TABLE: &str = "xalanih_history";

type DriverCtor = fn() -> Arc<dyn Driver>;

fn duckdb_driver() -> Arc<dyn Driver> {
    Arc::new(DuckDbDriver)
}

fn sqlite_driver() -> Arc<dyn Driver> {
    Arc::new(SqliteDriver)
}

fn postgres_driver() -> Arc<dyn Driver> {
    Arc::new(PostgresDriver)
}

fn mysql_driver() -> Arc<dyn Driver> {
    Arc::new(MySqlDriver)
}

/// Engines available out of the box, with their accepted names
const BUILTIN_ENGINES: &[(&[&str], DriverCtor)] = &[
    (&["duckdb"], duckdb_driver),
    (&["sqlite", "sqlite3"], sqlite_driver),
    (&["postgres", "postgresql", "pg"], postgres_driver),
    (&["mysql", "mariadb"], mysql_driver),
];

fn identifier_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid identifier regex"))
}

/// Resolves engine names to drivers.
///
/// Registration happens while building the factory; lookups afterwards are
/// read-only. Names are matched case-insensitively.
#[derive(Clone)]
pub struct ConnectionFactory {
    drivers: BTreeMap<String, Arc<dyn Driver>>,
    table: String,
}

impl Default for ConnectionFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionFactory {
    /// Factory with no engines registered
    pub fn new() -> Self {
        Self {
            drivers: BTreeMap::new(),
            table: DEFAULT_TABLE.to_string(),
        }
    }

    /// Factory with DuckDB, SQLite, PostgreSQL and MySQL registered
    pub fn builtin() -> Self {
        let mut factory = Self::new();
        for (names, ctor) in BUILTIN_ENGINES {
            factory.register(names, ctor());
        }
        factory
    }

    /// Register `driver` under every name in `names`
    pub fn register(&mut self, names: &[&str], driver: Arc<dyn Driver>) -> &mut Self {
        for name in names {
            self.drivers
                .insert(name.to_ascii_lowercase(), Arc::clone(&driver));
        }
        self
    }

    /// Use `table` as the tracking table
    pub fn with_table(mut self, table: &str) -> Result<Self> {
        if !identifier_pattern().is_match(table) {
            return Err(Error::config(format!(
                "invalid tracking table name '{}': use letters, digits and underscores",
                table
            )));
        }
        self.table = table.to_string();
        Ok(self)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Registered engine names, sorted
    pub fn engines(&self) -> Vec<&str> {
        self.drivers.keys().map(String::as_str).collect()
    }

    pub fn resolve(&self, engine: &str) -> Result<&Arc<dyn Driver>> {
        self.drivers
            .get(&engine.trim().to_ascii_lowercase())
            .ok_or_else(|| Error::UnsupportedEngine(engine.to_string()))
    }

    /// Dialect profile for `engine` and the configured table
    pub fn profile(&self, engine: &str) -> Result<DialectProfile> {
        Ok(self.resolve(engine)?.requests().render(&self.table))
    }

    /// Open a connection to `engine`.
    ///
    /// The engine is resolved first, so an unknown engine never triggers a
    /// connection attempt.
    pub fn get_connection(
        &self,
        engine: &str,
        params: &ConnectionParams,
    ) -> Result<(Box<dyn Connection>, DialectProfile)> {
        self.get_connection_with_events(engine, params, &NullSink)
    }

    /// [`ConnectionFactory::get_connection`], with driver progress sent to `sink`
    pub fn get_connection_with_events(
        &self,
        engine: &str,
        params: &ConnectionParams,
        sink: &dyn EventSink,
    ) -> Result<(Box<dyn Connection>, DialectProfile)> {
        let driver = self.resolve(engine)?;
        let profile = driver.requests().render(&self.table);
        let conn = driver
            .connect_with_events(params, sink)
            .map_err(Error::Connection)?;
        Ok((conn, profile))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::file_lock::IN_MEMORY;
    use crate::adapters::SqliteRequests;
    use crate::ports::{DialectRequests, DriverResult};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// SQLite driver that counts connection attempts
    #[derive(Default)]
    struct CountingDriver {
        connects: AtomicUsize,
    }

    impl Driver for CountingDriver {
        fn requests(&self) -> &dyn DialectRequests {
            &SqliteRequests
        }

        fn connect(&self, params: &ConnectionParams) -> DriverResult<Box<dyn Connection>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            SqliteDriver.connect(params)
        }
    }

    #[test]
    fn test_builtin_names_are_case_insensitive() {
        let factory = ConnectionFactory::builtin();
        for name in ["duckdb", "SQLite", "sqlite3", "Postgres", "PG", "postgresql", "MySQL", "mariadb"] {
            assert!(factory.resolve(name).is_ok(), "{}", name);
        }
        assert_eq!(factory.profile("PostgreSQL").unwrap().engine, "postgres");
        assert_eq!(factory.profile("MariaDB").unwrap().engine, "mysql");
    }

    #[test]
    fn test_unsupported_engine_never_connects() {
        let counting = Arc::new(CountingDriver::default());
        let mut factory = ConnectionFactory::new();
        factory.register(&["sqlite"], counting.clone());

        let params = ConnectionParams::from_connection_string(IN_MEMORY);
        let err = factory.get_connection("notadb", &params).err().unwrap();
        assert!(matches!(err, Error::UnsupportedEngine(ref name) if name == "notadb"));
        assert_eq!(counting.connects.load(Ordering::SeqCst), 0);

        let (conn, profile) = factory.get_connection("SQLITE", &params).unwrap();
        assert_eq!(profile.table, DEFAULT_TABLE);
        assert_eq!(counting.connects.load(Ordering::SeqCst), 1);
        conn.close().unwrap();
    }

    #[test]
    fn test_table_name_validation() {
        let factory = ConnectionFactory::builtin().with_table("schema_log").unwrap();
        assert_eq!(factory.table(), "schema_log");
        assert!(factory
            .profile("sqlite")
            .unwrap()
            .create_table_sql
            .contains("schema_log"));

        for bad in ["", "1table", "drop table x;", "a-b"] {
            assert!(matches!(
                ConnectionFactory::builtin().with_table(bad),
                Err(Error::Config(_))
            ));
        }
    }

    #[test]
    fn test_connection_failure_is_classified() {
        let factory = ConnectionFactory::builtin();
        let err = factory
            .get_connection("sqlite", &ConnectionParams::default())
            .err()
            .unwrap();
        assert!(matches!(err, Error::Connection(_)));
        assert_eq!(err.exit_code(), 4);
    }
}
