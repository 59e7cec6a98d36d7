//! PostgreSQL driver (tokio-postgres over a private runtime)

use sha2::{Digest, Sha256};
use sqlparser::dialect::{Dialect, PostgreSqlDialect};
use tokio::runtime::Runtime;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, Config as PgConfig, NoTls};

use crate::adapters::runtime::{blocking_runtime, lock_name, CONNECT_TIMEOUT};
use crate::domain::result::DriverError;
use crate::ports::{Connection, ConnectionParams, DialectRequests, Driver, DriverResult, Row};
use crate::splitter::Lexicon;

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 5432;

fn driver_error(err: tokio_postgres::Error) -> DriverError {
    if err.code() == Some(&SqlState::UNIQUE_VIOLATION) {
        return DriverError::unique_violation(describe(&err));
    }
    if err.is_closed() {
        return DriverError::connection(describe(&err));
    }
    DriverError::other(describe(&err))
}

/// Server errors carry the useful text in the database error, not in
/// the top-level message
fn describe(err: &tokio_postgres::Error) -> String {
    match err.as_db_error() {
        Some(db) => format!("{}: {}", db.severity(), db.message()),
        None => err.to_string(),
    }
}

/// Advisory lock key for `name`: the first eight bytes of its SHA-256
pub fn advisory_key(name: &str) -> i64 {
    let digest = Sha256::digest(lock_name(name).as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

/// Tracking-table SQL for PostgreSQL
#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresRequests;

impl DialectRequests for PostgresRequests {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn check_table_exists(&self, _table: &str) -> String {
        "SELECT table_name::text FROM information_schema.tables \
         WHERE table_schema = current_schema() AND table_name::text = $1::text"
            .to_string()
    }

    fn create_table(&self, table: &str) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             identifier VARCHAR(255) PRIMARY KEY, \
             applied_at TIMESTAMP NOT NULL, \
             checksum VARCHAR(64))",
            table
        )
    }

    fn insert_record(&self, table: &str) -> String {
        format!(
            "INSERT INTO {} (identifier, applied_at, checksum) \
             VALUES ($1::text, $2::text::timestamp, $3::text)",
            table
        )
    }

    fn select_applied(&self, table: &str) -> String {
        format!(
            "SELECT identifier::text, applied_at::text, checksum::text \
             FROM {} ORDER BY identifier",
            table
        )
    }

    fn lexicon(&self) -> Lexicon {
        Lexicon::POSTGRES
    }

    fn parser_dialect(&self) -> Box<dyn Dialect> {
        Box::new(PostgreSqlDialect {})
    }
}

/// Build the client configuration from a connection string
/// (`postgres://...` URL or `key=value` form) or discrete fields
pub fn pg_config(params: &ConnectionParams) -> DriverResult<PgConfig> {
    let mut config = match params.connection_string.as_deref() {
        Some(url) => url
            .parse::<PgConfig>()
            .map_err(|e| DriverError::connection(format!("invalid connection string: {}", e)))?,
        None => {
            let mut config = PgConfig::new();
            config.host(params.host.as_deref().unwrap_or(DEFAULT_HOST));
            config.port(params.port.unwrap_or(DEFAULT_PORT));
            if let Some(user) = &params.user {
                config.user(user);
            }
            if let Some(password) = &params.password {
                config.password(password);
            }
            if let Some(database) = &params.database {
                config.dbname(database);
            }
            config
        }
    };
    config.application_name("xalanih");
    config.connect_timeout(CONNECT_TIMEOUT);
    Ok(config)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresDriver;

impl Driver for PostgresDriver {
    fn requests(&self) -> &dyn DialectRequests {
        &PostgresRequests
    }

    fn connect(&self, params: &ConnectionParams) -> DriverResult<Box<dyn Connection>> {
        let config = pg_config(params)?;
        let runtime = blocking_runtime()?;
        let (client, connection) = runtime
            .block_on(config.connect(NoTls))
            .map_err(|e| DriverError::connection(describe(&e)))?;
        runtime.spawn(async move {
            let _ = connection.await;
        });
        Ok(Box::new(PostgresConnection { runtime, client }))
    }
}

pub struct PostgresConnection {
    runtime: Runtime,
    client: Client,
}

fn bind<'a>(params: &'a [&'a str]) -> Vec<&'a (dyn ToSql + Sync)> {
    params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

impl Connection for PostgresConnection {
    fn execute_batch(&mut self, sql: &str) -> DriverResult<()> {
        self.runtime
            .block_on(self.client.batch_execute(sql))
            .map_err(driver_error)
    }

    fn execute(&mut self, sql: &str, params: &[&str]) -> DriverResult<u64> {
        let values = bind(params);
        self.runtime
            .block_on(self.client.execute(sql, &values))
            .map_err(driver_error)
    }

    fn query(&mut self, sql: &str, params: &[&str]) -> DriverResult<Vec<Row>> {
        let values = bind(params);
        let rows = self
            .runtime
            .block_on(self.client.query(sql, &values))
            .map_err(driver_error)?;

        Ok(rows
            .iter()
            .map(|row| {
                (0..row.len())
                    .map(|i| row.try_get::<_, Option<String>>(i).ok().flatten())
                    .collect()
            })
            .collect())
    }

    fn try_lock(&mut self, name: &str) -> DriverResult<bool> {
        let key = advisory_key(name);
        let row = self
            .runtime
            .block_on(
                self.client
                    .query_one("SELECT pg_try_advisory_lock($1)", &[&key]),
            )
            .map_err(driver_error)?;
        row.try_get::<_, bool>(0).map_err(driver_error)
    }

    fn unlock(&mut self, name: &str) -> DriverResult<()> {
        let key = advisory_key(name);
        self.runtime
            .block_on(
                self.client
                    .execute("SELECT pg_advisory_unlock($1)", &[&key]),
            )
            .map(|_| ())
            .map_err(driver_error)
    }

    fn close(self: Box<Self>) -> DriverResult<()> {
        // Dropping the client ends the session; the runtime then drops the
        // connection task
        let PostgresConnection { runtime, client } = *self;
        drop(client);
        drop(runtime);
        Ok(())
    }
}
