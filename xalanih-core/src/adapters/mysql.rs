//! MySQL / MariaDB driver (mysql_async over a private runtime)

use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder, Params, Value};
use sha2::{Digest, Sha256};
use sqlparser::dialect::{Dialect, MySqlDialect};
use tokio::runtime::Runtime;

use crate::adapters::runtime::{blocking_runtime, lock_name, CONNECT_TIMEOUT};
use crate::domain::result::DriverError;
use crate::ports::{Connection, ConnectionParams, DialectRequests, Driver, DriverResult, Row};
use crate::splitter::Lexicon;

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 3306;

/// ER_DUP_ENTRY
const DUPLICATE_ENTRY: u16 = 1062;

/// `GET_LOCK` rejects longer names
const MAX_LOCK_NAME: usize = 64;

/// `GET_LOCK` name for `name`. Names over the server limit are replaced by
/// a SHA-256 prefix so every table name can be locked.
pub fn mysql_lock_name(name: &str) -> String {
    let lock = lock_name(name);
    if lock.len() <= MAX_LOCK_NAME {
        return lock;
    }
    let digest = Sha256::digest(lock.as_bytes());
    format!("xalanih.{}", hex::encode(&digest[..16]))
}

fn driver_error(err: mysql_async::Error) -> DriverError {
    match &err {
        mysql_async::Error::Server(server) if server.code == DUPLICATE_ENTRY => {
            DriverError::unique_violation(err.to_string())
        }
        mysql_async::Error::Io(_) | mysql_async::Error::Driver(_) => {
            DriverError::connection(err.to_string())
        }
        _ => DriverError::other(err.to_string()),
    }
}

/// Tracking-table SQL for MySQL and MariaDB
#[derive(Debug, Default, Clone, Copy)]
pub struct MySqlRequests;

impl DialectRequests for MySqlRequests {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn check_table_exists(&self, _table: &str) -> String {
        "SELECT CAST(table_name AS CHAR) FROM information_schema.tables \
         WHERE table_schema = DATABASE() AND table_name = ?"
            .to_string()
    }

    fn create_table(&self, table: &str) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             identifier VARCHAR(255) NOT NULL PRIMARY KEY, \
             applied_at DATETIME(6) NOT NULL, \
             checksum VARCHAR(64))",
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
            "SELECT identifier, CAST(applied_at AS CHAR), checksum \
             FROM {} ORDER BY identifier",
            table
        )
    }

    fn begin(&self) -> &'static str {
        "START TRANSACTION"
    }

    /// DDL commits implicitly
    fn transactional_ddl(&self) -> bool {
        false
    }

    fn lexicon(&self) -> Lexicon {
        Lexicon::MYSQL
    }

    fn parser_dialect(&self) -> Box<dyn Dialect> {
        Box::new(MySqlDialect {})
    }
}

/// Build connection options from a `mysql://` URL or discrete fields
pub fn mysql_opts(params: &ConnectionParams) -> DriverResult<Opts> {
    let builder = match params.connection_string.as_deref() {
        Some(url) => {
            let opts = Opts::from_url(url)
                .map_err(|e| DriverError::connection(format!("invalid connection string: {}", e)))?;
            OptsBuilder::from_opts(opts)
        }
        None => OptsBuilder::default()
            .ip_or_hostname(params.host.as_deref().unwrap_or(DEFAULT_HOST))
            .tcp_port(params.port.unwrap_or(DEFAULT_PORT))
            .user(params.user.as_deref())
            .pass(params.password.as_deref())
            .db_name(params.database.as_deref()),
    };
    Ok(builder.into())
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MySqlDriver;

impl Driver for MySqlDriver {
    fn requests(&self) -> &dyn DialectRequests {
        &MySqlRequests
    }

    fn connect(&self, params: &ConnectionParams) -> DriverResult<Box<dyn Connection>> {
        let opts = mysql_opts(params)?;
        let runtime = blocking_runtime()?;
        let conn = runtime
            .block_on(async {
                tokio::time::timeout(CONNECT_TIMEOUT, Conn::new(opts)).await
            })
            .map_err(|_| DriverError::timeout("timed out connecting to mysql"))?
            .map_err(|e| DriverError::connection(e.to_string()))?;
        Ok(Box::new(MySqlConnection { runtime, conn }))
    }
}

pub struct MySqlConnection {
    runtime: Runtime,
    conn: Conn,
}

fn bind(params: &[&str]) -> Params {
    if params.is_empty() {
        Params::Empty
    } else {
        Params::Positional(
            params
                .iter()
                .map(|p| Value::Bytes(p.as_bytes().to_vec()))
                .collect(),
        )
    }
}

fn value_to_text(value: &Value) -> Option<String> {
    match value {
        Value::NULL => None,
        Value::Bytes(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::Int(i) => Some(i.to_string()),
        Value::UInt(u) => Some(u.to_string()),
        Value::Float(f) => Some(f.to_string()),
        Value::Double(f) => Some(f.to_string()),
        Value::Date(y, mo, d, h, mi, s, us) => Some(format!(
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:06}",
            y, mo, d, h, mi, s, us
        )),
        Value::Time(neg, days, h, mi, s, us) => Some(format!(
            "{}{:02}:{:02}:{:02}.{:06}",
            if *neg { "-" } else { "" },
            *days * 24 + u32::from(*h),
            mi,
            s,
            us
        )),
    }
}

impl Connection for MySqlConnection {
    fn execute_batch(&mut self, sql: &str) -> DriverResult<()> {
        self.runtime
            .block_on(self.conn.query_drop(sql))
            .map_err(driver_error)
    }

    fn execute(&mut self, sql: &str, params: &[&str]) -> DriverResult<u64> {
        let conn = &mut self.conn;
        self.runtime
            .block_on(async {
                conn.exec_drop(sql, bind(params)).await?;
                Ok::<_, mysql_async::Error>(conn.affected_rows())
            })
            .map_err(driver_error)
    }

    fn query(&mut self, sql: &str, params: &[&str]) -> DriverResult<Vec<Row>> {
        let rows: Vec<mysql_async::Row> = self
            .runtime
            .block_on(self.conn.exec(sql, bind(params)))
            .map_err(driver_error)?;

        Ok(rows
            .iter()
            .map(|row| {
                (0..row.len())
                    .map(|i| row.as_ref(i).and_then(value_to_text))
                    .collect()
            })
            .collect())
    }

    fn try_lock(&mut self, name: &str) -> DriverResult<bool> {
        let lock = mysql_lock_name(name);
        let rows = self.query("SELECT GET_LOCK(?, 0)", &[lock.as_str()])?;
        Ok(matches!(
            rows.first().and_then(|r| r.first()).cloned().flatten().as_deref(),
            Some("1")
        ))
    }

    fn unlock(&mut self, name: &str) -> DriverResult<()> {
        let lock = mysql_lock_name(name);
        self.query("SELECT RELEASE_LOCK(?)", &[lock.as_str()])
            .map(|_| ())
    }

    fn close(self: Box<Self>) -> DriverResult<()> {
        let MySqlConnection { runtime, conn } = *self;
        runtime.block_on(conn.disconnect()).map_err(driver_error)
    }
}
