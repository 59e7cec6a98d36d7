//! Adapter implementations
//!
//! Adapters implement the connection and dialect ports per engine:
//! - DuckDB and SQLite as embedded files, locked with `fs2` lock files
//! - PostgreSQL through tokio-postgres, locked with advisory locks
//! - MySQL / MariaDB through mysql_async, locked with `GET_LOCK`

pub mod duckdb;
pub mod file_lock;
pub mod mysql;
pub mod postgres;
pub mod runtime;
pub mod sqlite;

pub use self::duckdb::{DuckDbDriver, DuckDbRequests};
pub use self::mysql::{MySqlDriver, MySqlRequests};
pub use self::postgres::{PostgresDriver, PostgresRequests};
pub use self::sqlite::{SqliteDriver, SqliteRequests};
