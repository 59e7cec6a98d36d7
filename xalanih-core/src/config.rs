//! Configuration management
//!
//! Settings live in `xalanih.json`:
//! ```json
//! {
//!   "engine": "postgres",
//!   "connectionString": "postgres://app@localhost/app",
//!   "migrationsDir": "migrations",
//!   "table": "xalanih_history",
//!   "lockTimeoutSecs": 30
//! }
//! ```
//! `XALANIH_*` environment variables override the file, and CLI flags
//! override both.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::result::{Error, Result};
use crate::domain::RunOptions;
use crate::ports::ConnectionParams;
use crate::services::factory::DEFAULT_TABLE;

/// Default settings file name
pub const CONFIG_FILE: &str = "xalanih.json";

const DEFAULT_MIGRATIONS_DIR: &str = "migrations";
const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 30;

fn default_migrations_dir() -> PathBuf {
    PathBuf::from(DEFAULT_MIGRATIONS_DIR)
}

fn default_table() -> String {
    DEFAULT_TABLE.to_string()
}

fn default_lock_timeout_secs() -> u64 {
    DEFAULT_LOCK_TIMEOUT_SECS
}

/// Xalanih configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub engine: Option<String>,
    #[serde(default)]
    pub connection_string: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default = "default_migrations_dir")]
    pub migrations_dir: PathBuf,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
    /// Whole-run deadline
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub verify_checksums: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: None,
            connection_string: None,
            host: None,
            port: None,
            user: None,
            password: None,
            database: None,
            migrations_dir: default_migrations_dir(),
            table: default_table(),
            lock_timeout_secs: DEFAULT_LOCK_TIMEOUT_SECS,
            timeout_secs: None,
            verify_checksums: false,
        }
    }
}

impl Config {
    /// Load `path` and apply overrides from the process environment.
    ///
    /// A missing file yields the defaults; a malformed one is an error.
    pub fn load(path: &Path) -> Result<Self> {
        Self::load_with_env(path, |key| std::env::var(key).ok())
    }

    /// Like [`Config::load`] with an injectable environment lookup
    pub fn load_with_env<F>(path: &Path, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str::<Config>(&content).map_err(|e| {
                Error::config(format!("{} is malformed: {}", path.display(), e))
            })?
        } else {
            Config::default()
        };
        config.apply_env(env)?;
        Ok(config)
    }

    fn apply_env<F>(&mut self, env: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("XALANIH_ENGINE") {
            self.engine = Some(v);
        }
        if let Some(v) = var("XALANIH_CONNECTION_STRING") {
            self.connection_string = Some(v);
        }
        if let Some(v) = var("XALANIH_HOST") {
            self.host = Some(v);
        }
        if let Some(v) = var("XALANIH_PORT") {
            let port = v
                .trim()
                .parse()
                .map_err(|_| Error::config(format!("XALANIH_PORT is not a port number: {}", v)))?;
            self.port = Some(port);
        }
        if let Some(v) = var("XALANIH_USER") {
            self.user = Some(v);
        }
        if let Some(v) = var("XALANIH_PASSWORD") {
            self.password = Some(v);
        }
        if let Some(v) = var("XALANIH_DATABASE") {
            self.database = Some(v);
        }
        if let Some(v) = var("XALANIH_MIGRATIONS_DIR") {
            self.migrations_dir = PathBuf::from(v);
        }
        if let Some(v) = var("XALANIH_TABLE") {
            self.table = v;
        }
        Ok(())
    }

    /// The configured engine name
    pub fn engine(&self) -> Result<&str> {
        self.engine
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .ok_or_else(|| {
                Error::config("no engine configured (set \"engine\", XALANIH_ENGINE or --engine)")
            })
    }

    pub fn connection_params(&self) -> ConnectionParams {
        ConnectionParams {
            connection_string: self.connection_string.clone(),
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            password: self.password.clone(),
            database: self.database.clone(),
        }
    }

    /// Run options; the deadline starts counting now
    pub fn run_options(&self) -> RunOptions {
        let options = RunOptions {
            lock_timeout: Duration::from_secs(self.lock_timeout_secs),
            verify_checksums: self.verify_checksums,
            ..Default::default()
        };
        match self.timeout_secs {
            Some(secs) => options.with_timeout(Duration::from_secs(secs)),
            None => options,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_with_env(&dir.path().join(CONFIG_FILE), no_env).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.table, "xalanih_history");
        assert_eq!(config.migrations_dir, PathBuf::from("migrations"));
        assert!(matches!(config.engine(), Err(Error::Config(_))));
    }

    #[test]
    fn test_reads_camel_case_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(
            &path,
            r#"{
                "engine": "sqlite",
                "connectionString": "app.db",
                "migrationsDir": "db/migrations",
                "lockTimeoutSecs": 5,
                "timeoutSecs": 60,
                "verifyChecksums": true
            }"#,
        )
        .unwrap();

        let config = Config::load_with_env(&path, no_env).unwrap();
        assert_eq!(config.engine().unwrap(), "sqlite");
        assert_eq!(config.connection_params().embedded_path(), Some("app.db"));
        assert_eq!(config.migrations_dir, PathBuf::from("db/migrations"));

        let options = config.run_options();
        assert_eq!(options.lock_timeout, Duration::from_secs(5));
        assert!(options.verify_checksums);
        assert!(options.deadline.is_some());
        assert!(!options.dry_run);
    }

    #[test]
    fn test_env_overrides_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, r#"{"engine": "sqlite", "table": "from_file"}"#).unwrap();

        let env: HashMap<&str, &str> = [
            ("XALANIH_ENGINE", "postgres"),
            ("XALANIH_HOST", "db.internal"),
            ("XALANIH_PORT", "6543"),
            ("XALANIH_TABLE", ""),
        ]
        .into_iter()
        .collect();
        let config =
            Config::load_with_env(&path, |k| env.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(config.engine().unwrap(), "postgres");
        assert_eq!(config.host.as_deref(), Some("db.internal"));
        assert_eq!(config.port, Some(6543));
        // empty values do not override
        assert_eq!(config.table, "from_file");
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "{ not json").unwrap();

        let err = Config::load_with_env(&path, no_env).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_bad_port_is_config_error() {
        let dir = TempDir::new().unwrap();
        let err = Config::load_with_env(&dir.path().join(CONFIG_FILE), |k| {
            (k == "XALANIH_PORT").then(|| "abc".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_password_is_never_serialized() {
        let config = Config {
            password: Some("secret".into()),
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("secret"));
    }
}
