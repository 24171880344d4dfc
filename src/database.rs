use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{OpenFlags, TransactionBehavior};
use serde::Deserialize;

use crate::config::DatabaseConfig;
use crate::error::SqlUpError;
use crate::ledger::LEDGER_TABLE;

/// Where a database lives, as resolved from a credentials argument.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    File(PathBuf),
    Uri(String),
    Memory,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::File(path) => write!(f, "{}", path.display()),
            Target::Uri(uri) => f.write_str(uri),
            Target::Memory => f.write_str(":memory:"),
        }
    }
}

/// JSON credentials file. Only `DB_NAME` means anything to SQLite; the
/// network keys are accepted so that files written for server databases
/// still load.
#[derive(Deserialize, Debug)]
struct CredentialsFile {
    #[serde(rename = "DB_NAME")]
    db_name: String,
    #[serde(rename = "DB_HOST", default)]
    db_host: Option<serde_json::Value>,
    #[serde(rename = "DB_PORT", default)]
    db_port: Option<serde_json::Value>,
    #[serde(rename = "DB_USER", default)]
    db_user: Option<serde_json::Value>,
}

pub struct Credentials;

impl Credentials {
    /// Resolves a credentials argument: a `.json` credentials file if one
    /// exists at that path, otherwise a connection string.
    pub fn resolve(arg: &str) -> Result<Target, SqlUpError> {
        let arg = arg.trim();
        if arg.is_empty() {
            return Err(SqlUpError::Connection("Empty connection string".into()));
        }

        let path = Path::new(arg);
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json && path.is_file() {
            return Self::from_file(path);
        }

        Ok(Self::from_connection_string(arg))
    }

    fn from_connection_string(arg: &str) -> Target {
        if arg == ":memory:" || arg == "sqlite::memory:" || arg == "sqlite://:memory:" {
            return Target::Memory;
        }
        if arg.starts_with("file:") {
            return Target::Uri(arg.to_owned());
        }

        let path = arg
            .strip_prefix("sqlite://")
            .or_else(|| arg.strip_prefix("sqlite:"))
            .unwrap_or(arg);
        Target::File(PathBuf::from(path))
    }

    fn from_file(path: &Path) -> Result<Target, SqlUpError> {
        let contents = fs::read_to_string(path)?;
        let creds: CredentialsFile = serde_json::from_str(&contents).map_err(|e| {
            SqlUpError::Connection(format!(
                "Could not read credentials file {}: {}",
                path.display(),
                e
            ))
        })?;

        if creds.db_host.is_some() || creds.db_port.is_some() || creds.db_user.is_some() {
            debug!(
                "Ignoring network settings in {} - SQLite only uses DB_NAME",
                path.display()
            );
        }

        let target = Self::from_connection_string(&creds.db_name);
        Ok(match target {
            // A relative DB_NAME is relative to the credentials file
            Target::File(db_path) if db_path.is_relative() => {
                let base = path.parent().unwrap_or_else(|| Path::new("."));
                Target::File(base.join(db_path))
            }
            other => other,
        })
    }
}

/// A pooled handle on one target database.
#[derive(Clone)]
pub struct Database {
    label: String,
    pool: Pool<SqliteConnectionManager>,
}

impl Database {
    /// Resolves `credentials`, opens a pool and proves the database answers.
    pub fn connect(credentials: &str, config: &DatabaseConfig) -> Result<Self, SqlUpError> {
        let target = Credentials::resolve(credentials)?;
        Self::open(&target, config)
    }

    pub fn open(target: &Target, config: &DatabaseConfig) -> Result<Self, SqlUpError> {
        let busy_timeout = config.busy_timeout();

        let (manager, max_size) = match target {
            Target::File(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    if !parent.is_dir() {
                        return Err(SqlUpError::Connection(format!(
                            "Could not connect to database {}: directory {} does not exist",
                            target,
                            parent.display()
                        )));
                    }
                }
                (SqliteConnectionManager::file(path), config.max_pool_size())
            }
            Target::Uri(uri) => (
                SqliteConnectionManager::file(uri)
                    .with_flags(OpenFlags::default() | OpenFlags::SQLITE_OPEN_URI),
                config.max_pool_size(),
            ),
            // Each in-memory connection is its own database; one is all we get.
            Target::Memory => (SqliteConnectionManager::memory(), 1),
        };

        let manager = manager.with_init(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            conn.pragma_update(None, "foreign_keys", "ON")
        });

        let pool = Pool::builder()
            .max_size(max_size)
            .min_idle(Some(0))
            .connection_timeout(busy_timeout)
            .build(manager)
            .map_err(|e| {
                SqlUpError::Connection(format!("Could not connect to database {}: {}", target, e))
            })?;

        let db = Database {
            label: target.to_string(),
            pool,
        };
        db.authenticate()?;

        info!("Connected to database {}", db.label);
        Ok(db)
    }

    fn authenticate(&self) -> Result<(), SqlUpError> {
        let conn = self.pool.get().map_err(|e| {
            SqlUpError::Connection(format!(
                "Could not connect to database {}: {}",
                self.label, e
            ))
        })?;

        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map_err(|e| SqlUpError::Authentication(format!("{}: {}", self.label, e)))?;

        Ok(())
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, SqlUpError> {
        Ok(self.pool.get()?)
    }

    /// Empties every table except the migration ledger, in one transaction.
    /// Returns the number of tables truncated.
    pub fn truncate_all(&self) -> Result<usize, SqlUpError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        // Rows are removed table by table; references only have to hold at commit
        tx.pragma_update(None, "defer_foreign_keys", "ON")?;

        let tables: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT name FROM sqlite_master
                WHERE type = 'table' AND name <> ? AND name NOT LIKE 'sqlite_%'
                ORDER BY name ASC",
            )?;
            let names = stmt.query_map([LEDGER_TABLE], |row| row.get(0))?;
            names.collect::<Result<Vec<String>, _>>()?
        };

        for table in &tables {
            debug!("Truncating table {}", table);
            tx.execute(&format!("DELETE FROM \"{}\"", table.replace('"', "\"\"")), [])?;
        }

        let has_sequence: i64 = tx.query_row(
            "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = 'sqlite_sequence'",
            [],
            |row| row.get(0),
        )?;
        if has_sequence > 0 {
            tx.execute("DELETE FROM sqlite_sequence WHERE name <> ?", [LEDGER_TABLE])?;
        }

        tx.commit()?;
        Ok(tables.len())
    }
}

/// Every database a command works against. Created when the command starts
/// and released when it goes out of scope, on success and error alike.
pub struct Connections {
    databases: Vec<Database>,
}

impl Connections {
    pub fn open(credentials: &[String], config: &DatabaseConfig) -> Result<Self, SqlUpError> {
        let databases = credentials
            .iter()
            .map(|c| Database::connect(c, config))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Connections { databases })
    }

    pub fn databases(&self) -> &[Database] {
        &self.databases
    }
}

impl Drop for Connections {
    fn drop(&mut self) {
        for db in &self.databases {
            debug!("Closing database {}", db.label());
        }
    }
}
