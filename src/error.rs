use rusqlite::Error as RusqliteError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Process exit status reported by the CLI for each class of failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success = 0,
    ConnectionError = 1,
    AuthenticateError = 2,
    QueryError = 3,
    UncaughtException = 4,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }
}

#[derive(Error, Debug)]
pub enum SqlUpError {
    #[error("Migration directory \"{}\" does not exist", .0.display())]
    DirectoryNotFound(PathBuf),

    #[error("Migration path \"{}\" is not a directory", .0.display())]
    NotADirectory(PathBuf),

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("Migration {version} has already been recorded in the ledger")]
    DuplicateVersion { version: String },

    #[error("Query error{}: {source}", version_suffix(.version))]
    Query {
        version: Option<String>,
        #[source]
        source: RusqliteError,
    },

    #[error("Could not read migration file \"{}\": {source}", .path.display())]
    MigrationRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] io::Error), // Converts io::Error into SqlUpError automatically

    #[error("Database error: {0}")]
    DatabaseError(#[from] RusqliteError), // Converts rusqlite::Error automatically

    #[error("Connection pool error: {0}")]
    PoolError(#[from] r2d2::Error),

    #[error("Error: {0}")]
    Error(String), // Allows custom application errors
}

fn version_suffix(version: &Option<String>) -> String {
    match version {
        Some(v) => format!(" in migration {}", v),
        None => String::new(),
    }
}

impl From<figment::Error> for SqlUpError {
    fn from(err: figment::Error) -> Self {
        SqlUpError::Config(err.to_string())
    }
}

impl SqlUpError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            SqlUpError::Connection(_) | SqlUpError::PoolError(_) => ExitCode::ConnectionError,
            SqlUpError::Authentication(_) => ExitCode::AuthenticateError,
            SqlUpError::DuplicateVersion { .. }
            | SqlUpError::Query { .. }
            | SqlUpError::MigrationRead { .. }
            | SqlUpError::DatabaseError(_) => ExitCode::QueryError,
            _ => ExitCode::UncaughtException,
        }
    }

    /// Failures that leave the ledger consistent: a version that is already
    /// recorded, from duplicate files or an interrupted ledger row.
    pub fn is_soft(&self) -> bool {
        matches!(self, SqlUpError::DuplicateVersion { .. })
    }
}
