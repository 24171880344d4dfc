use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};

use crate::error::SqlUpError;

pub const LEDGER_TABLE: &str = "migrations";

// Timestamps are fixed-width RFC 3339 UTC strings, so text order is time order.
const CREATE_LEDGER_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS migrations (
    version TEXT PRIMARY KEY,
    started_at TEXT NOT NULL,
    ended_at TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS migrations_version_idx ON migrations (version);
"#;

/// One applied (or interrupted, when `ended_at` is `None`) migration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LedgerRow {
    pub version: String,
    pub started_at: String,
    pub ended_at: Option<String>,
}

/// Reads and writes the applied-migrations ledger.
///
/// Every function takes the connection of the caller's open transaction; the
/// ledger never begins or commits anything on its own.
pub struct Ledger;

impl Ledger {
    pub fn ensure_schema(conn: &Connection) -> Result<(), SqlUpError> {
        conn.execute_batch(CREATE_LEDGER_SQL)?;
        Ok(())
    }

    /// The row treated as "most recently applied".
    ///
    /// Only completed rows count. They are ranked by completion time first
    /// and version second, so a lexically smaller version that finished later
    /// wins over a larger one that finished earlier.
    pub fn watermark(conn: &Connection) -> Result<Option<LedgerRow>, SqlUpError> {
        conn.query_row(
            "SELECT version, started_at, ended_at
            FROM migrations
            WHERE ended_at IS NOT NULL
            ORDER BY ended_at DESC, version DESC
            LIMIT 1",
            [],
            |row| {
                Ok(LedgerRow {
                    version: row.get(0)?,
                    started_at: row.get(1)?,
                    ended_at: row.get(2)?,
                })
            },
        )
        .optional()
        .map_err(SqlUpError::DatabaseError)
    }

    pub fn record_start(conn: &Connection, version: &str) -> Result<(), SqlUpError> {
        conn.execute(
            "INSERT INTO migrations (version, started_at) VALUES (?, ?)",
            params![version, Self::now()],
        )
        .map_err(|e| match e.sqlite_error_code() {
            Some(ErrorCode::ConstraintViolation) => SqlUpError::DuplicateVersion {
                version: version.to_owned(),
            },
            _ => SqlUpError::Query {
                version: Some(version.to_owned()),
                source: e,
            },
        })?;

        Ok(())
    }

    pub fn record_end(conn: &Connection, version: &str) -> Result<(), SqlUpError> {
        let updated = conn.execute(
            "UPDATE migrations SET ended_at = ? WHERE version = ?",
            params![Self::now(), version],
        )?;

        if updated != 1 {
            return Err(SqlUpError::Error(format!(
                "Ledger row for migration {} disappeared before it could be completed",
                version
            )));
        }

        Ok(())
    }

    pub fn rows(conn: &Connection) -> Result<Vec<LedgerRow>, SqlUpError> {
        let mut stmt = conn.prepare(
            "SELECT version, started_at, ended_at
            FROM migrations
            ORDER BY version ASC",
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok(LedgerRow {
                    version: row.get(0)?,
                    started_at: row.get(1)?,
                    ended_at: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows)
    }

    pub fn exists(conn: &Connection) -> Result<bool, SqlUpError> {
        let count: i64 = conn.query_row(
            "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
            [LEDGER_TABLE],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn now() -> String {
        Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
    }
}
