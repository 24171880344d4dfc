use std::fs;
use std::path::Path;

use log::{debug, error, Level};
use logging_timer::timer;
use regex::Regex;
use rusqlite::{Connection, TransactionBehavior};

use crate::database::Database;
use crate::discovery::{Discovery, MigrationFile};
use crate::error::SqlUpError;
use crate::ledger::Ledger;
use crate::sink::{EventLevel, EventSink};

/// A migration that is due, with its SQL loaded.
struct PendingMigration {
    file: MigrationFile,
    sql: String,
}

/// Outcome of one successful run against one database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    pub database: String,
    /// Version the run started from, if the ledger had one.
    pub watermark: Option<String>,
    /// Versions applied by this run, in order.
    pub applied: Vec<String>,
}

pub struct Migrator;

impl Migrator {
    /// Applies every pending migration under `directory` to `db` in a single
    /// transaction.
    ///
    /// Discovery problems are returned before the database is touched. Any
    /// failure after the transaction opens rolls the whole batch back, is
    /// reported through `sink`, and is returned.
    pub fn apply(
        db: &Database,
        directory: &Path,
        filter: Option<&Regex>,
        sink: &dyn EventSink,
    ) -> Result<ApplyReport, SqlUpError> {
        let _tmr = timer!(Level::Trace; "Migrator::apply", "{}", db.label());

        let discovered = Discovery::discover(directory, filter)?;
        let root = Discovery::resolve_root(directory)?;

        let mut conn = db.conn()?;
        // IMMEDIATE takes the write lock up front so overlapping runs queue
        // at the database instead of failing halfway through a batch
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut in_flight: Option<String> = None;
        let result = match Self::apply_in_transaction(&tx, &root, discovered, sink, &mut in_flight) {
            // A failed COMMIT leaves the transaction open; dropping it rolls back
            Ok(outcome) => tx.commit().map(|()| outcome).map_err(|e| SqlUpError::Query {
                version: in_flight.clone(),
                source: e,
            }),
            Err(err) => {
                if let Err(rollback_err) = tx.rollback() {
                    error!("Rollback failed for {}: {}", db.label(), rollback_err);
                }
                Err(err)
            }
        };

        match result {
            Ok((watermark, applied)) => {
                debug!(
                    "Committed {} migration(s) to {}",
                    applied.len(),
                    db.label()
                );
                Ok(ApplyReport {
                    database: db.label().to_owned(),
                    watermark,
                    applied,
                })
            }
            Err(err) => {
                sink.emit(EventLevel::Error, &err.to_string());
                sink.emit(
                    EventLevel::Error,
                    &format!(
                        "Rolled back... An error occurred while running migration {}",
                        in_flight.as_deref().unwrap_or("none")
                    ),
                );
                Err(err)
            }
        }
    }

    /// Runs `apply` for each database in turn, stopping at the first failure.
    pub fn apply_all(
        dbs: &[Database],
        directory: &Path,
        filter: Option<&Regex>,
        sink: &dyn EventSink,
    ) -> Result<Vec<ApplyReport>, SqlUpError> {
        let mut reports = Vec::with_capacity(dbs.len());
        for db in dbs {
            sink.emit(
                EventLevel::Info,
                &format!("Running migrations for {}", db.label()),
            );
            reports.push(Self::apply(db, directory, filter, sink)?);
        }
        Ok(reports)
    }

    fn apply_in_transaction(
        conn: &Connection,
        root: &Path,
        discovered: Vec<MigrationFile>,
        sink: &dyn EventSink,
        in_flight: &mut Option<String>,
    ) -> Result<(Option<String>, Vec<String>), SqlUpError> {
        Ledger::ensure_schema(conn)?;

        let watermark = Ledger::watermark(conn)?.map(|row| row.version);
        let pending = Self::pending(discovered, watermark.as_deref());
        let batch = Self::load_batch(root, pending)?;

        let mut applied = Vec::with_capacity(batch.len());
        for migration in batch {
            let version = migration.file.version();
            *in_flight = Some(version.to_owned());

            Ledger::record_start(conn, version)?;
            conn.execute_batch(&migration.sql)
                .map_err(|e| SqlUpError::Query {
                    version: Some(version.to_owned()),
                    source: e,
                })?;
            Ledger::record_end(conn, version)?;

            sink.emit(EventLevel::Success, &format!("Ran migration {}", version));
            applied.push(version.to_owned());
        }

        Ok((watermark, applied))
    }

    /// Migrations strictly after `watermark`, ordered by version.
    ///
    /// Versions compare as strings, so numeric versions must be zero padded:
    /// "10" sorts before "9".
    fn pending(mut discovered: Vec<MigrationFile>, watermark: Option<&str>) -> Vec<MigrationFile> {
        if let Some(watermark) = watermark {
            discovered.retain(|m| m.version() > watermark);
        }
        discovered.sort_by(|a, b| a.version().cmp(b.version()));
        discovered
    }

    fn load_batch(root: &Path, pending: Vec<MigrationFile>) -> Result<Vec<PendingMigration>, SqlUpError> {
        pending
            .into_iter()
            .map(|file| {
                let path = file.absolute_path(root);
                let sql = fs::read_to_string(&path)
                    .map_err(|source| SqlUpError::MigrationRead { path, source })?;
                Ok(PendingMigration { file, sql })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::ledger::LedgerRow;
    use crate::sink::testing::RecordingSink;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        db: Database,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            fs::create_dir(dir.path().join("migrations")).unwrap();
            let db_path = dir.path().join("app.db");
            let db = Database::connect(db_path.to_str().unwrap(), &Config::default().database).unwrap();
            Fixture { dir, db }
        }

        fn migrations(&self) -> std::path::PathBuf {
            self.dir.path().join("migrations")
        }

        fn write(&self, relative: &str, sql: &str) {
            let path = self.migrations().join(relative);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, sql).unwrap();
        }

        fn ledger(&self) -> Vec<LedgerRow> {
            let conn = self.db.conn().unwrap();
            if !Ledger::exists(&conn).unwrap() {
                return Vec::new();
            }
            Ledger::rows(&conn).unwrap()
        }

        fn ledger_versions(&self) -> Vec<String> {
            self.ledger().into_iter().map(|row| row.version).collect()
        }

        fn table_exists(&self, name: &str) -> bool {
            let conn = self.db.conn().unwrap();
            let count: i64 = conn
                .query_row(
                    "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
                    [name],
                    |row| row.get(0),
                )
                .unwrap();
            count > 0
        }

        fn apply(&self, filter: Option<&Regex>, sink: &RecordingSink) -> Result<ApplyReport, SqlUpError> {
            Migrator::apply(&self.db, &self.migrations(), filter, sink)
        }
    }

    const CREATE_USERS: &str = r#"CREATE TABLE "users" ("id" INTEGER, PRIMARY KEY ("id"));"#;
    const RENAME_ID: &str = r#"ALTER TABLE "users" RENAME COLUMN "id" TO "id2";"#;

    #[test]
    fn test_flat_directory_applies_in_order() {
        let fx = Fixture::new();
        fx.write("00002.sql", RENAME_ID);
        fx.write("00001.sql", CREATE_USERS);
        let sink = RecordingSink::new();

        let report = fx.apply(None, &sink).unwrap();

        assert_eq!(report.applied, vec!["00001", "00002"]);
        assert_eq!(report.watermark, None);
        assert_eq!(
            sink.messages_at(EventLevel::Success),
            vec!["Ran migration 00001", "Ran migration 00002"]
        );

        let rows = fx.ledger();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|row| row.ended_at.is_some()));
        assert!(fx.table_exists("users"));
    }

    #[test]
    fn test_second_run_applies_only_new_migrations() {
        let fx = Fixture::new();
        fx.write("00001.sql", CREATE_USERS);
        let sink = RecordingSink::new();
        fx.apply(None, &sink).unwrap();

        fx.write("00002.sql", RENAME_ID);
        let report = fx.apply(None, &sink).unwrap();

        assert_eq!(report.watermark.as_deref(), Some("00001"));
        assert_eq!(report.applied, vec!["00002"]);
        assert_eq!(fx.ledger_versions(), vec!["00001", "00002"]);
    }

    #[test]
    fn test_nested_layout_with_filter() {
        let fx = Fixture::new();
        fx.write("00001/sql/up.sql", CREATE_USERS);
        fx.write("00002/sql/up.sql", RENAME_ID);
        fx.write("00002/notes.txt", "not sql");
        let filter = Regex::new(r"^([0-9]{5})/sql/up\.sql").unwrap();
        let sink = RecordingSink::new();

        let report = fx.apply(Some(&filter), &sink).unwrap();

        assert_eq!(report.applied, vec!["00001", "00002"]);
        assert_eq!(fx.ledger_versions(), vec!["00001", "00002"]);
    }

    #[test]
    fn test_failure_rolls_back_whole_batch() {
        let fx = Fixture::new();
        fx.write("00001.sql", CREATE_USERS);
        fx.write("00002.sql", "ALTER TABLE nope ADD COLUMN x INTEGER;");
        let sink = RecordingSink::new();

        let err = fx.apply(None, &sink).unwrap_err();

        match &err {
            SqlUpError::Query { version, .. } => assert_eq!(version.as_deref(), Some("00002")),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(err.exit_code().code(), 3);
        assert!(fx.ledger_versions().is_empty());
        assert!(!fx.table_exists("users"));

        let errors = sink.messages_at(EventLevel::Error);
        assert_eq!(errors.len(), 2);
        assert_eq!(
            errors[1],
            "Rolled back... An error occurred while running migration 00002"
        );
        // 00001 ran inside the transaction before the failure
        assert_eq!(sink.messages_at(EventLevel::Success), vec!["Ran migration 00001"]);
    }

    #[test]
    fn test_commit_failure_is_reported_as_rollback() {
        let fx = Fixture::new();
        // The deferred foreign key is only checked at COMMIT
        fx.write(
            "00001.sql",
            "CREATE TABLE p (id INTEGER PRIMARY KEY);
            CREATE TABLE c (pid INTEGER REFERENCES p(id) DEFERRABLE INITIALLY DEFERRED);
            INSERT INTO c (pid) VALUES (42);",
        );
        let sink = RecordingSink::new();

        let err = fx.apply(None, &sink).unwrap_err();

        match &err {
            SqlUpError::Query { version, .. } => assert_eq!(version.as_deref(), Some("00001")),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(fx.ledger_versions().is_empty());
        assert!(!fx.table_exists("c"));

        let errors = sink.messages_at(EventLevel::Error);
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("FOREIGN KEY"));
        assert_eq!(
            errors[1],
            "Rolled back... An error occurred while running migration 00001"
        );
    }

    #[test]
    fn test_rerun_is_idempotent() {
        let fx = Fixture::new();
        fx.write("00001.sql", CREATE_USERS);
        fx.write("00002.sql", RENAME_ID);
        let sink = RecordingSink::new();
        fx.apply(None, &sink).unwrap();
        let before = fx.ledger();

        let second = RecordingSink::new();
        let report = fx.apply(None, &second).unwrap();

        assert!(report.applied.is_empty());
        assert!(second.messages_at(EventLevel::Success).is_empty());
        assert_eq!(fx.ledger(), before);
    }

    #[test]
    fn test_empty_directory_succeeds() {
        let fx = Fixture::new();
        let sink = RecordingSink::new();

        let report = fx.apply(None, &sink).unwrap();

        assert!(report.applied.is_empty());
        assert!(sink.events().is_empty());
        // The ledger itself is created even when nothing runs
        let conn = fx.db.conn().unwrap();
        assert!(Ledger::exists(&conn).unwrap());
    }

    #[test]
    fn test_invalid_filter_never_touches_database() {
        let fx = Fixture::new();
        fx.write("00001.sql", CREATE_USERS);
        let sink = RecordingSink::new();

        for pattern in [".*", "(.)(.*)", r"^(\d)(\d)(\d)"] {
            let filter = Regex::new(pattern).unwrap();
            let err = fx.apply(Some(&filter), &sink).unwrap_err();
            assert!(matches!(err, SqlUpError::InvalidFilter(_)), "{}", pattern);
        }

        let conn = fx.db.conn().unwrap();
        assert!(!Ledger::exists(&conn).unwrap());
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_missing_directory_never_touches_database() {
        let fx = Fixture::new();
        let sink = RecordingSink::new();

        let err = Migrator::apply(&fx.db, &fx.dir.path().join("nope"), None, &sink).unwrap_err();

        assert!(matches!(err, SqlUpError::DirectoryNotFound(_)));
        let conn = fx.db.conn().unwrap();
        assert!(!Ledger::exists(&conn).unwrap());
    }

    #[test]
    fn test_duplicate_versions_roll_back() {
        let fx = Fixture::new();
        fx.write("00001.sql", CREATE_USERS);
        fx.write("00001.txt", "SELECT 1;");
        let sink = RecordingSink::new();

        let err = fx.apply(None, &sink).unwrap_err();

        assert!(matches!(err, SqlUpError::DuplicateVersion { .. }));
        assert!(err.is_soft());
        assert!(fx.ledger_versions().is_empty());
        assert!(!fx.table_exists("users"));
    }

    #[test]
    fn test_interrupted_row_blocks_rerun() {
        let fx = Fixture::new();
        fx.write("00001.sql", CREATE_USERS);
        {
            let conn = fx.db.conn().unwrap();
            Ledger::ensure_schema(&conn).unwrap();
            Ledger::record_start(&conn, "00001").unwrap();
        }
        let sink = RecordingSink::new();

        // An unfinished row never becomes the watermark, so 00001 is pending again
        let err = fx.apply(None, &sink).unwrap_err();
        assert!(matches!(err, SqlUpError::DuplicateVersion { .. }));
    }

    #[test]
    fn test_multiple_statements_in_one_file() {
        let fx = Fixture::new();
        fx.write(
            "00001.sql",
            "CREATE TABLE a (id INTEGER);\nCREATE TABLE b (id INTEGER);\nINSERT INTO a VALUES (1);",
        );
        let sink = RecordingSink::new();

        fx.apply(None, &sink).unwrap();

        assert!(fx.table_exists("a"));
        assert!(fx.table_exists("b"));
    }

    #[test]
    fn test_watermark_recency_policy() {
        let fx = Fixture::new();
        {
            let conn = fx.db.conn().unwrap();
            Ledger::ensure_schema(&conn).unwrap();
            conn.execute_batch(
                "INSERT INTO migrations VALUES ('00003', '2024-01-01T00:00:00.000000Z', '2024-01-01T00:00:01.000000Z');
                 INSERT INTO migrations VALUES ('00001', '2024-01-01T00:00:00.000000Z', '2024-01-01T00:00:09.000000Z');",
            )
            .unwrap();
        }
        // 00002 sorts after the most recently completed row, 00001
        fx.write("00002.sql", "SELECT 1;");
        let sink = RecordingSink::new();

        let report = fx.apply(None, &sink).unwrap();

        assert_eq!(report.watermark.as_deref(), Some("00001"));
        assert_eq!(report.applied, vec!["00002"]);
    }

    #[test]
    fn test_apply_all_runs_each_database() {
        let fx = Fixture::new();
        fx.write("00001.sql", CREATE_USERS);
        let other = Database::connect(
            fx.dir.path().join("other.db").to_str().unwrap(),
            &Config::default().database,
        )
        .unwrap();
        let sink = RecordingSink::new();

        let reports =
            Migrator::apply_all(&[fx.db.clone(), other], &fx.migrations(), None, &sink).unwrap();

        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.applied == vec!["00001"]));
        assert_eq!(sink.messages_at(EventLevel::Info).len(), 2);
    }

    #[test]
    fn test_pending_is_lexicographic() {
        let files = vec![
            MigrationFile::new("9.sql", "9"),
            MigrationFile::new("10.sql", "10"),
            MigrationFile::new("00010.sql", "00010"),
            MigrationFile::new("00002.sql", "00002"),
        ];

        let order: Vec<String> = Migrator::pending(files, None)
            .into_iter()
            .map(|m| m.version().to_owned())
            .collect();

        assert_eq!(order, vec!["00002", "00010", "10", "9"]);
        assert!("00010" > "00002");
        assert!(!("9" < "10"));
    }

    #[test]
    fn test_pending_excludes_watermark_and_below() {
        let files = vec![
            MigrationFile::new("00001.sql", "00001"),
            MigrationFile::new("00002.sql", "00002"),
            MigrationFile::new("00003.sql", "00003"),
        ];

        let order: Vec<String> = Migrator::pending(files, Some("00002"))
            .into_iter()
            .map(|m| m.version().to_owned())
            .collect();

        assert_eq!(order, vec!["00003"]);
    }

    proptest! {
        #[test]
        fn prop_zero_padded_versions_sort_numerically(a in 0u32..100_000, b in 0u32..100_000) {
            let files = vec![
                MigrationFile::new("a.sql", format!("{:05}", a)),
                MigrationFile::new("b.sql", format!("{:05}", b)),
            ];
            let sorted = Migrator::pending(files, None);
            let first: u32 = sorted[0].version().parse().unwrap();
            let second: u32 = sorted[1].version().parse().unwrap();
            prop_assert!(first <= second);
        }
    }
}
