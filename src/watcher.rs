use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, error, info};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use notify_debouncer_mini::{new_debouncer_opt, Config as DebouncerConfig, DebounceEventResult};
use regex::Regex;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};

use crate::config::WatchConfig;
use crate::database::Database;
use crate::discovery::Discovery;
use crate::error::SqlUpError;
use crate::migrator::{ApplyReport, Migrator};
use crate::sink::{EventLevel, EventSink};

type RunResult = Result<ApplyReport, SqlUpError>;

/// Re-runs the migrator whenever a migration file is added or changed.
pub struct MigrationWatcher;

impl MigrationWatcher {
    /// Watches `directory` until `shutdown` resolves.
    ///
    /// Every qualifying event starts one independent run per database. A
    /// failed run is reported and watching continues. Runs still in flight
    /// when `shutdown` resolves are allowed to finish.
    pub async fn run<F>(
        directory: &Path,
        filter: Option<&Regex>,
        dbs: &[Database],
        sink: Arc<dyn EventSink>,
        config: &WatchConfig,
        shutdown: F,
    ) -> Result<(), SqlUpError>
    where
        F: Future<Output = ()>,
    {
        // Canonical so event paths can be made relative on every platform
        let root = dunce::canonicalize(Discovery::resolve_root(directory)?)?;

        let (tx, mut rx) = mpsc::unbounded_channel::<DebounceEventResult>();
        let debouncer_config = DebouncerConfig::default()
            .with_timeout(config.quiescence())
            .with_notify_config(notify::Config::default().with_poll_interval(config.poll_interval()));
        let mut debouncer = new_debouncer_opt::<_, RecommendedWatcher>(
            debouncer_config,
            move |result: DebounceEventResult| {
                // The receiver only goes away once the loop below has ended
                let _ = tx.send(result);
            },
        )?;
        debouncer.watcher().watch(&root, RecursiveMode::Recursive)?;

        sink.emit(
            EventLevel::Info,
            &format!("Watching {} for new migrations", root.display()),
        );

        let mut runs: JoinSet<RunResult> = JoinSet::new();
        tokio::pin!(shutdown);

        let result = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Stopping watch on {}", root.display());
                    break Ok(());
                }
                received = rx.recv() => match received {
                    Some(Ok(events)) => {
                        for event in events {
                            if !Self::qualifies(&root, &event.path, filter) {
                                continue;
                            }
                            debug!("Change detected: {}", event.path.display());
                            for db in dbs {
                                Self::spawn_run(&mut runs, db, &root, filter, &sink);
                            }
                        }
                    }
                    Some(Err(e)) => {
                        sink.emit(EventLevel::Error, &format!("Watch error: {:?}", e));
                    }
                    None => {
                        break Err(SqlUpError::Error("File watcher stopped unexpectedly".into()));
                    }
                },
                Some(joined) = runs.join_next(), if !runs.is_empty() => {
                    Self::report(joined, sink.as_ref());
                }
            }
        };

        drop(debouncer);
        while let Some(joined) = runs.join_next().await {
            Self::report(joined, sink.as_ref());
        }

        result
    }

    /// An event counts if its path is now a regular file (so it was added or
    /// changed, not removed) and, with a filter, its relative path matches.
    pub fn qualifies(root: &Path, path: &Path, filter: Option<&Regex>) -> bool {
        let is_file = fs::symlink_metadata(path)
            .map(|metadata| metadata.is_file())
            .unwrap_or(false);
        if !is_file {
            return false;
        }

        match (Discovery::relative_path(root, path), filter) {
            (Some(relative_path), Some(filter)) => filter.is_match(&relative_path),
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    fn spawn_run(
        runs: &mut JoinSet<RunResult>,
        db: &Database,
        root: &Path,
        filter: Option<&Regex>,
        sink: &Arc<dyn EventSink>,
    ) {
        let db = db.clone();
        let root: PathBuf = root.to_owned();
        let filter = filter.cloned();
        let sink = Arc::clone(sink);

        runs.spawn_blocking(move || Migrator::apply(&db, &root, filter.as_ref(), sink.as_ref()));
    }

    fn report(joined: Result<RunResult, JoinError>, sink: &dyn EventSink) {
        match joined {
            Ok(Ok(report)) => {
                if report.applied.is_empty() {
                    debug!("No pending migrations for {}", report.database);
                } else {
                    sink.emit(
                        EventLevel::Info,
                        &format!(
                            "Applied {} migration(s) to {}",
                            report.applied.len(),
                            report.database
                        ),
                    );
                }
            }
            Ok(Err(e)) if e.is_soft() => {
                sink.emit(
                    EventLevel::Warning,
                    &format!("Version conflict: {} - batch rolled back, still watching", e),
                );
            }
            Ok(Err(e)) => {
                sink.emit(
                    EventLevel::Error,
                    &format!("Migration run failed: {} - still watching", e),
                );
            }
            Err(e) => {
                error!("Migration task did not complete: {}", e);
            }
        }
    }
}
