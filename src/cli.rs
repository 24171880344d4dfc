use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use flexi_logger::LoggerHandle;
use log::{debug, error, info};

use crate::config::Config;
use crate::database::Connections;
use crate::discovery::{Discovery, MigrationFilter};
use crate::error::SqlUpError;
use crate::migrator::Migrator;
use crate::sink::{ConsoleSink, EventLevel, EventSink, LogLevels};
use crate::watcher::MigrationWatcher;

#[derive(Parser)]
#[command(
    name = "sqlup",
    version,
    about = "sqlup: apply SQL migrations to a database exactly once"
)]
pub struct Cli {
    /// Configuration file (default: ./sqlup.toml, then the user config directory)
    #[arg(long = "config", global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Apply all new migrations in <DIR> to each database in <CREDENTIALS>
    ///
    /// Each credential is either a connection string (a database path,
    /// sqlite://path, file: URI or :memory:) or a JSON file whose DB_NAME key
    /// names the database.
    Up {
        /// Directory holding the migration files
        dir: PathBuf,

        /// Connection strings or JSON credentials files
        #[arg(required = true, num_args = 1..)]
        credentials: Vec<String>,

        /// Keep running and apply migrations whenever files in <DIR> change
        #[arg(long = "watch", short = 'w', default_value_t = false)]
        watch: bool,

        /// Only include files whose path below <DIR> matches this regex; its single capture group is the version
        #[arg(long = "filter", short = 'f', value_name = "REGEX_PATTERN")]
        filter: Option<String>,

        /// Comma separated event levels to display: info, warning, error, success, all or none (default: all)
        #[arg(long = "log-levels", short = 'l', alias = "logLevels")]
        log_levels: Option<String>,
    },

    /// Empty all tables except for the migrations table
    #[command(name = "truncate-all", alias = "truncateAll")]
    TruncateAll {
        /// Connection string or JSON credentials file
        credentials: String,

        /// Comma separated event levels to display: info, warning, error, success, all or none (default: all)
        #[arg(long = "log-levels", short = 'l', alias = "logLevels")]
        log_levels: Option<String>,
    },
}

impl Cli {
    pub fn handle_command_line(logger: Option<&LoggerHandle>) -> Result<(), SqlUpError> {
        let args = Cli::parse();

        let config = Config::load(args.config.as_deref())?;
        if let Some(logger) = logger {
            Self::apply_log_spec(logger, &config);
        }
        debug!("Configuration: {:?}", config);

        match args.command {
            Command::Up {
                dir,
                credentials,
                watch,
                filter,
                log_levels,
            } => Self::up(
                &dir,
                &credentials,
                watch,
                filter.as_deref(),
                log_levels.as_deref(),
                &config,
            ),
            Command::TruncateAll {
                credentials,
                log_levels,
            } => Self::truncate_all(&credentials, log_levels.as_deref(), &config),
        }
    }

    /// `RUST_LOG` wins over the configured level.
    fn apply_log_spec(logger: &LoggerHandle, config: &Config) {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        if let Err(e) = logger.parse_new_spec(&config.logging.level) {
            eprintln!(
                "Config error: log level '{}' could not be applied: {}",
                config.logging.level, e
            );
        }
    }

    fn event_sink(log_levels: Option<&str>, config: &Config) -> Result<Arc<dyn EventSink>, SqlUpError> {
        let levels = LogLevels::parse(log_levels.unwrap_or(&config.logging.events))?;
        Ok(Arc::new(ConsoleSink::new(levels)))
    }

    fn up(
        dir: &Path,
        credentials: &[String],
        watch: bool,
        filter: Option<&str>,
        log_levels: Option<&str>,
        config: &Config,
    ) -> Result<(), SqlUpError> {
        let sink = Self::event_sink(log_levels, config)?;
        let filter = filter.map(MigrationFilter::parse).transpose()?;
        let regex = filter.as_ref().map(MigrationFilter::regex);
        let dir = Discovery::resolve_root(dir)?;

        let connections = Connections::open(credentials, &config.database)?;

        if !watch {
            Migrator::apply_all(connections.databases(), &dir, regex, sink.as_ref())?;
            sink.emit(EventLevel::Success, "All migrations ran successfully!");
            return Ok(());
        }

        for db in connections.databases() {
            sink.emit(
                EventLevel::Info,
                &format!("Running migrations for {}", db.label()),
            );
            match Migrator::apply(db, &dir, regex, sink.as_ref()) {
                Ok(_) => {}
                // The migration set itself is unusable; watching it would not help
                Err(
                    e @ (SqlUpError::DirectoryNotFound(_)
                    | SqlUpError::NotADirectory(_)
                    | SqlUpError::InvalidFilter(_)),
                ) => return Err(e),
                Err(e) => {
                    info!("Initial run for {} failed ({}); watching anyway", db.label(), e);
                }
            }
        }

        let rt = tokio::runtime::Runtime::new()
            .map_err(|e| SqlUpError::Error(format!("Failed to create runtime: {}", e)))?;

        rt.block_on(MigrationWatcher::run(
            &dir,
            regex,
            connections.databases(),
            Arc::clone(&sink),
            &config.watch,
            shutdown_signal(),
        ))
    }

    fn truncate_all(credentials: &str, log_levels: Option<&str>, config: &Config) -> Result<(), SqlUpError> {
        let sink = Self::event_sink(log_levels, config)?;
        let connections = Connections::open(&[credentials.to_owned()], &config.database)?;

        for db in connections.databases() {
            let count = db.truncate_all()?;
            debug!("Truncated {} table(s) in {}", count, db.label());
        }

        sink.emit(EventLevel::Success, "All tables (except migrations) truncated.");
        Ok(())
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => {
            error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_cli_parsing_up_with_options() {
        let cli = Cli::try_parse_from([
            "sqlup",
            "up",
            "migrations",
            "app.db",
            "other.json",
            "--watch",
            "--filter",
            r"^(\d{5})/up\.sql",
            "-l",
            "error,success",
        ])
        .unwrap();

        match cli.command {
            Command::Up {
                dir,
                credentials,
                watch,
                filter,
                log_levels,
            } => {
                assert_eq!(dir, PathBuf::from("migrations"));
                assert_eq!(credentials, vec!["app.db", "other.json"]);
                assert!(watch);
                assert_eq!(filter.as_deref(), Some(r"^(\d{5})/up\.sql"));
                assert_eq!(log_levels.as_deref(), Some("error,success"));
            }
            _ => panic!("expected up"),
        }
    }

    #[test]
    fn test_cli_parsing_up_requires_credentials() {
        assert!(Cli::try_parse_from(["sqlup", "up", "migrations"]).is_err());
    }

    #[test]
    fn test_cli_parsing_up_defaults() {
        let cli = Cli::try_parse_from(["sqlup", "up", "migrations", "app.db"]).unwrap();
        match cli.command {
            Command::Up {
                watch,
                filter,
                log_levels,
                ..
            } => {
                assert!(!watch);
                assert!(filter.is_none());
                assert!(log_levels.is_none());
            }
            _ => panic!("expected up"),
        }
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_cli_parsing_truncate_all_alias() {
        for name in ["truncate-all", "truncateAll"] {
            let cli = Cli::try_parse_from(["sqlup", name, "app.db", "--config", "custom.toml"]).unwrap();
            assert!(matches!(cli.command, Command::TruncateAll { .. }));
            assert_eq!(cli.config, Some(PathBuf::from("custom.toml")));
        }
    }

    #[test]
    fn test_cli_parsing_invalid_arguments() {
        assert!(Cli::try_parse_from(["sqlup"]).is_err());
        assert!(Cli::try_parse_from(["sqlup", "down", "migrations", "app.db"]).is_err());
        assert!(Cli::try_parse_from(["sqlup", "up", "migrations", "app.db", "--bogus"]).is_err());
    }

    #[test]
    fn test_event_sink_rejects_bad_levels() {
        let config = Config::default();
        assert!(Cli::event_sink(Some("loud"), &config).is_err());
        assert!(Cli::event_sink(None, &config).is_ok());
    }
}
