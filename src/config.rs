use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::SqlUpError;
use crate::sink::LogLevels;

const CONFIG_FILE_NAME: &str = "sqlup.toml";
const ENV_PREFIX: &str = "SQLUP_";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LoggingConfig {
    /// flexi_logger spec for diagnostic output, e.g. "info" or "sqlup=debug".
    pub level: String,
    /// Console event levels: a comma separated list, "all" or "none".
    pub events: String,
}

impl LoggingConfig {
    const LOG_LEVELS: [&str; 6] = ["off", "error", "warn", "info", "debug", "trace"];
    const DEFAULT_LEVEL: &str = "info";
    const DEFAULT_EVENTS: &str = "all";

    fn default() -> Self {
        LoggingConfig {
            level: Self::DEFAULT_LEVEL.to_owned(),
            events: Self::DEFAULT_EVENTS.to_owned(),
        }
    }

    fn ensure_valid(&mut self) {
        // A bare level is checked here. Module specs ("sqlup=debug") are
        // passed through and validated by flexi_logger itself.
        let str_original = self.level.clone();
        self.level = self.level.trim().to_ascii_lowercase();
        if !self.level.contains('=') && !Self::LOG_LEVELS.contains(&self.level.as_str()) {
            eprintln!(
                "Config error: log level of '{}' is invalid - using default of '{}'",
                str_original,
                Self::DEFAULT_LEVEL
            );
            self.level = Self::DEFAULT_LEVEL.to_owned();
        }

        if let Err(e) = LogLevels::parse(&self.events) {
            eprintln!(
                "Config error: {} - using default of '{}'",
                e,
                Self::DEFAULT_EVENTS
            );
            self.events = Self::DEFAULT_EVENTS.to_owned();
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WatchConfig {
    quiescence_ms: u64,
    poll_interval_ms: u64,
}

impl WatchConfig {
    const QUIESCENCE_MS: u64 = 2000;
    const POLL_INTERVAL_MS: u64 = 100;

    pub fn new(quiescence: Duration, poll_interval: Duration) -> Self {
        WatchConfig {
            quiescence_ms: quiescence.as_millis() as u64,
            poll_interval_ms: poll_interval.as_millis() as u64,
        }
    }

    /// How long a file must go without further writes before it is treated as ready.
    pub fn quiescence(&self) -> Duration {
        Duration::from_millis(self.quiescence_ms)
    }

    /// Scan interval of notify's polling backend. Native backends (inotify,
    /// FSEvents, ReadDirectoryChangesW) are event driven and ignore it.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    fn default() -> Self {
        WatchConfig {
            quiescence_ms: Self::QUIESCENCE_MS,
            poll_interval_ms: Self::POLL_INTERVAL_MS,
        }
    }

    fn ensure_valid(&mut self) {
        if self.quiescence_ms == 0 {
            eprintln!(
                "Config error: watch quiescence of 0ms is invalid - using default of {}ms",
                Self::QUIESCENCE_MS
            );
            self.quiescence_ms = Self::QUIESCENCE_MS;
        }
        if self.poll_interval_ms == 0 {
            eprintln!(
                "Config error: watch poll interval of 0ms is invalid - using default of {}ms",
                Self::POLL_INTERVAL_MS
            );
            self.poll_interval_ms = Self::POLL_INTERVAL_MS;
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DatabaseConfig {
    busy_timeout_ms: u64,
    max_pool_size: u32,
}

impl DatabaseConfig {
    const BUSY_TIMEOUT_MS: u64 = 5000;
    const MAX_POOL_SIZE: u32 = 4;

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn max_pool_size(&self) -> u32 {
        self.max_pool_size
    }

    fn default() -> Self {
        DatabaseConfig {
            busy_timeout_ms: Self::BUSY_TIMEOUT_MS,
            max_pool_size: Self::MAX_POOL_SIZE,
        }
    }

    fn ensure_valid(&mut self) {
        if self.busy_timeout_ms == 0 {
            eprintln!(
                "Config error: busy_timeout_ms of 0 is invalid - using default of {}",
                Self::BUSY_TIMEOUT_MS
            );
            self.busy_timeout_ms = Self::BUSY_TIMEOUT_MS;
        }
        if self.max_pool_size == 0 {
            eprintln!(
                "Config error: max_pool_size of 0 is invalid - using default of {}",
                Self::MAX_POOL_SIZE
            );
            self.max_pool_size = Self::MAX_POOL_SIZE;
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    pub logging: LoggingConfig,
    pub watch: WatchConfig,
    pub database: DatabaseConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            logging: LoggingConfig::default(),
            watch: WatchConfig::default(),
            database: DatabaseConfig::default(),
        }
    }
}

impl Config {
    /// Loads the configuration by layering, lowest priority first:
    /// built-in defaults, the TOML config file (if any), then `SQLUP_`
    /// environment variables (`SQLUP_WATCH__QUIESCENCE_MS=500`).
    ///
    /// An explicitly requested config file must exist. Values that parse but
    /// make no sense are replaced by their defaults with a message.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self, SqlUpError> {
        if let Some(path) = explicit_path {
            if !path.is_file() {
                return Err(SqlUpError::Config(format!(
                    "config file '{}' does not exist",
                    path.display()
                )));
            }
        }

        let config_path = explicit_path
            .map(Path::to_path_buf)
            .or_else(Self::discover_config_file);

        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = &config_path {
            log::debug!("Loading configuration from {}", path.display());
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut config: Config = figment.extract()?;
        config.ensure_valid();

        Ok(config)
    }

    /// `./sqlup.toml` first, then the per-user config directory.
    fn discover_config_file() -> Option<PathBuf> {
        let local = PathBuf::from(CONFIG_FILE_NAME);
        if local.is_file() {
            return Some(local);
        }

        ProjectDirs::from("", "", "sqlup")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .filter(|path| path.is_file())
    }

    fn ensure_valid(&mut self) {
        self.logging.ensure_valid();
        self.watch.ensure_valid();
        self.database.ensure_valid();
    }
}
