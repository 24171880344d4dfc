use std::fmt;

use log::{error, info, warn};

use crate::error::SqlUpError;

/// Severity of a user-facing migration event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventLevel {
    Info,
    Warning,
    Error,
    Success,
}

impl EventLevel {
    pub const ALL: [EventLevel; 4] = [
        EventLevel::Info,
        EventLevel::Warning,
        EventLevel::Error,
        EventLevel::Success,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventLevel::Info => "info",
            EventLevel::Warning => "warning",
            EventLevel::Error => "error",
            EventLevel::Success => "success",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|level| level.as_str() == name)
    }
}

impl fmt::Display for EventLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Destination for the events the migrator and watcher produce.
///
/// A sink only reports. Deciding whether an outcome ends the process is the
/// caller's business, based on the `Result` it got back.
pub trait EventSink: Send + Sync {
    fn emit(&self, level: EventLevel, message: &str);
}

/// The set of event levels a user asked to see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLevels(Vec<EventLevel>);

impl LogLevels {
    pub fn all() -> Self {
        LogLevels(EventLevel::ALL.to_vec())
    }

    pub fn none() -> Self {
        LogLevels(Vec::new())
    }

    /// Parses a comma separated list such as `"info, success"`.
    ///
    /// `all` and `none` may appear anywhere in the list; `none` wins over
    /// everything else and `all` wins over individual names. An empty list
    /// means all levels.
    pub fn parse(spec: &str) -> Result<Self, SqlUpError> {
        let names: Vec<String> = spec
            .split(',')
            .map(|name| name.trim().to_ascii_lowercase())
            .filter(|name| !name.is_empty())
            .collect();

        if names.is_empty() {
            return Ok(Self::all());
        }
        if names.iter().any(|name| name == "none") {
            return Ok(Self::none());
        }
        if names.iter().any(|name| name == "all") {
            return Ok(Self::all());
        }

        let mut levels = Vec::new();
        for name in &names {
            let level = EventLevel::from_name(name).ok_or_else(|| {
                SqlUpError::Config(format!(
                    "unknown log level '{}' (expected info, warning, error, success, all or none)",
                    name
                ))
            })?;
            if !levels.contains(&level) {
                levels.push(level);
            }
        }

        Ok(LogLevels(levels))
    }

    pub fn contains(&self, level: EventLevel) -> bool {
        self.0.contains(&level)
    }
}

impl Default for LogLevels {
    fn default() -> Self {
        Self::all()
    }
}

/// Sink that forwards selected events to the `log` facade, where the
/// configured logger takes care of colour and formatting.
pub struct ConsoleSink {
    levels: LogLevels,
}

impl ConsoleSink {
    pub fn new(levels: LogLevels) -> Self {
        ConsoleSink { levels }
    }
}

impl EventSink for ConsoleSink {
    fn emit(&self, level: EventLevel, message: &str) {
        if !self.levels.contains(level) {
            return;
        }

        match level {
            EventLevel::Info => info!(target: "sqlup", "{}", message),
            EventLevel::Success => info!(target: "sqlup", "✔ {}", message),
            EventLevel::Warning => warn!(target: "sqlup", "{}", message),
            EventLevel::Error => error!(target: "sqlup", "{}", message),
        }
    }
}
