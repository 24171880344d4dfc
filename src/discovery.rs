use std::collections::VecDeque;
use std::env;
use std::fs;
use std::path::{Component, Path, PathBuf};

use log::{debug, trace};
use regex::Regex;

use crate::error::SqlUpError;

/// A candidate migration found on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MigrationFile {
    relative_path: String,
    version: String,
}

impl MigrationFile {
    pub fn new(relative_path: impl Into<String>, version: impl Into<String>) -> Self {
        MigrationFile {
            relative_path: relative_path.into(),
            version: version.into(),
        }
    }

    /// Path relative to the migration root, always `/` separated.
    pub fn relative_path(&self) -> &str {
        &self.relative_path
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn absolute_path(&self, root: &Path) -> PathBuf {
        root.join(&self.relative_path)
    }
}

/// A user supplied filter, checked once at the configuration boundary.
#[derive(Clone, Debug)]
pub struct MigrationFilter(Regex);

impl MigrationFilter {
    pub fn parse(pattern: &str) -> Result<Self, SqlUpError> {
        let regex = Regex::new(pattern)
            .map_err(|e| SqlUpError::InvalidFilter(format!("'{}' is not a valid regex: {}", pattern, e)))?;
        Discovery::check_filter(&regex)?;
        Ok(MigrationFilter(regex))
    }

    pub fn regex(&self) -> &Regex {
        &self.0
    }
}

pub struct Discovery;

impl Discovery {
    /// Walks `root` and returns every migration candidate, in no particular order.
    pub fn discover(root: &Path, filter: Option<&Regex>) -> Result<Vec<MigrationFile>, SqlUpError> {
        if let Some(filter) = filter {
            Self::check_filter(filter)?;
        }

        let root = Self::resolve_root(root)?;
        let mut migrations = Vec::new();
        let mut q = VecDeque::new();
        q.push_back(root.clone());

        while let Some(dir) = q.pop_front() {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                // Use symlink_metadata so links are neither followed nor listed
                let metadata = fs::symlink_metadata(&path)?;

                if metadata.is_dir() {
                    q.push_back(path);
                    continue;
                }
                if !metadata.is_file() {
                    trace!("Skipping non-regular file {}", path.display());
                    continue;
                }

                let relative_path = match Self::relative_path(&root, &path) {
                    Some(relative_path) => relative_path,
                    None => continue,
                };

                if let Some(migration) = Self::classify(&relative_path, filter) {
                    migrations.push(migration);
                }
            }
        }

        debug!(
            "Discovered {} migration file(s) under {}",
            migrations.len(),
            root.display()
        );

        Ok(migrations)
    }

    /// A filter must carry exactly one capture group; group 0 is the whole match.
    pub fn check_filter(filter: &Regex) -> Result<(), SqlUpError> {
        let groups = filter.captures_len() - 1;
        if groups != 1 {
            return Err(SqlUpError::InvalidFilter(format!(
                "Filter regex must have exactly one capture group (found {})",
                groups
            )));
        }
        Ok(())
    }

    /// Resolves a possibly relative root against the working directory.
    pub fn resolve_root(root: &Path) -> Result<PathBuf, SqlUpError> {
        let absolute_path = if root.is_absolute() {
            root.to_owned()
        } else {
            env::current_dir()?.join(root)
        };

        if !absolute_path.exists() {
            return Err(SqlUpError::DirectoryNotFound(absolute_path));
        }
        if !absolute_path.is_dir() {
            return Err(SqlUpError::NotADirectory(absolute_path));
        }

        Ok(absolute_path)
    }

    /// `/` separated path of `path` below `root`, or `None` if it is not below it.
    pub fn relative_path(root: &Path, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(root).ok()?;
        let parts: Vec<String> = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();

        if parts.is_empty() {
            None
        } else {
            Some(parts.join("/"))
        }
    }

    /// Derives the version of a file, or `None` if the filter excludes it.
    pub fn classify(relative_path: &str, filter: Option<&Regex>) -> Option<MigrationFile> {
        match filter {
            None => {
                let version = Path::new(relative_path).with_extension("");
                let version = version.to_string_lossy().replace('\\', "/");
                Some(MigrationFile::new(relative_path, version))
            }
            Some(filter) => {
                let captures = filter.captures(relative_path)?;
                match captures.get(1) {
                    Some(version) => Some(MigrationFile::new(relative_path, version.as_str())),
                    None => {
                        debug!(
                            "Filter matched {} but its capture group did not participate - skipping",
                            relative_path
                        );
                        None
                    }
                }
            }
        }
    }
}
