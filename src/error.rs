//! Error types for ftl

use std::fmt;
use std::path::{Path, PathBuf};

/// Result type for ftl operations
pub type Result<T> = std::result::Result<T, Error>;

/// A position inside a manifest file, 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub line: usize,
    pub column: usize,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

impl From<serde_yaml::Location> for Location {
    fn from(loc: serde_yaml::Location) -> Self {
        Self {
            line: loc.line(),
            column: loc.column(),
        }
    }
}

fn at(path: &Path, location: &Option<Location>) -> String {
    match location {
        Some(loc) => format!("{}:{loc}", path.display()),
        None => path.display().to_string(),
    }
}

/// Errors that can occur in ftl operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // Registry errors
    #[error("chart {id} is already registered at {}", path.display())]
    DuplicateChart { id: String, path: PathBuf },

    #[error("{} does not appear to be a valid FTL project: {reason}", path.display())]
    InvalidChart { path: PathBuf, reason: String },

    #[error("unknown chart: {0}")]
    UnknownChart(String),

    #[error("chart registry at {} is corrupt: {message}", path.display())]
    RegistryCorrupt { path: PathBuf, message: String },

    #[error("could not lock chart registry at {}: {source}", path.display())]
    LockFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Configuration errors
    #[error("syntax error in {}: {message}", at(path, location))]
    ManifestSyntax {
        path: PathBuf,
        location: Option<Location>,
        message: String,
    },

    #[error("invalid manifest {}: {message}", at(path, location))]
    ManifestSchema {
        path: PathBuf,
        location: Option<Location>,
        message: String,
    },

    #[error("profile {name} is defined more than once (again in {})", path.display())]
    DuplicateProfile { path: PathBuf, name: String },

    #[error("cyclic profile dependency: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("profile {profile} depends on unknown profile {dependency}")]
    UnknownProfileDependency { profile: String, dependency: String },

    #[error("chart {chart} has no profile named {name}")]
    UnknownProfile { chart: String, name: String },

    #[error("no profile selected for chart {chart}; run `ftl profile <name>` first")]
    NoActiveProfile { chart: String },

    #[error("no service named {name} in profile {profile} or its dependencies")]
    UnknownService { profile: String, name: String },

    // Engine errors
    #[error("container engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("profile {profile} did not come up: {summary}")]
    PlanFailed { profile: String, summary: String },

    #[error("{failed} service(s) could not be stopped: {summary}")]
    StopFailed { failed: usize, summary: String },

    #[error("environment is running but attaching to {service} failed: {message}")]
    AttachFailed { service: String, message: String },

    #[error("{service} is not running; run `ftl jump` first")]
    NotRunning { service: String },

    #[error("{service} has no container; run `ftl jump` first")]
    NoContainer { service: String },

    #[error("reading logs of {service} failed: {message}")]
    LogsFailed { service: String, message: String },

    #[error("{failed} leftover container(s) could not be removed: {summary}")]
    CleanupFailed { failed: usize, summary: String },

    #[error("interrupted; re-run `ftl jump` to resume")]
    Interrupted,

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn schema(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::ManifestSchema {
            path: path.into(),
            location: None,
            message: message.into(),
        }
    }

    /// True for errors caused by the user's manifest rather than the host.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::ManifestSyntax { .. }
                | Error::ManifestSchema { .. }
                | Error::DuplicateProfile { .. }
                | Error::CyclicDependency { .. }
                | Error::UnknownProfileDependency { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syntax_error_names_file_and_position() {
        let err = Error::ManifestSyntax {
            path: PathBuf::from("/proj/ftl.yaml"),
            location: Some(Location { line: 3, column: 7 }),
            message: "mapping values are not allowed here".into(),
        };
        assert_eq!(
            err.to_string(),
            "syntax error in /proj/ftl.yaml:3:7: mapping values are not allowed here"
        );
        assert!(err.is_configuration());
    }

    #[test]
    fn cycle_message_lists_path() {
        let err = Error::CyclicDependency {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "cyclic profile dependency: a -> b -> a");
    }
}
