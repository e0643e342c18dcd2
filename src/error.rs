//! Error types for running test cases.

use std::path::PathBuf;
use std::time::Duration;

/// Broad category of a harness error, used in reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Malformed recipe fields or unreadable reference files.
    Config,
    /// Missing resources or an unusable working directory.
    Resource,
    /// The program could not be run to completion.
    Execution,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Config => f.write_str("config error"),
            ErrorKind::Resource => f.write_str("resource error"),
            ErrorKind::Execution => f.write_str("execution error"),
        }
    }
}

/// An error that stops a single test case from being evaluated normally.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A file referenced for expected content could not be read.
    #[error("failed to read reference file {}: {source}", path.display())]
    ReferenceFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The recipe is inconsistent in a way the parser cannot catch.
    #[error("invalid recipe: {0}")]
    InvalidRecipe(String),

    /// A `${VAR}` reference could not be resolved.
    #[error("{0}")]
    Interpolation(String),

    /// A declared resource does not exist.
    #[error("resource not found: {}", path.display())]
    MissingResource { path: PathBuf },

    /// A resource exists but could not be copied.
    #[error("failed to copy resource {} to {}: {source}", src.display(), dst.display())]
    CopyResource {
        src: PathBuf,
        dst: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The working directory could not be prepared.
    #[error("failed to prepare working directory {}: {source}", path.display())]
    WorkDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The executable could not be started.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The program ran longer than its timeout and was killed.
    #[error("timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),

    /// The run was interrupted and the program was killed.
    #[error("cancelled")]
    Cancelled,

    /// Waiting on or talking to the child process failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ReferenceFile { .. } | Error::InvalidRecipe(_) | Error::Interpolation(_) => {
                ErrorKind::Config
            }
            Error::MissingResource { .. } | Error::CopyResource { .. } | Error::WorkDir { .. } => {
                ErrorKind::Resource
            }
            Error::Spawn { .. } | Error::Timeout(_) | Error::Cancelled | Error::Io(_) => {
                ErrorKind::Execution
            }
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
