use std::path::PathBuf;

use thiserror::Error;

/// Every failure mode the run can hit. The retry classifier matches on these
/// variants, so expected failures (missing netrc entry, conflicting repo)
/// must be variants here rather than opaque strings.
#[derive(Error, Debug)]
pub enum CloneError {
    #[error("failed to discover projects on {host}: {message}")]
    Discovery { host: String, message: String },

    #[error("authentication failed for {host}: {message}")]
    Auth { host: String, message: String },

    #[error("conflicting repository at {path}: {message}")]
    Conflict { path: PathBuf, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("operation timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("operation cancelled before completion")]
    Cancelled,

    #[error("filesystem error at {path}: {source}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("git error: {0}")]
    Git(String),
}

impl CloneError {
    pub fn network(err: impl std::fmt::Display) -> Self {
        CloneError::Network(err.to_string())
    }

    pub fn filesystem(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CloneError::Filesystem {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, CloneError>;
