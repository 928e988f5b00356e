use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type Result<T, E = StatuslineError> = std::result::Result<T, E>;

/// Failures of the individual signal sources.
///
/// None of these abort a status line render; the aggregator logs them and
/// falls back to the neutral value for the affected segment.
#[derive(Debug, Error)]
pub enum StatuslineError {
    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JSON in {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("session id {0:?} cannot be used as a file name")]
    InvalidSessionId(String),
    #[error("git did not answer within {0:?}")]
    GitTimeout(Duration),
    #[error("git lookup failed: {0}")]
    GitFailed(String),
}

impl StatuslineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.into(),
            source,
        }
    }

    /// True when the error only means "nothing there yet".
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound
        )
    }
}
