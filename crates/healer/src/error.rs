//! Error types for the healer.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by persistence and probing.
#[derive(Debug, Error)]
pub enum HealerError {
    /// Filesystem read/write failed
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A persisted document could not be (de)serialized
    #[error("JSON error in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The requested address is not in the status store
    #[error("Server {0} not found in status")]
    UnknownServer(String),

    /// The probe script could not be run
    #[error("Probe failed: {0}")]
    Probe(String),
}

impl HealerError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.into(),
            source,
        }
    }
}

/// Result alias for healer operations.
pub type Result<T> = std::result::Result<T, HealerError>;
