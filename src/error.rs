//! Crate-wide error type

use std::path::PathBuf;

/// Errors surfaced by the pipeline, the store and the providers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Embedding or generative provider call failed (network, auth, quota, bad status)
    #[error("provider error: {0}")]
    Provider(String),

    #[error("embedding count mismatch: requested {requested}, received {received}")]
    EmbeddingCountMismatch { requested: usize, received: usize },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Uploaded export could not be recognised or parsed
    #[error("import error: {0}")]
    Import(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// A task ended without an outcome (aborted, panicked, or reported failed)
    #[error("task error: {0}")]
    Task(String),

    /// The worker is gone; nothing can be enqueued anymore
    #[error("task queue closed")]
    QueueClosed,
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io { path: path.into(), source }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Provider(format!("HTTP request failed: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
