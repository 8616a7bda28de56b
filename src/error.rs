use std::io;

use thiserror::Error;

/// Startup and construction failures. None of these are retried.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to initialize {what}: {source}")]
    Sync {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("failed to spawn worker {index}: {source}")]
    Spawn {
        index: usize,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ServerError>;
