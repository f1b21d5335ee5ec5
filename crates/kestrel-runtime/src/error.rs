//! Runtime error types.

use thiserror::Error;

use kestrel_core::LoadError;

use crate::config::ConfigError;

/// Errors that can occur during runtime operations.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Load(#[from] LoadError),

    /// A plugin directory could not be read or created.
    #[error("Plugin directory error at {path}: {source}")]
    Directory {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No transport configured")]
    MissingTransport,

    #[error("Runtime is not started")]
    NotStarted,

    #[error("Runtime is already started")]
    AlreadyStarted,
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
