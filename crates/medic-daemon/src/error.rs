//! Error types for the daemon

use medic_core::{PortError, StoreError};
use std::path::PathBuf;

/// Configuration could not be loaded or is unusable
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("config has no [{0}] section")]
    MissingSection(&'static str),

    #[error("environment variable {0} is not set")]
    MissingSecret(&'static str),
}

/// Umbrella error of the daemon
#[derive(Debug, thiserror::Error)]
pub enum MedicError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("cannot encode output: {0}")]
    Encode(#[from] serde_json::Error),

    /// An adapter refused its settings
    #[error("cannot set up {what}: {source}")]
    Adapter {
        what: &'static str,
        #[source]
        source: PortError,
    },
}

impl MedicError {
    pub(crate) fn adapter(what: &'static str) -> impl FnOnce(PortError) -> Self {
        move |source| Self::Adapter { what, source }
    }
}

/// Result type for daemon operations
pub type Result<T, E = MedicError> = std::result::Result<T, E>;
