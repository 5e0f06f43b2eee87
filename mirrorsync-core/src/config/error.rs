//! Errors from loading, saving and checking a [`MirrorConfig`](super::MirrorConfig)

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read mirror configuration {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot write mirror configuration {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML for a mirror configuration
    #[error("Malformed mirror configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Cannot encode mirror configuration: {0}")]
    Encode(#[from] toml::ser::Error),

    /// A `MIRRORSYNC_*` environment variable that does not parse
    #[error("Bad value in {var}: {reason}")]
    Env { var: String, reason: String },

    /// Settings that parse but cannot run a mirror
    #[error("Unusable mirror configuration: {0}")]
    Invalid(String),
}
