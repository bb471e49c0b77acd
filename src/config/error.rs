//! Configuration error types.

use std::path::PathBuf;
use thiserror::Error;

/// Configuration-related errors. All of them end the process before the
/// application is started.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error when reading `{0}`")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("config file parsing error")]
    Toml(#[from] toml::de::Error),

    #[error("no application command: pass one after `--` or set `run` in [app]")]
    MissingCommand,

    #[error("invalid port `{0}`")]
    InvalidPort(String),

    #[error("invalid ignore rule")]
    Ignore(#[from] globset::Error),

    #[error("project root `{0}` is not a directory")]
    NotADirectory(PathBuf),
}
