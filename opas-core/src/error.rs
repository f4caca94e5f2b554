//! Error types for opas-core.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise from config operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Underlying I/O failure (file not found, permission denied, etc.).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization error (write/save path).
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// YAML parse error on load — includes file path and line context from serde_yaml.
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// `dirs::home_dir()` returned `None` — cannot locate `~/.opas/`.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,

    /// The config YAML file did not exist at the expected path.
    #[error("config not found at {path}; run `opas init` first")]
    ConfigNotFound { path: PathBuf },

    /// The daily fire time is not a valid `HH:MM` 24-hour value.
    #[error("invalid schedule time '{value}'; expected HH:MM (24-hour, UTC)")]
    InvalidFireTime { value: String },
}
