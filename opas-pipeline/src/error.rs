//! Error types for opas-pipeline.

use std::path::PathBuf;

use thiserror::Error;

use opas_core::error::ConfigError;
use opas_store::StoreError;

/// All errors that can arise from pipeline operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// An error from the config layer.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// An error from the cache store.
    ///
    /// Only surfaced from explicit store commands; inside a run, store
    /// failures degrade to a cold fetch instead.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The fetch script could not be spawned at all.
    #[error("failed to spawn fetch script {program}: {source}")]
    FetchSpawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The fetch script exited non-zero (upstream/network failure).
    #[error("fetch script {program} failed with {status}")]
    FetchFailed { program: PathBuf, status: String },

    /// A git subcommand failed.
    #[error("git {command} failed: {stderr}")]
    Git { command: String, stderr: String },

    /// The remote moved concurrently; the push was rejected.
    #[error("push to {remote}/{branch} rejected (remote moved concurrently): {stderr}")]
    PushConflict {
        remote: String,
        branch: String,
        stderr: String,
    },
}

/// Convenience constructor for [`PipelineError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> PipelineError {
    PipelineError::Io {
        path: path.into(),
        source,
    }
}
