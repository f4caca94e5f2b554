//! Opas core library — domain types, pipeline configuration, errors.
//!
//! Public API surface:
//! - [`types`] — newtypes and domain structs
//! - [`error`] — [`ConfigError`]
//! - [`config`] — load / save / init of the pipeline config document

pub mod config;
pub mod error;
pub mod types;

pub use config::PipelineConfig;
pub use error::ConfigError;
pub use types::{CacheKey, RunId};
