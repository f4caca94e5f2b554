//! # opas-pipeline
//!
//! Fetch-and-publish pipeline: restore the cache blob, run the external
//! fetch script into a staging directory, promote the snapshot into the
//! repository, archive the cache, detect working-tree changes, and commit
//! and push when something actually changed.
//!
//! Call [`pipeline::run`] — the canonical entrypoint shared by the CLI and
//! the daemon processor.

pub mod detect;
pub mod error;
pub mod fetch;
mod git;
pub mod pipeline;
pub mod publish;

pub use detect::ChangeSet;
pub use error::PipelineError;
pub use fetch::WriteResult;
pub use pipeline::{run, RunReport};
pub use publish::CommitRecord;
