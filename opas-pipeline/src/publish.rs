//! Publisher: stage, commit with the bot identity, push.
//!
//! Commits are append-only — prior history is never amended. Every message
//! carries the configured skip-trigger marker so the external runner's
//! trigger filter ignores automated commits. A rejected push (remote moved
//! concurrently) is surfaced as [`PipelineError::PushConflict`], never
//! silently dropped; recovery is the next scheduled run.

use std::path::Path;

use opas_core::config::PublishConfig;

use crate::error::PipelineError;
use crate::git::run_git;

/// One published snapshot commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    /// Full commit hash.
    pub id: String,
    pub message: String,
}

/// Commit message: `<subject_prefix> <run_date> <skip_marker>`.
pub fn commit_message(config: &PublishConfig, run_date: &str) -> String {
    format!(
        "{} {} {}",
        config.subject_prefix, run_date, config.skip_marker
    )
}

/// Stage everything under `output_dir`, commit, and (unless disabled) push.
///
/// `allow_empty` is set on baseline runs so the first-ever run always
/// produces a commit, even when the snapshot is degenerate.
pub fn publish(
    repo: &Path,
    output_dir: &Path,
    config: &PublishConfig,
    run_date: &str,
    allow_empty: bool,
) -> Result<CommitRecord, PipelineError> {
    let pathspec = output_dir.to_string_lossy();
    run_git(repo, &["add", "-A", "--", &pathspec])?;

    let message = commit_message(config, run_date);
    let name = format!("user.name={}", config.author_name);
    let email = format!("user.email={}", config.author_email);
    let mut args = vec![
        "-c",
        name.as_str(),
        "-c",
        email.as_str(),
        "commit",
        "-q",
        "-m",
        message.as_str(),
    ];
    if allow_empty {
        args.push("--allow-empty");
    }
    run_git(repo, &args)?;

    let id = run_git(repo, &["rev-parse", "HEAD"])?;
    tracing::info!("committed {id}: {message}");

    if config.push {
        push(repo, config)?;
    }

    Ok(CommitRecord { id, message })
}

fn push(repo: &Path, config: &PublishConfig) -> Result<(), PipelineError> {
    match run_git(repo, &["push", &config.remote, &config.branch]) {
        Ok(_) => {
            tracing::info!("pushed to {}/{}", config.remote, config.branch);
            Ok(())
        }
        Err(PipelineError::Git { stderr, command }) if is_push_conflict(&stderr) => {
            Err(PipelineError::PushConflict {
                remote: config.remote.clone(),
                branch: config.branch.clone(),
                stderr: if stderr.is_empty() { command } else { stderr },
            })
        }
        Err(err) => Err(err),
    }
}

fn is_push_conflict(stderr: &str) -> bool {
    stderr.contains("[rejected]")
        || stderr.contains("non-fast-forward")
        || stderr.contains("fetch first")
}
