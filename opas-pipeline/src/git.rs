//! Thin wrapper over the `git` binary.
//!
//! Git internals are out of scope; every version-control operation shells
//! out to the installed `git` with stdout/stderr captured.

use std::path::Path;
use std::process::Command;

use crate::error::{io_err, PipelineError};

/// Run `git <args>` in `repo`; trimmed stdout on success, `Git` error with
/// captured stderr otherwise.
pub(crate) fn run_git(repo: &Path, args: &[&str]) -> Result<String, PipelineError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo)
        .output()
        .map_err(|e| io_err(repo, e))?;

    if !output.status.success() {
        return Err(PipelineError::Git {
            command: args.join(" "),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Run `git <args>` and report only whether it exited zero.
///
/// Spawn failures (no `git` on `$PATH`) still surface as errors.
pub(crate) fn git_succeeds(repo: &Path, args: &[&str]) -> Result<bool, PipelineError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo)
        .output()
        .map_err(|e| io_err(repo, e))?;
    Ok(output.status.success())
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::path::Path;

    use super::run_git;

    /// `git init -b main` plus a local identity so raw test commits work.
    pub(crate) fn init_repo(path: &Path) {
        run_git(path, &["init", "-q", "-b", "main"]).expect("git init");
        run_git(path, &["config", "user.name", "test"]).expect("config name");
        run_git(path, &["config", "user.email", "test@example.invalid"]).expect("config email");
    }

    pub(crate) fn commit_all(path: &Path, message: &str) {
        run_git(path, &["add", "-A"]).expect("git add");
        run_git(path, &["commit", "-q", "-m", message]).expect("git commit");
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn run_git_captures_stderr_on_failure() {
        let repo = TempDir::new().unwrap();
        testutil::init_repo(repo.path());
        let err = run_git(repo.path(), &["rev-parse", "--verify", "HEAD"])
            .expect_err("unborn HEAD should fail");
        match err {
            PipelineError::Git { command, stderr } => {
                assert_eq!(command, "rev-parse --verify HEAD");
                assert!(!stderr.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn git_succeeds_distinguishes_exit_status() {
        let repo = TempDir::new().unwrap();
        testutil::init_repo(repo.path());
        assert!(!git_succeeds(repo.path(), &["rev-parse", "--verify", "HEAD"]).unwrap());
        std::fs::write(repo.path().join("a.txt"), "a").unwrap();
        testutil::commit_all(repo.path(), "first");
        assert!(git_succeeds(repo.path(), &["rev-parse", "--verify", "HEAD"]).unwrap());
    }
}
