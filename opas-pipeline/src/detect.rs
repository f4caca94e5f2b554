//! Change detection against the last committed state.
//!
//! `git status --porcelain` scoped to the output directory; a repository
//! with an unborn HEAD (no prior commit) is reported as a baseline run,
//! which always counts as "changes exist". Read-only — no side effects.

use std::path::{Path, PathBuf};

use crate::error::PipelineError;
use crate::git::{git_succeeds, run_git};

/// Working-tree delta for the output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    /// No prior commit exists (first-ever run).
    pub baseline: bool,
    /// Paths (relative to the repo root) that differ from HEAD.
    pub paths: Vec<PathBuf>,
}

impl ChangeSet {
    /// A baseline always warrants a commit, even degenerate empty ones.
    pub fn has_changes(&self) -> bool {
        self.baseline || !self.paths.is_empty()
    }

    pub fn changed_count(&self) -> usize {
        self.paths.len()
    }
}

/// Compare the working tree under `output_dir` (relative to `repo`) against
/// the last commit.
pub fn detect(repo: &Path, output_dir: &Path) -> Result<ChangeSet, PipelineError> {
    let baseline = !git_succeeds(repo, &["rev-parse", "--verify", "HEAD"])?;

    let pathspec = output_dir.to_string_lossy();
    let porcelain = run_git(repo, &["status", "--porcelain", "--", &pathspec])?;

    Ok(ChangeSet {
        baseline,
        paths: parse_porcelain(&porcelain),
    })
}

/// One path per `XY <path>` porcelain line; renames take the new name.
fn parse_porcelain(output: &str) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = output
        .lines()
        .filter(|line| line.len() > 3)
        .map(|line| {
            let path = &line[3..];
            let path = path.rsplit(" -> ").next().unwrap_or(path);
            PathBuf::from(path.trim_matches('"'))
        })
        .collect();
    paths.sort();
    paths.dedup();
    paths
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use crate::git::testutil::{commit_all, init_repo};

    use super::*;

    #[test]
    fn fresh_repo_is_baseline_with_changes() {
        let repo = TempDir::new().unwrap();
        init_repo(repo.path());
        fs::create_dir_all(repo.path().join("yle")).unwrap();
        fs::write(repo.path().join("yle/a.yaml"), "a").unwrap();

        let changes = detect(repo.path(), Path::new("yle")).unwrap();
        assert!(changes.baseline);
        assert!(changes.has_changes());
        assert_eq!(changes.changed_count(), 1);
    }

    #[test]
    fn committed_tree_reports_zero_changes() {
        let repo = TempDir::new().unwrap();
        init_repo(repo.path());
        fs::create_dir_all(repo.path().join("yle")).unwrap();
        fs::write(repo.path().join("yle/a.yaml"), "a").unwrap();
        commit_all(repo.path(), "snapshot");

        let changes = detect(repo.path(), Path::new("yle")).unwrap();
        assert!(!changes.baseline);
        assert!(!changes.has_changes());
        assert_eq!(changes.changed_count(), 0);
    }

    #[test]
    fn modified_and_new_files_are_listed() {
        let repo = TempDir::new().unwrap();
        init_repo(repo.path());
        fs::create_dir_all(repo.path().join("yle")).unwrap();
        fs::write(repo.path().join("yle/a.yaml"), "a").unwrap();
        commit_all(repo.path(), "snapshot");

        fs::write(repo.path().join("yle/a.yaml"), "changed").unwrap();
        fs::write(repo.path().join("yle/b.yaml"), "new").unwrap();

        let changes = detect(repo.path(), Path::new("yle")).unwrap();
        assert_eq!(
            changes.paths,
            vec![PathBuf::from("yle/a.yaml"), PathBuf::from("yle/b.yaml")]
        );
    }

    #[test]
    fn changes_outside_output_dir_are_ignored() {
        let repo = TempDir::new().unwrap();
        init_repo(repo.path());
        fs::create_dir_all(repo.path().join("yle")).unwrap();
        fs::write(repo.path().join("yle/a.yaml"), "a").unwrap();
        commit_all(repo.path(), "snapshot");

        fs::write(repo.path().join("README.md"), "unrelated").unwrap();

        let changes = detect(repo.path(), Path::new("yle")).unwrap();
        assert!(!changes.has_changes());
    }

    #[test]
    fn porcelain_rename_takes_new_name() {
        let parsed = parse_porcelain("R  yle/old.yaml -> yle/new.yaml\n M yle/a.yaml");
        assert_eq!(
            parsed,
            vec![PathBuf::from("yle/a.yaml"), PathBuf::from("yle/new.yaml")]
        );
    }
}
