//! Fetch job: run the external script into staging, then promote.
//!
//! ## Promotion — hash-gated atomic copy
//!
//! 1. Fetch script writes the snapshot into `.opas-staging-<run_id>/`.
//! 2. SHA-256 each staged file.
//! 3. Compare with the current file in the output directory → skip if identical.
//! 4. Write changed files to `<path>.opas.tmp`, rename to final path.
//! 5. Remove output files absent from the new snapshot.
//!
//! Identical files are never rewritten, so an unchanged upstream leaves the
//! output directory byte-identical (mtimes included) and a re-run is
//! idempotent. A failed fetch never reaches promotion, so the previously
//! committed snapshot stays intact.

use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;

use sha2::{Digest, Sha256};

use opas_core::PipelineConfig;

use crate::error::{io_err, PipelineError};

// ---------------------------------------------------------------------------
// Write result
// ---------------------------------------------------------------------------

/// Outcome of promoting an individual snapshot file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResult {
    /// File was written (content changed or did not previously exist).
    Written { path: PathBuf },
    /// File was skipped — staged content matches the on-disk content.
    Unchanged { path: PathBuf },
    /// File existed in the previous snapshot but not in the new one.
    Removed { path: PathBuf },
    /// `--dry-run` mode: the file *would* have been written.
    WouldWrite { path: PathBuf },
    /// `--dry-run` mode: the file *would* have been removed.
    WouldRemove { path: PathBuf },
}

impl WriteResult {
    /// Whether this result represents a pending or applied change.
    pub fn is_change(&self) -> bool {
        !matches!(self, WriteResult::Unchanged { .. })
    }
}

// ---------------------------------------------------------------------------
// Script invocation
// ---------------------------------------------------------------------------

/// Invoke the fetch script with the output-directory flag pointing at
/// `staging`.
///
/// The script runs with the repository root as its working directory and
/// inherits stdout/stderr, so its own logging lands in the job log. A
/// non-zero exit is an upstream/network failure and aborts the run.
pub fn run_fetch(config: &PipelineConfig, staging: &Path) -> Result<(), PipelineError> {
    std::fs::create_dir_all(staging).map_err(|e| io_err(staging, e))?;

    let program = &config.fetch.program;
    let status = Command::new(program)
        .args(&config.fetch.args)
        .arg(&config.fetch.output_flag)
        .arg(staging)
        .current_dir(&config.repo)
        .status()
        .map_err(|source| PipelineError::FetchSpawn {
            program: program.clone(),
            source,
        })?;

    if !status.success() {
        return Err(PipelineError::FetchFailed {
            program: program.clone(),
            status: status.to_string(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Promotion
// ---------------------------------------------------------------------------

/// Promote the staged snapshot into `output_dir`.
///
/// Returns one [`WriteResult`] per affected path (written, unchanged, or
/// removed), sorted by path within each category.
pub fn promote(
    staging: &Path,
    output_dir: &Path,
    dry_run: bool,
) -> Result<Vec<WriteResult>, PipelineError> {
    let staged = relative_files(staging)?;
    let existing = relative_files(output_dir)?;
    let staged_set: BTreeSet<&PathBuf> = staged.iter().collect();

    let mut results = Vec::new();

    for rel in &staged {
        let src = staging.join(rel);
        let dst = output_dir.join(rel);
        let content = std::fs::read(&src).map_err(|e| io_err(&src, e))?;

        if let Some(on_disk) = read_existing(&dst)? {
            if sha256_hex(&on_disk) == sha256_hex(&content) {
                tracing::debug!("unchanged: {}", dst.display());
                results.push(WriteResult::Unchanged { path: dst });
                continue;
            }
        }

        if dry_run {
            tracing::info!("[dry-run] would write: {}", dst.display());
            results.push(WriteResult::WouldWrite { path: dst });
            continue;
        }

        atomic_write(&dst, &content)?;
        tracing::info!("wrote: {}", dst.display());
        results.push(WriteResult::Written { path: dst });
    }

    // Files from the previous snapshot that the new one no longer contains.
    for rel in &existing {
        if staged_set.contains(rel) {
            continue;
        }
        let dst = output_dir.join(rel);
        if dry_run {
            tracing::info!("[dry-run] would remove: {}", dst.display());
            results.push(WriteResult::WouldRemove { path: dst });
            continue;
        }
        std::fs::remove_file(&dst).map_err(|e| io_err(&dst, e))?;
        tracing::info!("removed: {}", dst.display());
        results.push(WriteResult::Removed { path: dst });
    }

    Ok(results)
}

fn atomic_write(path: &Path, content: &[u8]) -> Result<(), PipelineError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    let tmp = PathBuf::from(format!("{}.opas.tmp", path.display()));
    std::fs::write(&tmp, content).map_err(|e| io_err(&tmp, e))?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(io_err(path, e));
    }
    Ok(())
}

fn read_existing(path: &Path) -> Result<Option<Vec<u8>>, PipelineError> {
    match std::fs::read(path) {
        Ok(content) => Ok(Some(content)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(io_err(path, err)),
    }
}

fn sha256_hex(content: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(content);
    hex::encode(h.finalize())
}

/// Sorted relative paths of all regular files under `root`.
///
/// An absent directory is an empty snapshot, not an error.
fn relative_files(root: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    let mut files = Vec::new();
    let mut dirs = vec![root.to_path_buf()];

    while let Some(current) = dirs.pop() {
        let entries = match std::fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => continue,
            Err(err) => return Err(io_err(&current, err)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| io_err(&current, e))?;
            let ty = entry.file_type().map_err(|e| io_err(entry.path(), e))?;
            if ty.is_dir() {
                dirs.push(entry.path());
            } else if ty.is_file() {
                let path = entry.path();
                let rel = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
                files.push(rel);
            }
        }
    }

    files.sort();
    Ok(files)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use opas_core::PipelineConfig;

    use super::*;

    fn write_script(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fetch.sh");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn config_for(repo: &Path, program: PathBuf) -> PipelineConfig {
        PipelineConfig::new(repo.to_path_buf(), PathBuf::from("yle"), program)
    }

    #[test]
    fn fetch_script_receives_staging_via_output_flag() {
        let repo = TempDir::new().unwrap();
        let script = write_script(
            repo.path(),
            r#"[ "$1" = "--output-dir" ] || exit 2
printf 'Monday schedule' > "$2/monday.yaml""#,
        );
        let config = config_for(repo.path(), script);
        let staging = repo.path().join(".opas-staging-test");

        run_fetch(&config, &staging).expect("fetch");
        assert_eq!(
            fs::read_to_string(staging.join("monday.yaml")).unwrap(),
            "Monday schedule"
        );
    }

    #[test]
    fn nonzero_exit_surfaces_as_fetch_failed() {
        let repo = TempDir::new().unwrap();
        let script = write_script(repo.path(), "exit 3");
        let config = config_for(repo.path(), script);
        let staging = repo.path().join(".opas-staging-test");

        let err = run_fetch(&config, &staging).expect_err("script exits 3");
        assert!(matches!(err, PipelineError::FetchFailed { .. }));
    }

    #[test]
    fn missing_program_surfaces_as_fetch_spawn() {
        let repo = TempDir::new().unwrap();
        let config = config_for(repo.path(), repo.path().join("no-such-script.sh"));
        let staging = repo.path().join(".opas-staging-test");

        let err = run_fetch(&config, &staging).expect_err("program absent");
        assert!(matches!(err, PipelineError::FetchSpawn { .. }));
    }

    #[test]
    fn first_promotion_writes_all_files() {
        let root = TempDir::new().unwrap();
        let staging = root.path().join("staging");
        let output = root.path().join("yle");
        fs::create_dir_all(staging.join("sub")).unwrap();
        fs::write(staging.join("a.yaml"), "a").unwrap();
        fs::write(staging.join("sub/b.yaml"), "b").unwrap();

        let results = promote(&staging, &output, false).unwrap();
        assert_eq!(results.len(), 2);
        assert!(results
            .iter()
            .all(|r| matches!(r, WriteResult::Written { .. })));
        assert_eq!(fs::read_to_string(output.join("sub/b.yaml")).unwrap(), "b");
    }

    #[test]
    fn identical_content_is_skipped_and_mtime_preserved() {
        let root = TempDir::new().unwrap();
        let staging = root.path().join("staging");
        let output = root.path().join("yle");
        fs::create_dir_all(&staging).unwrap();
        fs::write(staging.join("a.yaml"), "same").unwrap();

        promote(&staging, &output, false).unwrap();
        let mtime_1 = fs::metadata(output.join("a.yaml")).unwrap().modified().unwrap();

        std::thread::sleep(std::time::Duration::from_millis(1100));
        let results = promote(&staging, &output, false).unwrap();
        assert!(matches!(results[0], WriteResult::Unchanged { .. }));

        let mtime_2 = fs::metadata(output.join("a.yaml")).unwrap().modified().unwrap();
        assert_eq!(mtime_2, mtime_1, "mtime changed; file was rewritten");
    }

    #[test]
    fn files_missing_from_new_snapshot_are_removed() {
        let root = TempDir::new().unwrap();
        let staging = root.path().join("staging");
        let output = root.path().join("yle");
        fs::create_dir_all(&staging).unwrap();
        fs::create_dir_all(&output).unwrap();
        fs::write(staging.join("keep.yaml"), "k").unwrap();
        fs::write(output.join("keep.yaml"), "k").unwrap();
        fs::write(output.join("stale.yaml"), "old").unwrap();

        let results = promote(&staging, &output, false).unwrap();
        assert!(results
            .iter()
            .any(|r| matches!(r, WriteResult::Removed { path } if path.ends_with("stale.yaml"))));
        assert!(!output.join("stale.yaml").exists());
        assert!(output.join("keep.yaml").exists());
    }

    #[test]
    fn dry_run_touches_nothing() {
        let root = TempDir::new().unwrap();
        let staging = root.path().join("staging");
        let output = root.path().join("yle");
        fs::create_dir_all(&staging).unwrap();
        fs::create_dir_all(&output).unwrap();
        fs::write(staging.join("new.yaml"), "new").unwrap();
        fs::write(output.join("stale.yaml"), "old").unwrap();

        let results = promote(&staging, &output, true).unwrap();
        assert!(results
            .iter()
            .any(|r| matches!(r, WriteResult::WouldWrite { .. })));
        assert!(results
            .iter()
            .any(|r| matches!(r, WriteResult::WouldRemove { .. })));
        assert!(!output.join("new.yaml").exists(), "dry-run must not write");
        assert!(output.join("stale.yaml").exists(), "dry-run must not remove");
    }

    #[test]
    fn tmp_files_cleaned_up_after_promotion() {
        let root = TempDir::new().unwrap();
        let staging = root.path().join("staging");
        let output = root.path().join("yle");
        fs::create_dir_all(&staging).unwrap();
        fs::write(staging.join("a.yaml"), "a").unwrap();

        promote(&staging, &output, false).unwrap();
        let tmp = PathBuf::from(format!("{}.opas.tmp", output.join("a.yaml").display()));
        assert!(!tmp.exists(), ".opas.tmp must be cleaned up");
    }
}
