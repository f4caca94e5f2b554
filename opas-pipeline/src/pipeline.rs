//! Canonical pipeline entrypoint shared by CLI and daemon.
//!
//! Strict ordering per run: restore cache → fetch into staging → promote →
//! archive cache → detect → (conditionally) publish. Cache restore/save are
//! best-effort and degrade to a cold fetch; a fetch failure aborts the run
//! before detection, so no partial snapshot is ever committed.

use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;

use opas_core::{CacheKey, PipelineConfig, RunId};
use opas_store::Restored;

use crate::detect;
use crate::error::PipelineError;
use crate::fetch::{self, WriteResult};
use crate::git::git_succeeds;
use crate::publish;

/// Serializable summary of one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    /// Key the cache blob was restored from, `None` on a cold start.
    pub cache_restored: Option<String>,
    /// Whether the restore came from fallback-prefix matching.
    pub cache_fallback: bool,
    /// Key the mutated blob was archived under, `None` if archiving was
    /// skipped (dry-run) or failed.
    pub cache_archived: Option<String>,
    pub written: usize,
    pub unchanged: usize,
    pub removed: usize,
    /// Changed paths reported by the detector (pending writes in dry-run).
    pub changed_paths: usize,
    /// First-ever run: no prior commit existed.
    pub baseline: bool,
    /// Hash of the published commit, `None` when publishing was skipped.
    pub commit: Option<String>,
    pub dry_run: bool,
    pub duration_ms: u128,
}

impl RunReport {
    pub fn published(&self) -> bool {
        self.commit.is_some()
    }
}

/// Run the pipeline once.
///
/// `dry_run` reports what the run *would* write and commit without touching
/// the output directory, the cache store, or version control.
pub fn run(
    home: &Path,
    config: &PipelineConfig,
    dry_run: bool,
) -> Result<RunReport, PipelineError> {
    let started = Instant::now();
    let run_id = RunId::now();
    let key = CacheKey::for_run(&config.cache.key_prefix, &run_id);
    let fallback_prefix = format!("{}-", config.cache.key_prefix);
    let store_dir = config.store_dir_at(home);
    let blob = config.blob_path_at(home);

    // Restore is advisory: any store failure degrades to a cold fetch.
    let restored = match opas_store::restore_at(&store_dir, &key, &fallback_prefix, &blob) {
        Ok(restored) => restored,
        Err(err) => {
            tracing::warn!("cache restore failed, starting cold: {err}");
            Restored::Cold
        }
    };
    match &restored {
        Restored::Cold => tracing::info!("cache: cold start"),
        Restored::Exact { key } => tracing::info!("cache: restored {key}"),
        Restored::Fallback { key } => tracing::info!("cache: restored via fallback {key}"),
    }

    let staging = config.repo.join(format!(".opas-staging-{run_id}"));
    let writes = fetch_and_promote(config, &staging, dry_run)?;

    let cache_archived = if dry_run {
        None
    } else {
        archive_cache(&store_dir, &key, &blob, config.cache.keep)
    };

    let (written, unchanged, removed) = tally(&writes);

    let (changed_paths, baseline, commit) = if dry_run {
        // The working tree was not modified; pending writes stand in for the
        // detector's answer. Baseline probing is read-only, so it still runs.
        let pending = writes.iter().filter(|w| w.is_change()).count();
        let baseline = !git_succeeds(&config.repo, &["rev-parse", "--verify", "HEAD"])?;
        (pending, baseline, None)
    } else {
        let changes = detect::detect(&config.repo, &config.output_dir)?;
        let commit = if changes.has_changes() {
            let run_date = Utc::now().format("%Y-%m-%d").to_string();
            let record = publish::publish(
                &config.repo,
                &config.output_dir,
                &config.publish,
                &run_date,
                changes.baseline,
            )?;
            Some(record.id)
        } else {
            tracing::info!("no changes detected; publish skipped");
            None
        };
        (changes.changed_count(), changes.baseline, commit)
    };

    let (cache_restored, cache_fallback) = match restored {
        Restored::Cold => (None, false),
        Restored::Exact { key } => (Some(key.0), false),
        Restored::Fallback { key } => (Some(key.0), true),
    };

    Ok(RunReport {
        run_id: run_id.0,
        cache_restored,
        cache_fallback,
        cache_archived,
        written,
        unchanged,
        removed,
        changed_paths,
        baseline,
        commit,
        dry_run,
        duration_ms: started.elapsed().as_millis(),
    })
}

/// Fetch into staging and promote, removing staging on every exit path.
fn fetch_and_promote(
    config: &PipelineConfig,
    staging: &PathBuf,
    dry_run: bool,
) -> Result<Vec<WriteResult>, PipelineError> {
    let result = fetch::run_fetch(config, staging)
        .and_then(|()| fetch::promote(staging, &config.output_path(), dry_run));
    let _ = std::fs::remove_dir_all(staging);
    result
}

/// Archive the mutated blob; failure only costs future efficiency.
fn archive_cache(store_dir: &Path, key: &CacheKey, blob: &Path, keep: usize) -> Option<String> {
    if !blob.exists() {
        tracing::info!("fetch script produced no cache blob; nothing to archive");
        return None;
    }
    match opas_store::save_at(store_dir, key, blob, keep) {
        Ok(entry) => Some(entry.key.0),
        Err(err) => {
            tracing::warn!("cache archive failed (next run starts colder): {err}");
            None
        }
    }
}

fn tally(writes: &[WriteResult]) -> (usize, usize, usize) {
    let mut written = 0usize;
    let mut unchanged = 0usize;
    let mut removed = 0usize;
    for write in writes {
        match write {
            WriteResult::Written { .. } | WriteResult::WouldWrite { .. } => written += 1,
            WriteResult::Unchanged { .. } => unchanged += 1,
            WriteResult::Removed { .. } | WriteResult::WouldRemove { .. } => removed += 1,
        }
    }
    (written, unchanged, removed)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use tempfile::TempDir;

    use opas_core::PipelineConfig;

    use crate::git::run_git;
    use crate::git::testutil::init_repo;

    use super::*;

    /// Script that emits a fixed snapshot and mirrors its cache blob into
    /// the output so tests can observe warm vs cold starts.
    fn write_script(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fetch.sh");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn test_config(home: &TempDir, repo: &Path, script: PathBuf) -> PipelineConfig {
        let mut config = PipelineConfig::new(repo.to_path_buf(), PathBuf::from("yle"), script);
        // Keep everything under the test sandbox; no remote in unit tests.
        config.cache.blob = Some(home.path().join("cache.db"));
        config.cache.store_dir = Some(home.path().join("store"));
        config.publish.push = false;
        config
    }

    const STATIC_SNAPSHOT: &str = r#"printf 'monday: talks' > "$2/monday.yaml"
printf 'tuesday: music' > "$2/tuesday.yaml""#;

    #[test]
    fn first_run_commits_baseline_snapshot() {
        let home = TempDir::new().unwrap();
        let repo = TempDir::new().unwrap();
        init_repo(repo.path());
        let script = write_script(repo.path(), STATIC_SNAPSHOT);
        let config = test_config(&home, repo.path(), script);

        let report = run(home.path(), &config, false).expect("run");

        assert!(report.baseline);
        assert_eq!(report.written, 2);
        assert!(report.published());
        assert!(report.cache_restored.is_none(), "first run is cold");

        let subject = run_git(repo.path(), &["log", "-1", "--format=%s"]).unwrap();
        assert!(subject.contains("[skip ci]"));
        let listed = run_git(repo.path(), &["ls-tree", "-r", "--name-only", "HEAD"]).unwrap();
        assert!(listed.contains("yle/monday.yaml"));
        assert!(listed.contains("yle/tuesday.yaml"));
    }

    #[test]
    fn unchanged_second_run_skips_publish_and_is_byte_identical() {
        let home = TempDir::new().unwrap();
        let repo = TempDir::new().unwrap();
        init_repo(repo.path());
        let script = write_script(repo.path(), STATIC_SNAPSHOT);
        let config = test_config(&home, repo.path(), script);

        run(home.path(), &config, false).expect("first run");
        let before = fs::read(repo.path().join("yle/monday.yaml")).unwrap();

        let report = run(home.path(), &config, false).expect("second run");
        assert_eq!(report.changed_paths, 0);
        assert!(!report.published());
        assert_eq!(report.written, 0);
        assert_eq!(report.unchanged, 2);

        let after = fs::read(repo.path().join("yle/monday.yaml")).unwrap();
        assert_eq!(after, before);
        let count = run_git(repo.path(), &["rev-list", "--count", "HEAD"]).unwrap();
        assert_eq!(count, "1", "no second commit expected");
    }

    #[test]
    fn upstream_change_produces_followup_commit() {
        let home = TempDir::new().unwrap();
        let repo = TempDir::new().unwrap();
        init_repo(repo.path());
        let script = write_script(repo.path(), STATIC_SNAPSHOT);
        let mut config = test_config(&home, repo.path(), script);
        run(home.path(), &config, false).expect("first run");

        let changed = write_script(
            repo.path(),
            r#"printf 'monday: revised' > "$2/monday.yaml""#,
        );
        config.fetch.program = changed;

        let report = run(home.path(), &config, false).expect("second run");
        assert_eq!(report.written, 1);
        assert_eq!(report.removed, 1, "tuesday.yaml left the snapshot");
        assert!(report.published());

        let count = run_git(repo.path(), &["rev-list", "--count", "HEAD"]).unwrap();
        assert_eq!(count, "2");
        let listed = run_git(repo.path(), &["ls-tree", "-r", "--name-only", "HEAD"]).unwrap();
        assert!(!listed.contains("tuesday.yaml"));
    }

    #[test]
    fn fetch_failure_aborts_before_detection_and_publish() {
        let home = TempDir::new().unwrap();
        let repo = TempDir::new().unwrap();
        init_repo(repo.path());
        let script = write_script(repo.path(), "echo 'upstream 503' >&2; exit 1");
        let config = test_config(&home, repo.path(), script);

        let err = run(home.path(), &config, false).expect_err("fetch fails");
        assert!(matches!(err, PipelineError::FetchFailed { .. }));

        assert!(
            !git_succeeds(repo.path(), &["rev-parse", "--verify", "HEAD"]).unwrap(),
            "no commit must be created"
        );
        assert!(
            !repo.path().join("yle").exists(),
            "no partial snapshot must be promoted"
        );
        let leftovers: Vec<_> = fs::read_dir(repo.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".opas-staging-"))
            .collect();
        assert!(leftovers.is_empty(), "staging must be cleaned up");
    }

    #[test]
    fn cache_blob_round_trips_between_runs() {
        let home = TempDir::new().unwrap();
        let repo = TempDir::new().unwrap();
        init_repo(repo.path());
        // The script reports whether it saw a restored blob, then mutates it.
        let blob = home.path().join("cache.db");
        let script = write_script(
            repo.path(),
            &format!(
                r#"BLOB="{blob}"
if [ -f "$BLOB" ]; then cat "$BLOB" > "$2/origin.yaml"; else printf 'cold' > "$2/origin.yaml"; fi
printf 'warm' > "$BLOB""#,
                blob = blob.display()
            ),
        );
        let config = test_config(&home, repo.path(), script);

        let first = run(home.path(), &config, false).expect("first run");
        assert!(first.cache_restored.is_none());
        assert!(first.cache_archived.is_some(), "mutated blob archived");
        assert_eq!(
            fs::read_to_string(repo.path().join("yle/origin.yaml")).unwrap(),
            "cold"
        );

        // Simulate a fresh machine: the live blob is gone, only the store has it.
        fs::remove_file(config.blob_path_at(home.path())).unwrap();

        // Run ids have second resolution; make sure the second key differs.
        std::thread::sleep(std::time::Duration::from_millis(1100));

        let second = run(home.path(), &config, false).expect("second run");
        assert!(second.cache_restored.is_some(), "restored from the archive");
        assert!(second.cache_fallback, "new run id only matches by prefix");
        assert_eq!(
            fs::read_to_string(repo.path().join("yle/origin.yaml")).unwrap(),
            "warm"
        );
    }

    #[test]
    fn dry_run_reports_pending_work_without_side_effects() {
        let home = TempDir::new().unwrap();
        let repo = TempDir::new().unwrap();
        init_repo(repo.path());
        let script = write_script(repo.path(), STATIC_SNAPSHOT);
        let config = test_config(&home, repo.path(), script);

        let report = run(home.path(), &config, true).expect("dry run");
        assert!(report.dry_run);
        assert_eq!(report.changed_paths, 2);
        assert!(report.baseline);
        assert!(!report.published());
        assert!(report.cache_archived.is_none());

        assert!(!repo.path().join("yle").exists(), "dry-run must not write");
        assert!(
            !git_succeeds(repo.path(), &["rev-parse", "--verify", "HEAD"]).unwrap(),
            "dry-run must not commit"
        );
    }

    #[test]
    fn broken_cache_store_still_yields_complete_snapshot() {
        let home = TempDir::new().unwrap();
        let repo = TempDir::new().unwrap();
        init_repo(repo.path());
        let script = write_script(repo.path(), STATIC_SNAPSHOT);
        let mut config = test_config(&home, repo.path(), script);
        // A plain file where the store directory should be: restore and
        // archive both fail, the run must not.
        let blocked = home.path().join("store-blocked");
        fs::write(&blocked, "not a directory").unwrap();
        config.cache.store_dir = Some(blocked);

        let report = run(home.path(), &config, false).expect("cold-start run");
        assert_eq!(report.written, 2);
        assert!(report.published());
        assert!(report.cache_restored.is_none());
        assert!(report.cache_archived.is_none());
    }
}
