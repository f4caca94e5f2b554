//! Keyed blob archive with fallback-prefix restore.
//!
//! # Storage layout
//!
//! ```text
//! <store_dir>/
//!   manifest.json         (entry index — atomic `.tmp` + rename)
//!   blobs/
//!     <sanitized_key>.blob
//! ```
//!
//! Writes use the same atomic `.tmp` + rename pattern as the config.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use opas_core::types::CacheKey;

use crate::error::{io_err, StoreError};

/// One archived cache generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub saved_at: DateTime<Utc>,
    pub bytes: u64,
}

/// On-disk manifest payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
struct Manifest {
    entries: Vec<CacheEntry>,
}

/// Outcome of a restore attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Restored {
    /// Nothing usable in the store; the fetch starts cold.
    Cold,
    /// The requested key was present and restored.
    Exact { key: CacheKey },
    /// The key missed; the newest prior generation with the fallback prefix
    /// was restored instead.
    Fallback { key: CacheKey },
}

fn manifest_path(store_dir: &Path) -> PathBuf {
    store_dir.join("manifest.json")
}

fn blobs_dir(store_dir: &Path) -> PathBuf {
    store_dir.join("blobs")
}

/// Filesystem-safe blob file name for a key.
fn blob_path(store_dir: &Path, key: &CacheKey) -> PathBuf {
    let sanitized: String = key
        .0
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    blobs_dir(store_dir).join(format!("{sanitized}.blob"))
}

/// Read the manifest, treating a missing or unparseable file as empty.
///
/// Corruption is recoverable by contract — the next `save` rewrites the
/// manifest from scratch.
fn read_manifest(store_dir: &Path) -> Result<Manifest, StoreError> {
    let path = manifest_path(store_dir);
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Manifest::default()),
        Err(err) => return Err(io_err(&path, err)),
    };
    Ok(serde_json::from_str(&contents).unwrap_or_default())
}

/// Write the manifest atomically (`.tmp` sibling + rename).
fn write_manifest(store_dir: &Path, manifest: &Manifest) -> Result<(), StoreError> {
    let path = manifest_path(store_dir);
    let json = serde_json::to_string_pretty(manifest)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &json).map_err(|e| io_err(&tmp, e))?;
    std::fs::rename(&tmp, &path).map_err(|e| io_err(&path, e))?;
    Ok(())
}

fn atomic_copy(src: &Path, dst: &Path) -> Result<u64, StoreError> {
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    let tmp = PathBuf::from(format!("{}.opas.tmp", dst.display()));
    let bytes = std::fs::copy(src, &tmp).map_err(|e| io_err(&tmp, e))?;
    if let Err(e) = std::fs::rename(&tmp, dst) {
        let _ = std::fs::remove_file(&tmp);
        return Err(io_err(dst, e));
    }
    Ok(bytes)
}

/// Archive the live blob at `blob` under `key`, then prune to `keep` entries.
///
/// Saving the same key twice replaces the prior generation in place.
pub fn save_at(
    store_dir: &Path,
    key: &CacheKey,
    blob: &Path,
    keep: usize,
) -> Result<CacheEntry, StoreError> {
    let dst = blob_path(store_dir, key);
    let bytes = atomic_copy(blob, &dst)?;

    let entry = CacheEntry {
        key: key.clone(),
        saved_at: Utc::now(),
        bytes,
    };

    let mut manifest = read_manifest(store_dir)?;
    manifest.entries.retain(|e| e.key != *key);
    manifest.entries.push(entry.clone());
    manifest.entries.sort_by(|a, b| a.saved_at.cmp(&b.saved_at));

    // Prune oldest generations beyond `keep`.
    while manifest.entries.len() > keep.max(1) {
        let removed = manifest.entries.remove(0);
        let _ = std::fs::remove_file(blob_path(store_dir, &removed.key));
    }

    write_manifest(store_dir, &manifest)?;
    Ok(entry)
}

/// Restore the blob for `key` to `dest`.
///
/// Exact key first; on a miss, the newest entry whose key starts with
/// `fallback_prefix`. Entries whose blob file has vanished are skipped.
/// Nothing usable leaves `dest` untouched and returns [`Restored::Cold`].
pub fn restore_at(
    store_dir: &Path,
    key: &CacheKey,
    fallback_prefix: &str,
    dest: &Path,
) -> Result<Restored, StoreError> {
    let manifest = read_manifest(store_dir)?;

    if manifest.entries.iter().any(|e| e.key == *key) {
        let src = blob_path(store_dir, key);
        if src.exists() {
            atomic_copy(&src, dest)?;
            return Ok(Restored::Exact { key: key.clone() });
        }
    }

    // Newest-first fallback scan over the shared prefix.
    let mut candidates: Vec<&CacheEntry> = manifest
        .entries
        .iter()
        .filter(|e| e.key != *key && e.key.0.starts_with(fallback_prefix))
        .collect();
    candidates.sort_by(|a, b| b.saved_at.cmp(&a.saved_at));

    for entry in candidates {
        let src = blob_path(store_dir, &entry.key);
        if src.exists() {
            atomic_copy(&src, dest)?;
            return Ok(Restored::Fallback {
                key: entry.key.clone(),
            });
        }
    }

    Ok(Restored::Cold)
}

/// List archived entries, newest first.
pub fn list_at(store_dir: &Path) -> Result<Vec<CacheEntry>, StoreError> {
    let mut entries = read_manifest(store_dir)?.entries;
    entries.sort_by(|a, b| b.saved_at.cmp(&a.saved_at));
    Ok(entries)
}

/// Prune the store down to `keep` newest entries; returns the removed keys.
pub fn prune_at(store_dir: &Path, keep: usize) -> Result<Vec<CacheKey>, StoreError> {
    let mut manifest = read_manifest(store_dir)?;
    manifest.entries.sort_by(|a, b| a.saved_at.cmp(&b.saved_at));

    let mut removed = Vec::new();
    while manifest.entries.len() > keep {
        let entry = manifest.entries.remove(0);
        let _ = std::fs::remove_file(blob_path(store_dir, &entry.key));
        removed.push(entry.key);
    }

    if !removed.is_empty() {
        write_manifest(store_dir, &manifest)?;
    }
    Ok(removed)
}
