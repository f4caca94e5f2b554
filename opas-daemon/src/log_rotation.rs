//! Size-based rotation for the daemon log files.
//!
//! `daemon.log` and `daemon-err.log` rotate at 10 MiB, keeping up to five
//! numbered copies: `daemon.log` → `daemon.log.1` → … → `daemon.log.5`.

use std::fs;
use std::io;
use std::path::Path;

/// Maximum log file size before rotation (10 MiB).
pub const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024;

/// Maximum number of rotated backup files to keep.
pub const MAX_ROTATED_FILES: usize = 5;

/// Rotate `log_path` if its size exceeds `max_bytes`.
///
/// Returns `true` if rotation occurred; a missing file is skipped silently.
pub fn rotate_if_needed(log_path: &Path, max_bytes: u64, max_files: usize) -> io::Result<bool> {
    let size = match fs::metadata(log_path) {
        Ok(meta) => meta.len(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err),
    };

    if size < max_bytes {
        return Ok(false);
    }

    let oldest = numbered_path(log_path, max_files);
    if oldest.exists() {
        fs::remove_file(&oldest)?;
    }

    for n in (1..max_files).rev() {
        let src = numbered_path(log_path, n);
        if src.exists() {
            fs::rename(&src, numbered_path(log_path, n + 1))?;
        }
    }

    fs::rename(log_path, numbered_path(log_path, 1))?;

    // Fresh empty file so the daemon always has a writable log path.
    fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(log_path)?;

    Ok(true)
}

/// Rotate both daemon log files under `home`.
///
/// Errors for one file are logged and do not block the other.
pub fn rotate_logs(home: &Path) {
    let stdout_log = crate::paths::stdout_log_path(home);
    let stderr_log = crate::paths::stderr_log_path(home);

    for log_path in [&stdout_log, &stderr_log] {
        match rotate_if_needed(log_path, MAX_LOG_BYTES, MAX_ROTATED_FILES) {
            Ok(true) => tracing::info!(path = %log_path.display(), "log file rotated"),
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(path = %log_path.display(), error = %err, "log rotation failed")
            }
        }
    }
}

fn numbered_path(base: &Path, n: usize) -> std::path::PathBuf {
    let name = base
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or(crate::paths::DAEMON_STDOUT_LOG);
    base.with_file_name(format!("{name}.{n}"))
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn small_file_is_left_alone() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("daemon.log");
        fs::write(&log, "short").unwrap();
        assert!(!rotate_if_needed(&log, MAX_LOG_BYTES, MAX_ROTATED_FILES).unwrap());
        assert!(!numbered_path(&log, 1).exists());
    }

    #[test]
    fn oversized_file_rotates_to_numbered_copy() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("daemon.log");
        fs::write(&log, vec![b'x'; 2048]).unwrap();

        assert!(rotate_if_needed(&log, 1024, MAX_ROTATED_FILES).unwrap());
        assert_eq!(fs::metadata(&log).unwrap().len(), 0, "live log is fresh");
        assert_eq!(
            fs::metadata(numbered_path(&log, 1)).unwrap().len(),
            2048,
            "backup holds the old content"
        );
    }

    #[test]
    fn backups_are_capped_at_max_files() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("daemon.log");

        for round in 0..(MAX_ROTATED_FILES + 2) {
            fs::write(&log, vec![b'0' + round as u8; 2048]).unwrap();
            rotate_if_needed(&log, 1024, MAX_ROTATED_FILES).unwrap();
        }

        assert!(numbered_path(&log, MAX_ROTATED_FILES).exists());
        assert!(!numbered_path(&log, MAX_ROTATED_FILES + 1).exists());
    }

    #[test]
    fn missing_file_is_skipped() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("absent.log");
        assert!(!rotate_if_needed(&log, 1024, MAX_ROTATED_FILES).unwrap());
    }
}
