//! Pipeline configuration document.
//!
//! # Storage layout
//!
//! ```text
//! ~/.opas/
//!   config.yaml     (pipeline config — mode 0600, created by `opas init`)
//!   cache.db        (live cache blob handed to the fetch script)
//!   store/          (archived cache generations + manifest)
//! ```
//!
//! # API pattern
//!
//! Every function touching the config has two forms:
//! - `fn_at(home: &Path, …)` — explicit home; used in tests with `TempDir`
//! - `fn(…)` — derives home from `dirs::home_dir()`, delegates to `_at`
//!
//! Tests must NEVER call the no-arg wrappers; always use `_at`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

/// Root of the Opas YAML config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub version: u32,
    /// Absolute path to the git repository the snapshot is published into.
    pub repo: PathBuf,
    /// Output directory for the schedule snapshot, relative to `repo`.
    pub output_dir: PathBuf,
    pub fetch: FetchConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub publish: PublishConfig,
}

/// How to invoke the external fetch script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Program to run (absolute path, or resolved via `$PATH`).
    pub program: PathBuf,
    /// Extra arguments passed before the output-directory flag.
    #[serde(default)]
    pub args: Vec<String>,
    /// Flag used to hand the staging directory to the script.
    #[serde(default = "default_output_flag")]
    pub output_flag: String,
}

/// Cache blob + archive store settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Live blob path, defaults to `~/.opas/cache.db`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blob: Option<PathBuf>,
    /// Archive store directory, defaults to `~/.opas/store`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_dir: Option<PathBuf>,
    /// Key prefix; the per-run key is `<prefix>-<run_id>`.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Archived generations to retain; older ones are pruned on save.
    #[serde(default = "default_keep")]
    pub keep: usize,
}

/// Daily trigger settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Daily fire time, `HH:MM` 24-hour UTC.
    #[serde(default = "default_fire_time")]
    pub at: String,
}

/// Commit/push settings for the publisher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishConfig {
    #[serde(default = "default_remote")]
    pub remote: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default = "default_author_name")]
    pub author_name: String,
    #[serde(default = "default_author_email")]
    pub author_email: String,
    /// Leading words of the commit subject; run date is appended.
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,
    /// Marker appended to every commit message so the external runner's
    /// trigger filter ignores automated commits.
    #[serde(default = "default_skip_marker")]
    pub skip_marker: String,
    /// Push after committing. Disable for repositories without a remote.
    #[serde(default = "default_push")]
    pub push: bool,
}

fn default_output_flag() -> String {
    "--output-dir".to_string()
}

fn default_key_prefix() -> String {
    "schedule-cache".to_string()
}

fn default_keep() -> usize {
    5
}

fn default_fire_time() -> String {
    "03:30".to_string()
}

fn default_remote() -> String {
    "origin".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_author_name() -> String {
    "opas-bot".to_string()
}

fn default_author_email() -> String {
    "opas-bot@users.noreply.invalid".to_string()
}

fn default_subject_prefix() -> String {
    "Update schedule for".to_string()
}

fn default_skip_marker() -> String {
    "[skip ci]".to_string()
}

fn default_push() -> bool {
    true
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            blob: None,
            store_dir: None,
            key_prefix: default_key_prefix(),
            keep: default_keep(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            at: default_fire_time(),
        }
    }
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            remote: default_remote(),
            branch: default_branch(),
            author_name: default_author_name(),
            author_email: default_author_email(),
            subject_prefix: default_subject_prefix(),
            skip_marker: default_skip_marker(),
            push: default_push(),
        }
    }
}

impl PipelineConfig {
    /// A fresh config for `repo` with all defaults; used by `opas init`.
    pub fn new(repo: PathBuf, output_dir: PathBuf, program: PathBuf) -> Self {
        Self {
            version: 1,
            repo,
            output_dir,
            fetch: FetchConfig {
                program,
                args: Vec::new(),
                output_flag: default_output_flag(),
            },
            cache: CacheConfig::default(),
            schedule: ScheduleConfig::default(),
            publish: PublishConfig::default(),
        }
    }

    /// Absolute path of the snapshot output directory.
    pub fn output_path(&self) -> PathBuf {
        self.repo.join(&self.output_dir)
    }

    /// Live cache blob path, falling back to `<home>/.opas/cache.db`.
    pub fn blob_path_at(&self, home: &Path) -> PathBuf {
        self.cache
            .blob
            .clone()
            .unwrap_or_else(|| opas_root_at(home).join("cache.db"))
    }

    /// Archive store directory, falling back to `<home>/.opas/store`.
    pub fn store_dir_at(&self, home: &Path) -> PathBuf {
        self.cache
            .store_dir
            .clone()
            .unwrap_or_else(|| opas_root_at(home).join("store"))
    }

    /// Parsed daily fire time as `(hour, minute)`.
    pub fn fire_time(&self) -> Result<(u32, u32), ConfigError> {
        parse_fire_time(&self.schedule.at)
    }
}

/// Parse `HH:MM` (24-hour) into `(hour, minute)`.
pub fn parse_fire_time(value: &str) -> Result<(u32, u32), ConfigError> {
    let invalid = || ConfigError::InvalidFireTime {
        value: value.to_string(),
    };
    let (h, m) = value.split_once(':').ok_or_else(invalid)?;
    // Exactly two digits each; u32::from_str would also admit a leading sign.
    if h.len() != 2 || m.len() != 2 || !h.chars().chain(m.chars()).all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let hour: u32 = h.parse().map_err(|_| invalid())?;
    let minute: u32 = m.parse().map_err(|_| invalid())?;
    if hour > 23 || minute > 59 {
        return Err(invalid());
    }
    Ok((hour, minute))
}

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

/// `<home>/.opas/`
pub fn opas_root_at(home: &Path) -> PathBuf {
    home.join(".opas")
}

/// `<home>/.opas/config.yaml` — pure, no I/O.
pub fn config_path_at(home: &Path) -> PathBuf {
    opas_root_at(home).join("config.yaml")
}

fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Load the config from `<home>/.opas/config.yaml`.
///
/// Returns `ConfigError::ConfigNotFound` if absent,
/// `ConfigError::Parse` (with path + line context) if malformed YAML.
pub fn load_at(home: &Path) -> Result<PipelineConfig, ConfigError> {
    let path = config_path_at(home);
    if !path.exists() {
        return Err(ConfigError::ConfigNotFound { path });
    }
    let contents = std::fs::read_to_string(&path)?;
    serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse { path, source: e })
}

/// `load_at` convenience wrapper.
pub fn load() -> Result<PipelineConfig, ConfigError> {
    load_at(&home()?)
}

// ---------------------------------------------------------------------------
// Save (atomic)
// ---------------------------------------------------------------------------

/// Atomically save the config to `<home>/.opas/config.yaml`.
///
/// Write flow: serialize → `.yaml.tmp` sibling → `chmod 0600` → `rename`.
/// `.tmp` is always in the same directory as the target (same filesystem — no EXDEV on macOS).
pub fn save_at(home: &Path, config: &PipelineConfig) -> Result<(), ConfigError> {
    // Reject an unparseable fire time up front rather than at 03:30 tomorrow.
    config.fire_time()?;

    let root = opas_root_at(home);
    if !root.exists() {
        std::fs::create_dir_all(&root)?;
        set_dir_permissions(&root)?;
    }

    let path = config_path_at(home);
    let tmp_path = path.with_extension("yaml.tmp");

    let yaml = serde_yaml::to_string(config)?;
    std::fs::write(&tmp_path, yaml)?;
    set_file_permissions(&tmp_path)?;
    std::fs::rename(&tmp_path, &path)?;
    Ok(())
}

/// `save_at` convenience wrapper.
pub fn save(config: &PipelineConfig) -> Result<(), ConfigError> {
    save_at(&home()?, config)
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
