//! Domain types for the Opas pipeline.
//!
//! All path fields use `PathBuf`; never `&str` or `String` for filesystem paths.
//! All types are serializable/deserializable via serde + serde_yaml.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// A strongly-typed identifier for one pipeline run.
///
/// Formatted as a compact UTC stamp (`20260827T033000Z`) so run ids sort
/// chronologically as plain strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    /// Run id for the current instant.
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    /// Run id for an explicit timestamp (used in tests and replay).
    pub fn from_datetime(ts: DateTime<Utc>) -> Self {
        Self(ts.format("%Y%m%dT%H%M%SZ").to_string())
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for RunId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// A strongly-typed key for an archived cache generation in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey(pub String);

impl CacheKey {
    /// The per-run key: `<prefix>-<run_id>`.
    ///
    /// The trailing `-` after the prefix is what fallback-prefix matching
    /// keys on, so an exact miss still finds prior generations of the same
    /// cache lineage.
    pub fn for_run(prefix: &str, run: &RunId) -> Self {
        Self(format!("{prefix}-{run}"))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for CacheKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
