//! Per-subtree sync policy

use serde::{Deserialize, Serialize};

/// Sync policy for one directory subtree. Supplied by the caller; the engine
/// never mutates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetSpec {
    /// Subtree root relative to the sync root; `"."` selects the whole
    /// namespace
    pub path: String,
    /// Excluded entry names or target-relative path prefixes
    #[serde(default)]
    pub exclusions: Vec<String>,
    /// Replace every deletion with a restore of the missing side
    #[serde(default)]
    pub avoid_deletions: bool,
    /// File deletions become restores. The index tracks leaf files only and
    /// directories are never deleted through sync, so this protects every
    /// deletion the engine can perform.
    #[serde(default)]
    pub delete_folders_only: bool,
    /// Only reconcile paths absent from one side; skip files present on both
    #[serde(default)]
    pub only_if_missing: bool,
    /// Run conflict detection/resolution for this subtree
    #[serde(default)]
    pub track_conflicts: bool,
}

impl TargetSpec {
    /// A target with no exclusions and all flags off.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            exclusions: Vec::new(),
            avoid_deletions: false,
            delete_folders_only: false,
            only_if_missing: false,
            track_conflicts: false,
        }
    }

    /// Whether an entry is excluded. Matches either the bare entry name or a
    /// prefix of the target-relative path.
    #[must_use]
    pub fn is_excluded(&self, name: &str, relative_path: &str) -> bool {
        self.exclusions.iter().any(|pattern| {
            pattern == name
                || relative_path == pattern
                || relative_path.starts_with(&format!("{pattern}/"))
        })
    }

    /// Whether deleting a file at this path is allowed under the target's
    /// flags. Only leaf files ever reach the deletion branch.
    #[must_use]
    pub fn allows_deletion(&self) -> bool {
        !self.avoid_deletions && !self.delete_folders_only
    }
}
