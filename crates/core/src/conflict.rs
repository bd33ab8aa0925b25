//! Conflict detection and resolution policy
//!
//! A path is in conflict when both sides modified it since their last mutual
//! sync point and the timestamps differ. Detection is a pure function over
//! the two timestamps and both endpoints' histories; the `keep-both`
//! strategy is the only resolution with a side effect (materializing the
//! older version under a derived name), which the orchestrator performs.

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::history::SyncHistory;

/// Policy for resolving detected conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictStrategy {
    /// No special action; the newer-wins comparison decides direction.
    KeepNewer,
    /// Skip the path entirely; neither side is transferred.
    KeepLocal,
    /// Proceed with the sync. Note: this does not force the remote version
    /// to win; direction still falls to the newer-wins comparison.
    KeepRemote,
    /// Materialize the older version as a renamed copy, then let newer-wins
    /// populate the canonical path.
    KeepBoth,
}

/// What the orchestrator should do with a detected conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Continue into the newer-wins comparison.
    Proceed,
    /// Do not sync this path.
    Skip,
    /// Copy the older side to its conflict name, then proceed.
    MaterializeOlderCopy,
}

/// A detected conflict, kept for the run report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    /// Path of the conflicting file
    pub path: String,
    /// Local modification time (epoch seconds)
    pub local_secs: i64,
    /// Cloud modification time (epoch seconds)
    pub cloud_secs: i64,
    /// Strategy applied to it
    pub strategy: ConflictStrategy,
}

/// Decide whether a path is in conflict.
///
/// No conflict when the two sides have never synced with each other (both
/// histories report 0), or when the timestamps are equal. Otherwise the
/// path conflicts iff each side changed after its last sync with the other.
#[must_use]
pub fn detect_conflict(
    local_secs: i64,
    cloud_secs: i64,
    local_history: &SyncHistory,
    cloud_history: &SyncHistory,
    local_id: &str,
    cloud_id: &str,
) -> bool {
    let local_last = local_history.last_sync_with(cloud_id);
    let cloud_last = cloud_history.last_sync_with(local_id);

    if local_last == 0 && cloud_last == 0 {
        return false;
    }
    if local_secs == cloud_secs {
        return false;
    }

    local_secs > local_last && cloud_secs > cloud_last
}

/// Map a strategy to its resolution for a detected conflict.
#[must_use]
pub fn resolve(strategy: ConflictStrategy) -> Resolution {
    match strategy {
        ConflictStrategy::KeepNewer | ConflictStrategy::KeepRemote => Resolution::Proceed,
        ConflictStrategy::KeepLocal => Resolution::Skip,
        ConflictStrategy::KeepBoth => Resolution::MaterializeOlderCopy,
    }
}

/// Derive the conflict-copy path for `keep-both`.
///
/// The name embeds the older version's timestamp at second precision, so
/// re-running an unresolved conflict derives the same name and overwrites
/// the earlier copy instead of accumulating duplicates.
#[must_use]
pub fn conflict_copy_path(path: &str, older_secs: i64) -> String {
    let stamp = Utc
        .timestamp_opt(older_secs, 0)
        .single()
        .unwrap_or_default()
        .format("%Y-%m-%d %H-%M-%S");

    let (dir, file) = match path.rsplit_once('/') {
        Some((dir, file)) => (Some(dir), file),
        None => (None, path),
    };

    let renamed = match file.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem} (conflict {stamp}).{ext}"),
        _ => format!("{file} (conflict {stamp})"),
    };

    match dir {
        Some(dir) => format!("{dir}/{renamed}"),
        None => renamed,
    }
}
