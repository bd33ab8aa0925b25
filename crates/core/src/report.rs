//! Run outcomes and error aggregation
//!
//! Run-level failures abort and propagate as a typed [`RunError`]. File- and
//! target-level failures never escape their scope; they are recorded as
//! [`SyncError`]s and surfaced in the final [`RunReport`].

use serde::{Deserialize, Serialize};

use crate::conflict::Conflict;

/// Kind of operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncOp {
    /// Local scan or cloud-tree derivation for a target
    Scan,
    /// Transfer toward the hub
    Upload,
    /// Transfer toward the local endpoint
    Download,
    /// Removal on either side
    Delete,
    /// Re-creation of a protected or not-yet-deletable file
    Restore,
    /// keep-both conflict-copy materialization
    ConflictCopy,
    /// Index document maintenance
    Index,
}

/// One failed operation, kept for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncError {
    /// Path the operation was working on
    pub path: String,
    /// What the engine was doing
    pub op: SyncOp,
    /// Human-readable cause
    pub message: String,
    /// When the failure was recorded (seconds since UNIX epoch)
    pub timestamp_secs: i64,
}

impl SyncError {
    /// Record a failure at the current time.
    #[must_use]
    pub fn new(path: impl Into<String>, op: SyncOp, message: impl ToString) -> Self {
        Self {
            path: path.into(),
            op,
            message: message.to_string(),
            timestamp_secs: crate::now_secs(),
        }
    }
}

/// User-visible summary state of a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Everything reconciled without incident
    Clean,
    /// Reconciled, but conflicts were detected
    WithConflicts,
    /// One or more per-file or per-target operations failed
    WithErrors,
}

/// Accumulated result of one sync run.
#[derive(Debug, Default)]
pub struct RunReport {
    /// Per-file and per-target failures
    pub errors: Vec<SyncError>,
    /// Conflicts detected during reconciliation
    pub conflicts: Vec<Conflict>,
    /// Files transferred toward the hub
    pub uploads: usize,
    /// Files transferred toward the local endpoint
    pub downloads: usize,
    /// Files removed (either side)
    pub deletions: usize,
    /// Restores that replaced a suppressed deletion. A restore made because
    /// the deletion predicate itself was false counts only under
    /// `uploads`/`downloads`.
    pub restores: usize,
}

impl RunReport {
    /// An empty report.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold another report fragment into this one.
    pub fn absorb(&mut self, other: RunReport) {
        self.errors.extend(other.errors);
        self.conflicts.extend(other.conflicts);
        self.uploads += other.uploads;
        self.downloads += other.downloads;
        self.deletions += other.deletions;
        self.restores += other.restores;
    }

    /// Summary state: errors dominate conflicts dominate clean.
    #[must_use]
    pub fn outcome(&self) -> RunOutcome {
        if !self.errors.is_empty() {
            RunOutcome::WithErrors
        } else if !self.conflicts.is_empty() {
            RunOutcome::WithConflicts
        } else {
            RunOutcome::Clean
        }
    }
}

/// Run-level failure. These abort the run immediately.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// Endpoint identity could not be resolved or created; nothing was
    /// locked or mutated.
    #[error("identity resolution failed: {0}")]
    Identity(String),

    /// Another run holds the lock; nothing was mutated.
    #[error("sync lock held by {holder} ({age_secs}s old)")]
    LockHeld {
        /// Endpoint id of the current holder
        holder: String,
        /// Lock age at the time of the check
        age_secs: i64,
    },

    /// Any other run-scoped failure.
    #[error(transparent)]
    Internal(#[from] color_eyre::eyre::Report),
}
