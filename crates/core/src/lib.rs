//! hubsync-core: Sync engine between a local endpoint and a remote storage hub
//!
//! Provides tree diff/merge, pairwise sync-history tracking, conflict
//! detection and resolution policy, a remote-authoritative file index, a
//! cross-device run lock, a chunked verified transfer client, and the run
//! orchestrator that ties them together.

pub mod conflict;
pub mod hash;
pub mod history;
pub mod identity;
pub mod index;
pub mod lock;
pub mod orchestrator;
pub mod report;
pub mod target;
pub mod transfer;
pub mod tree;

pub use conflict::{Conflict, ConflictStrategy, Resolution};
pub use hash::{ContentHash, DigestHasher};
pub use history::SyncHistory;
pub use identity::EndpointIdentity;
pub use index::{IndexEntry, RemoteIndexDocument, RemoteIndexStore};
pub use orchestrator::{SyncConfig, SyncOrchestrator};
pub use report::{RunError, RunOutcome, RunReport, SyncError, SyncOp};
pub use target::TargetSpec;
pub use transfer::{Progress, TransferClient, TransferConfig};
pub use tree::StorageNode;

/// Current wall-clock time in seconds since the UNIX epoch.
#[must_use]
pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
