//! Cross-device exclusive-run lock
//!
//! A well-known hub object holds the current run's holder id and timestamp.
//! A fresh lock blocks other runs; one older than the staleness threshold is
//! assumed to belong to a crashed holder and is taken over. There is no
//! renewal or heartbeat: a run that outlives the staleness window risks a
//! concurrent run treating its lock as abandoned (documented limitation).

use std::time::Duration;

use bytes::Bytes;
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use hubsync_endpoint::RemoteBackend;

use crate::report::RunError;

/// Well-known object name of the run lock.
pub const LOCK_OBJECT: &str = "hubsync-lock.json";

/// Persisted lock record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockDocument {
    /// When the lock was taken (seconds since UNIX epoch)
    pub timestamp_secs: i64,
    /// Endpoint id of the holder
    pub holder_id: String,
}

/// Acquire the run lock for `holder_id`.
///
/// # Errors
/// Returns [`RunError::LockHeld`] when a lock younger than `staleness`
/// exists; no mutation is attempted in that case. Other hub failures map to
/// [`RunError::Internal`].
pub async fn acquire(
    backend: &dyn RemoteBackend,
    holder_id: &str,
    staleness: Duration,
) -> Result<(), RunError> {
    let now = crate::now_secs();

    if let Some(bytes) = backend.get_object(LOCK_OBJECT).await? {
        match serde_json::from_slice::<LockDocument>(&bytes) {
            Ok(existing) => {
                let age_secs = now - existing.timestamp_secs;
                if age_secs < staleness.as_secs() as i64 {
                    return Err(RunError::LockHeld {
                        holder: existing.holder_id,
                        age_secs,
                    });
                }
                info!(
                    holder = %existing.holder_id,
                    age_secs,
                    "taking over stale run lock"
                );
            }
            Err(e) => {
                // A lock nobody can read protects nobody
                warn!("unparseable run lock, taking over: {e}");
            }
        }
        backend.delete_object(LOCK_OBJECT).await?;
    }

    let document = LockDocument {
        timestamp_secs: now,
        holder_id: holder_id.to_string(),
    };
    let bytes = serde_json::to_vec(&document).map_err(color_eyre::eyre::Report::from)?;
    backend.put_object(LOCK_OBJECT, Bytes::from(bytes)).await?;
    Ok(())
}

/// Release the run lock. Best-effort: failures are logged, never escalated;
/// the staleness check in [`acquire`] is the real safety net.
pub async fn release(backend: &dyn RemoteBackend) {
    if let Err(e) = backend.delete_object(LOCK_OBJECT).await {
        warn!("failed to release run lock (will go stale): {e}");
    }
}
