//! Pairwise sync-history tracking
//!
//! Each endpoint keeps one well-known hub object mapping peer id to the
//! epoch second of the last successful sync with that peer. A value of 0
//! (or an absent peer) means "never synced", distinct from any real time.

use std::collections::HashMap;

use bytes::Bytes;
use color_eyre::Result;
use color_eyre::eyre::WrapErr as _;
use serde::{Deserialize, Serialize};

use hubsync_endpoint::RemoteBackend;

/// An endpoint's view of its pairwise sync times.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncHistory {
    peers: HashMap<String, i64>,
}

impl SyncHistory {
    /// Create an empty history (never synced with anyone).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Last successful sync time with a peer, or 0 if never synced.
    #[must_use]
    pub fn last_sync_with(&self, peer_id: &str) -> i64 {
        self.peers.get(peer_id).copied().unwrap_or(0)
    }

    /// Most recent sync time across all peers, or 0 if never synced.
    #[must_use]
    pub fn most_recent_sync(&self) -> i64 {
        self.peers.values().copied().max().unwrap_or(0)
    }

    /// Record a successful sync with a peer.
    pub fn record_sync(&mut self, peer_id: impl Into<String>, when_secs: i64) {
        self.peers.insert(peer_id.into(), when_secs);
    }

    /// Well-known object name for an endpoint's history document.
    #[must_use]
    pub fn object_name(endpoint_id: &str) -> String {
        format!("hubsync-history-{endpoint_id}.json")
    }

    /// Load an endpoint's history from the hub, or an empty history if the
    /// document does not exist yet.
    ///
    /// # Errors
    /// Returns an error if the document exists but cannot be read or parsed.
    pub async fn load(backend: &dyn RemoteBackend, endpoint_id: &str) -> Result<Self> {
        let name = Self::object_name(endpoint_id);
        match backend.get_object(&name).await? {
            None => Ok(Self::new()),
            Some(bytes) => serde_json::from_slice(&bytes)
                .wrap_err_with(|| format!("failed to parse sync history {name}")),
        }
    }

    /// Persist this history as the endpoint's well-known hub object.
    ///
    /// # Errors
    /// Returns an error if serialization or the hub write fails.
    pub async fn persist(&self, backend: &dyn RemoteBackend, endpoint_id: &str) -> Result<()> {
        let bytes = serde_json::to_vec(self)?;
        backend
            .put_object(&Self::object_name(endpoint_id), Bytes::from(bytes))
            .await
    }
}
