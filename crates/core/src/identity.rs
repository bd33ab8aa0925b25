//! Endpoint identity resolution
//!
//! Each side of a sync pair is identified by a persisted unique id, created
//! on first contact and read on every later run. Identity failures abort a
//! run before anything is locked or mutated.

use bytes::Bytes;
use rand::RngCore as _;
use serde::{Deserialize, Serialize};
use tracing::info;

use hubsync_endpoint::RemoteBackend;

use crate::report::RunError;

/// One side of the sync pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointIdentity {
    /// Persisted unique id
    pub id: String,
}

impl EndpointIdentity {
    /// Well-known object name for a role's identity record.
    #[must_use]
    pub fn object_name(role: &str) -> String {
        format!("hubsync-identity-{role}.json")
    }

    /// Load the identity for a role, minting and persisting a fresh one the
    /// first time.
    ///
    /// # Errors
    /// Returns [`RunError::Identity`] if the record cannot be read, parsed,
    /// or created.
    pub async fn resolve(backend: &dyn RemoteBackend, role: &str) -> Result<Self, RunError> {
        let name = Self::object_name(role);

        let existing = backend
            .get_object(&name)
            .await
            .map_err(|e| RunError::Identity(e.to_string()))?;

        if let Some(bytes) = existing {
            return serde_json::from_slice(&bytes)
                .map_err(|e| RunError::Identity(format!("corrupt identity record {name}: {e}")));
        }

        let identity = Self { id: mint_id() };
        let bytes = serde_json::to_vec(&identity)
            .map_err(|e| RunError::Identity(e.to_string()))?;
        backend
            .put_object(&name, Bytes::from(bytes))
            .await
            .map_err(|e| RunError::Identity(e.to_string()))?;

        info!(role, id = %identity.id, "minted new endpoint identity");
        Ok(identity)
    }
}

fn mint_id() -> String {
    let mut raw = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut raw);
    hex::encode(raw)
}
