//! Chunked, verified, retrying transfer client
//!
//! Uploads negotiate a session with the hub (which may short-circuit when
//! identical content already exists), then move strictly sequential
//! 1-indexed chunks, each verified against the digest the backend echoes.
//! Failed chunks retry with linearly increasing backoff; completion tolerates
//! a bounded number of "still verifying" responses. Downloads are a single
//! resolve-and-fetch attempt.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use color_eyre::Result;
use color_eyre::eyre::bail;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use hubsync_endpoint::{CompleteStatus, LocalEndpoint, RemoteBackend, UploadNegotiation};

use crate::hash::{ContentHash, DIGEST_BLOCK_SIZE, DigestHasher};

/// Fallback upload endpoint when the negotiation returns none.
pub const DEFAULT_UPLOAD_ENDPOINT: &str = "hub://upload";

/// Tunables for chunk transfer and completion polling.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Independent timeout applied to each chunk attempt
    pub chunk_timeout: Duration,
    /// Attempts per chunk before the whole upload aborts
    pub retry_limit: u32,
    /// Backoff grows linearly: attempt number times this delay
    pub retry_base_delay: Duration,
    /// Completion polls tolerated while the backend verifies
    pub verify_poll_limit: u32,
    /// Fixed delay between completion polls
    pub verify_poll_delay: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_timeout: Duration::from_secs(30),
            retry_limit: 5,
            retry_base_delay: Duration::from_millis(250),
            verify_poll_limit: 10,
            verify_poll_delay: Duration::from_secs(1),
        }
    }
}

/// Observational progress snapshot. Chunk fields are set for uploads only.
#[derive(Debug, Clone, Copy)]
pub struct Progress {
    /// Bytes moved so far
    pub bytes_done: u64,
    /// Total bytes of the transfer
    pub bytes_total: u64,
    /// Current chunk (1-indexed), uploads only
    pub chunk_index: Option<u32>,
    /// Total chunk count, uploads only
    pub chunk_total: Option<u32>,
}

/// Progress callback; purely observational.
pub type ProgressFn = dyn Fn(&Progress) + Send + Sync;

/// Result of a finished upload.
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    /// Final object id on the hub
    pub object_id: String,
    /// Content digest of the payload
    pub digest: ContentHash,
    /// Payload size in bytes
    pub size: u64,
    /// Whether the hub already held identical content (no bytes moved)
    pub deduplicated: bool,
}

/// Client for moving file content to and from the hub.
pub struct TransferClient {
    backend: Arc<dyn RemoteBackend>,
    config: TransferConfig,
}

impl TransferClient {
    /// Create a client over a backend.
    #[must_use]
    pub fn new(backend: Arc<dyn RemoteBackend>, config: TransferConfig) -> Self {
        Self { backend, config }
    }

    /// Upload a payload under `name` into a container.
    ///
    /// When the digest or size is not already known the payload is streamed
    /// through an incremental digest in fixed-size blocks. Zero-length
    /// payloads skip chunking but still complete the session.
    ///
    /// # Errors
    /// Returns an error when negotiation fails, a chunk exhausts its retry
    /// bound, or completion polling exhausts its bound.
    pub async fn upload(
        &self,
        data: Bytes,
        name: &str,
        container_id: &str,
        known_digest: Option<ContentHash>,
        known_size: Option<u64>,
        progress: Option<&ProgressFn>,
    ) -> Result<UploadOutcome> {
        let digest = known_digest.unwrap_or_else(|| {
            let mut hasher = DigestHasher::new();
            for block in data.chunks(DIGEST_BLOCK_SIZE) {
                hasher.update(block);
            }
            hasher.finalize()
        });
        let size = known_size.unwrap_or(data.len() as u64);

        let negotiation = self
            .backend
            .negotiate_upload(name, container_id, &digest.to_hex(), size, true)
            .await?;

        let (token, chunk_size, endpoints) = match negotiation {
            UploadNegotiation::AlreadyExists { object_id } => {
                debug!(name, %digest, "content already on hub, skipping transfer");
                report(progress, size, size, None, None);
                return Ok(UploadOutcome {
                    object_id,
                    digest,
                    size,
                    deduplicated: true,
                });
            }
            UploadNegotiation::Session {
                token,
                chunk_size,
                endpoints,
            } => (token, chunk_size, endpoints),
        };

        if chunk_size == 0 {
            bail!("backend negotiated a zero chunk size for {name}");
        }
        let endpoint = endpoints
            .first()
            .map_or(DEFAULT_UPLOAD_ENDPOINT, String::as_str);

        let chunk_total = data.len().div_ceil(chunk_size) as u32;
        let mut bytes_done = 0u64;

        for (i, chunk) in data.chunks(chunk_size).enumerate() {
            let index = (i + 1) as u32;
            self.send_chunk(endpoint, &token, index, chunk).await?;

            bytes_done += chunk.len() as u64;
            report(progress, bytes_done, size, Some(index), Some(chunk_total));
        }

        let object_id = self.complete(&token, name).await?;
        Ok(UploadOutcome {
            object_id,
            digest,
            size,
            deduplicated: false,
        })
    }

    /// Submit one chunk, retrying the same chunk with linear backoff.
    async fn send_chunk(
        &self,
        endpoint: &str,
        token: &str,
        index: u32,
        chunk: &[u8],
    ) -> Result<()> {
        let chunk_digest = ContentHash::from_bytes(chunk).to_hex();
        let retry_limit = self.config.retry_limit.max(1);

        for attempt in 1..=retry_limit {
            let submit = self.backend.submit_chunk(
                endpoint,
                token,
                index,
                &chunk_digest,
                Bytes::copy_from_slice(chunk),
            );

            let failure = match timeout(self.config.chunk_timeout, submit).await {
                Ok(Ok(echoed)) if echoed == chunk_digest => return Ok(()),
                Ok(Ok(echoed)) => format!("digest mismatch: sent {chunk_digest}, got {echoed}"),
                Ok(Err(e)) => e.to_string(),
                Err(_) => "chunk attempt timed out".to_string(),
            };

            if attempt == retry_limit {
                bail!("chunk {index} failed after {attempt} attempts: {failure}");
            }

            warn!(index, attempt, "chunk attempt failed, retrying: {failure}");
            sleep(self.config.retry_base_delay * attempt).await;
        }

        unreachable!("retry loop always returns or bails");
    }

    /// Call completion, polling through transient verification delays.
    async fn complete(&self, token: &str, name: &str) -> Result<String> {
        for poll in 1..=self.config.verify_poll_limit {
            match self.backend.complete_upload(token).await? {
                CompleteStatus::Done { object_id } => return Ok(object_id),
                CompleteStatus::StillVerifying => {
                    debug!(name, poll, "hub still verifying upload");
                    if poll < self.config.verify_poll_limit {
                        sleep(self.config.verify_poll_delay).await;
                    }
                }
            }
        }

        bail!(
            "upload of {name} still verifying after {} polls",
            self.config.verify_poll_limit
        );
    }

    /// Download a whole object. Single attempt; any failure is the caller's
    /// to record.
    ///
    /// # Errors
    /// Returns an error if the location cannot be resolved or fetched.
    pub async fn download(&self, object_id: &str, progress: Option<&ProgressFn>) -> Result<Bytes> {
        let location = self.backend.resolve_download(object_id).await?;
        let data = self.backend.fetch(&location).await?;

        let total = data.len() as u64;
        report(progress, total, total, None, None);
        Ok(data)
    }

    /// Download an object and write it to the local endpoint with the
    /// caller-supplied modification time.
    ///
    /// # Errors
    /// Returns an error if the download or the local write fails.
    pub async fn download_to_local(
        &self,
        local: &dyn LocalEndpoint,
        object_id: &str,
        destination: &Path,
        modified_secs: i64,
        progress: Option<&ProgressFn>,
    ) -> Result<()> {
        let data = self.download(object_id, progress).await?;
        local.write_file(destination, &data, modified_secs).await
    }
}

fn report(
    progress: Option<&ProgressFn>,
    bytes_done: u64,
    bytes_total: u64,
    chunk_index: Option<u32>,
    chunk_total: Option<u32>,
) {
    if let Some(callback) = progress {
        callback(&Progress {
            bytes_done,
            bytes_total,
            chunk_index,
            chunk_total,
        });
    }
}
