//! In-memory hub backend for testing
//!
//! Simulates the remote storage hub entirely in process: containers, chunked
//! upload sessions with digest echoes, trash-style deletes, and well-known
//! objects. Failure injection knobs let tests script chunk errors, digest
//! corruption, and "still verifying" completion responses.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use color_eyre::Result;
use color_eyre::eyre::{bail, eyre};

use crate::{CompleteStatus, RemoteBackend, RemoteChild, UploadNegotiation};

/// Root container id every fresh hub starts with.
pub const ROOT_CONTAINER: &str = "root";

const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn digest_hex(data: &[u8]) -> String {
    hex::encode(blake3::hash(data).as_bytes())
}

#[derive(Debug, Clone)]
struct StoredObject {
    id: String,
    name: String,
    container: String,
    data: Bytes,
    digest: String,
    modified_secs: i64,
    trashed: bool,
}

#[derive(Debug)]
struct UploadState {
    name: String,
    container: String,
    digest: String,
    size: u64,
    next_index: u32,
    received: Vec<Bytes>,
}

#[derive(Default)]
struct HubState {
    objects: HashMap<String, StoredObject>,
    containers: HashMap<String, (String, String)>, // id -> (parent, name)
    sessions: HashMap<String, UploadState>,
    well_known: HashMap<String, Bytes>,
}

/// In-memory remote backend.
pub struct MemoryHub {
    state: Mutex<HubState>,
    next_id: AtomicU64,
    chunk_size: usize,
    /// Remaining submit_chunk calls that fail with an error
    fail_chunks: AtomicU32,
    /// Remaining submit_chunk calls that echo a corrupted digest
    corrupt_chunks: AtomicU32,
    /// Remaining complete_upload calls that answer StillVerifying
    verify_polls: AtomicU32,
}

impl MemoryHub {
    /// Create an empty hub with the default chunk size.
    #[must_use]
    pub fn new() -> Self {
        Self::with_chunk_size(DEFAULT_CHUNK_SIZE)
    }

    /// Create an empty hub that negotiates the given chunk size.
    #[must_use]
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        let mut state = HubState::default();
        state
            .containers
            .insert(ROOT_CONTAINER.to_string(), (String::new(), "/".to_string()));

        Self {
            state: Mutex::new(state),
            next_id: AtomicU64::new(1),
            chunk_size,
            fail_chunks: AtomicU32::new(0),
            corrupt_chunks: AtomicU32::new(0),
            verify_polls: AtomicU32::new(0),
        }
    }

    /// Make the next `n` chunk submissions fail with an error.
    pub fn fail_next_chunks(&self, n: u32) {
        self.fail_chunks.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` chunk submissions echo a corrupted digest.
    pub fn corrupt_next_chunks(&self, n: u32) {
        self.corrupt_chunks.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` completion calls answer "still verifying".
    pub fn delay_verification(&self, n: u32) {
        self.verify_polls.store(n, Ordering::SeqCst);
    }

    fn mint_id(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Test helper: bytes of a non-trashed object by container and name.
    #[must_use]
    pub fn object_content(&self, container_id: &str, name: &str) -> Option<Bytes> {
        let state = self.state.lock().unwrap();
        state
            .objects
            .values()
            .find(|o| o.container == container_id && o.name == name && !o.trashed)
            .map(|o| o.data.clone())
    }

    /// Test helper: whether any in-flight upload session exists.
    #[must_use]
    pub fn has_open_sessions(&self) -> bool {
        !self.state.lock().unwrap().sessions.is_empty()
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteBackend for MemoryHub {
    async fn list_children(&self, container_id: &str) -> Result<Vec<RemoteChild>> {
        let state = self.state.lock().unwrap();
        if !state.containers.contains_key(container_id) {
            bail!("no such container: {container_id}");
        }

        let mut children: Vec<RemoteChild> = state
            .objects
            .values()
            .filter(|o| o.container == container_id && !o.trashed)
            .map(|o| RemoteChild {
                name: o.name.clone(),
                id: o.id.clone(),
                is_dir: false,
                size: o.data.len() as u64,
                digest: Some(o.digest.clone()),
                modified_secs: o.modified_secs,
                trashed: o.trashed,
            })
            .collect();

        children.extend(
            state
                .containers
                .iter()
                .filter(|(_, (parent, _))| parent == container_id)
                .map(|(id, (_, name))| RemoteChild {
                    name: name.clone(),
                    id: id.clone(),
                    is_dir: true,
                    size: 0,
                    digest: None,
                    modified_secs: 0,
                    trashed: false,
                }),
        );

        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }

    async fn create_container(&self, parent_id: &str, name: &str) -> Result<String> {
        let id = self.mint_id("dir");
        let mut state = self.state.lock().unwrap();
        if !state.containers.contains_key(parent_id) {
            bail!("no such container: {parent_id}");
        }
        state
            .containers
            .insert(id.clone(), (parent_id.to_string(), name.to_string()));
        Ok(id)
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        for id in ids {
            if let Some(object) = state.objects.get_mut(id) {
                object.trashed = true;
            }
        }
        Ok(())
    }

    async fn resolve_download(&self, id: &str) -> Result<String> {
        let state = self.state.lock().unwrap();
        if !state.objects.contains_key(id) {
            bail!("no such object: {id}");
        }
        Ok(format!("mem://{id}"))
    }

    async fn fetch(&self, location: &str) -> Result<Bytes> {
        let id = location
            .strip_prefix("mem://")
            .ok_or_else(|| eyre!("unresolvable location: {location}"))?;
        let state = self.state.lock().unwrap();
        let object = state
            .objects
            .get(id)
            .ok_or_else(|| eyre!("no such object: {id}"))?;
        Ok(object.data.clone())
    }

    async fn negotiate_upload(
        &self,
        name: &str,
        container_id: &str,
        digest: &str,
        size: u64,
        overwrite: bool,
    ) -> Result<UploadNegotiation> {
        let token = self.mint_id("session");
        let mut state = self.state.lock().unwrap();

        if let Some(existing) = state
            .objects
            .values()
            .find(|o| o.container == container_id && o.name == name && !o.trashed)
        {
            // Dedup fast path: identical content already present
            if existing.digest == digest {
                return Ok(UploadNegotiation::AlreadyExists {
                    object_id: existing.id.clone(),
                });
            }
            if !overwrite {
                bail!("object exists and overwrite is disabled: {name}");
            }
        }

        state.sessions.insert(
            token.clone(),
            UploadState {
                name: name.to_string(),
                container: container_id.to_string(),
                digest: digest.to_string(),
                size,
                next_index: 1,
                received: Vec::new(),
            },
        );

        Ok(UploadNegotiation::Session {
            token,
            chunk_size: self.chunk_size,
            endpoints: vec!["mem://upload".to_string()],
        })
    }

    async fn submit_chunk(
        &self,
        _endpoint: &str,
        token: &str,
        index: u32,
        _digest: &str,
        data: Bytes,
    ) -> Result<String> {
        if take_one(&self.fail_chunks) {
            bail!("injected chunk failure");
        }

        let echoed = if take_one(&self.corrupt_chunks) {
            digest_hex(b"corrupted")
        } else {
            digest_hex(&data)
        };

        let mut state = self.state.lock().unwrap();
        let session = state
            .sessions
            .get_mut(token)
            .ok_or_else(|| eyre!("no such session: {token}"))?;

        if index == session.next_index {
            session.next_index += 1;
            session.received.push(data);
        } else if index + 1 == session.next_index && !session.received.is_empty() {
            // A retry of the most recent chunk replaces what was stored, so
            // a client that saw a bad digest echo can resubmit the same index
            let last = session.received.len() - 1;
            session.received[last] = data;
        } else {
            bail!(
                "out-of-order chunk: expected {}, got {index}",
                session.next_index
            );
        }
        Ok(echoed)
    }

    async fn complete_upload(&self, token: &str) -> Result<CompleteStatus> {
        if take_one(&self.verify_polls) {
            return Ok(CompleteStatus::StillVerifying);
        }

        let mut state = self.state.lock().unwrap();
        let session = state
            .sessions
            .remove(token)
            .ok_or_else(|| eyre!("no such session: {token}"))?;

        let assembled: Vec<u8> = session.received.iter().flat_map(|b| b.to_vec()).collect();
        if assembled.len() as u64 != session.size {
            bail!(
                "incomplete upload: expected {} bytes, got {}",
                session.size,
                assembled.len()
            );
        }
        if digest_hex(&assembled) != session.digest {
            bail!("content digest mismatch on completion");
        }

        // Committing replaces any previous object under the same name
        let replaced: Option<String> = state
            .objects
            .values()
            .find(|o| o.container == session.container && o.name == session.name && !o.trashed)
            .map(|o| o.id.clone());
        if let Some(old_id) = replaced {
            state.objects.remove(&old_id);
        }

        drop(state);
        let id = self.mint_id("obj");
        let mut state = self.state.lock().unwrap();
        state.objects.insert(
            id.clone(),
            StoredObject {
                id: id.clone(),
                name: session.name,
                container: session.container,
                data: Bytes::from(assembled),
                digest: session.digest,
                modified_secs: now_secs(),
                trashed: false,
            },
        );

        Ok(CompleteStatus::Done { object_id: id })
    }

    async fn get_object(&self, name: &str) -> Result<Option<Bytes>> {
        Ok(self.state.lock().unwrap().well_known.get(name).cloned())
    }

    async fn put_object(&self, name: &str, data: Bytes) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .well_known
            .insert(name.to_string(), data);
        Ok(())
    }

    async fn delete_object(&self, name: &str) -> Result<()> {
        self.state.lock().unwrap().well_known.remove(name);
        Ok(())
    }
}

/// Decrement a scripted-failure budget, returning true while it lasts.
fn take_one(budget: &AtomicU32) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}
