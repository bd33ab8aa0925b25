//! hubsync-endpoint: Endpoint boundary for hubsync
//!
//! Defines the two external collaborators the sync engine drives: the local
//! filesystem (`LocalEndpoint`) and the remote storage hub (`RemoteBackend`).
//! Ships a real filesystem endpoint and an in-memory hub for testing.

pub mod fs;
pub mod memory;

pub use fs::FsEndpoint;
pub use memory::MemoryHub;

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use color_eyre::Result;

/// One entry from a local directory listing.
#[derive(Debug, Clone)]
pub struct LocalEntry {
    /// Entry name (single path component)
    pub name: String,
    /// Whether this entry is a directory
    pub is_dir: bool,
    /// Modification time (seconds since UNIX epoch)
    pub modified_secs: i64,
    /// Size in bytes (0 for directories)
    pub size: u64,
}

/// The local side of a sync pair.
///
/// Paths are relative to the endpoint root. No random access or partial
/// writes are required; whole files move as single byte buffers.
#[async_trait]
pub trait LocalEndpoint: Send + Sync {
    /// List the entries of a directory.
    async fn list_dir(&self, path: &Path) -> Result<Vec<LocalEntry>>;

    /// Read a whole file.
    async fn read_file(&self, path: &Path) -> Result<Bytes>;

    /// Write a whole file, creating parent directories, and stamp it with
    /// the given modification time.
    async fn write_file(&self, path: &Path, data: &[u8], modified_secs: i64) -> Result<()>;

    /// Create a directory (and any missing parents).
    async fn create_dir(&self, path: &Path) -> Result<()>;

    /// Remove a file or directory tree.
    async fn remove(&self, path: &Path) -> Result<()>;

    /// Check whether a path exists.
    async fn exists(&self, path: &Path) -> Result<bool>;
}

/// One child entry from a hub container listing.
#[derive(Debug, Clone)]
pub struct RemoteChild {
    /// Object or container name within its parent
    pub name: String,
    /// Backend object id
    pub id: String,
    /// Whether this child is a container
    pub is_dir: bool,
    /// Size in bytes (0 for containers)
    pub size: u64,
    /// Content digest, if the backend recorded one
    pub digest: Option<String>,
    /// Modification time (seconds since UNIX epoch)
    pub modified_secs: i64,
    /// Whether the object is trashed (recoverable delete)
    pub trashed: bool,
}

/// Outcome of an upload negotiation.
#[derive(Debug, Clone)]
pub enum UploadNegotiation {
    /// The hub already holds identical content; no bytes need to move.
    AlreadyExists {
        /// Id of the existing object
        object_id: String,
    },
    /// A chunked transfer session was opened.
    Session {
        /// Opaque session token, passed with every chunk
        token: String,
        /// Chunk size the backend expects
        chunk_size: usize,
        /// Candidate upload endpoint addresses (may be empty)
        endpoints: Vec<String>,
    },
}

/// Outcome of a completion call.
#[derive(Debug, Clone)]
pub enum CompleteStatus {
    /// The backend is still assembling/verifying the object; poll again.
    StillVerifying,
    /// The object is committed.
    Done {
        /// Final object id
        object_id: String,
    },
}

/// The remote storage hub.
///
/// Alongside file objects, the hub stores the engine's well-known documents
/// (identity records, sync histories, the run lock, the file index) through
/// the `*_object` methods.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// List the non-trashed children of a container.
    async fn list_children(&self, container_id: &str) -> Result<Vec<RemoteChild>>;

    /// Create a container and return its id.
    async fn create_container(&self, parent_id: &str, name: &str) -> Result<String>;

    /// Trash the given object ids (recoverable).
    async fn delete(&self, ids: &[String]) -> Result<()>;

    /// Resolve a short-lived download location for an object.
    async fn resolve_download(&self, id: &str) -> Result<String>;

    /// Fetch the bytes behind a previously resolved download location.
    async fn fetch(&self, location: &str) -> Result<Bytes>;

    /// Open (or short-circuit) an upload of `size` bytes with the given
    /// content digest into a container.
    async fn negotiate_upload(
        &self,
        name: &str,
        container_id: &str,
        digest: &str,
        size: u64,
        overwrite: bool,
    ) -> Result<UploadNegotiation>;

    /// Submit one 1-indexed chunk; returns the digest the backend computed
    /// for the received bytes, which the caller must compare to its own.
    async fn submit_chunk(
        &self,
        endpoint: &str,
        token: &str,
        index: u32,
        digest: &str,
        data: Bytes,
    ) -> Result<String>;

    /// Finish an upload session.
    async fn complete_upload(&self, token: &str) -> Result<CompleteStatus>;

    /// Read a well-known object, or `None` if absent.
    async fn get_object(&self, name: &str) -> Result<Option<Bytes>>;

    /// Write (create or overwrite) a well-known object.
    async fn put_object(&self, name: &str, data: Bytes) -> Result<()>;

    /// Delete a well-known object. Deleting an absent object is not an error.
    async fn delete_object(&self, name: &str) -> Result<()>;
}
