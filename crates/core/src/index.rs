//! Remote-authoritative file index
//!
//! The hub keeps one versioned document describing every file it holds, so
//! runs avoid repeated remote listings. The document is fetched once per run
//! and cached; every mutation rewrites the whole document under its
//! well-known name. Concurrent-run correctness comes from the run lock, not
//! from this store. Entries cover leaf files only; directories are inferred
//! from path structure.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use hubsync_endpoint::RemoteBackend;

use crate::hash::ContentHash;
use crate::tree::StorageNode;

/// Well-known object name of the index document.
pub const INDEX_OBJECT: &str = "hubsync-index.json";

/// Document version this engine reads and writes. Any other version on the
/// hub is treated as absent.
pub const INDEX_VERSION: u32 = 1;

/// The hub's record of one remote file object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Logical path relative to the sync root
    pub path: String,
    /// Encoded object name the hub stores the file under
    pub encoded_name: String,
    /// Backend object id
    pub remote_id: String,
    /// Content digest (hex)
    pub digest: String,
    /// Size in bytes
    pub size: u64,
    /// Modification time (seconds since UNIX epoch)
    pub modified_secs: i64,
}

/// The whole hub index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteIndexDocument {
    /// Format version; a mismatch invalidates the whole document
    pub version: u32,
    /// Last persist time (seconds since UNIX epoch)
    pub last_updated: i64,
    /// Hub endpoint id this index belongs to
    pub owner_id: String,
    /// Entries keyed by logical path
    pub entries: HashMap<String, IndexEntry>,
}

impl RemoteIndexDocument {
    /// An empty document owned by the given endpoint.
    #[must_use]
    pub fn empty(owner_id: impl Into<String>) -> Self {
        Self {
            version: INDEX_VERSION,
            last_updated: 0,
            owner_id: owner_id.into(),
            entries: HashMap::new(),
        }
    }
}

/// Encode a logical path into a flat hub object name. Path separators (and
/// the escape character itself) are percent-encoded so one container can
/// hold the whole hierarchy.
#[must_use]
pub fn encode_remote_name(path: &str) -> String {
    path.replace('%', "%25").replace('/', "%2F")
}

/// Cached, run-scoped view of the hub index.
pub struct RemoteIndexStore {
    backend: Arc<dyn RemoteBackend>,
    doc: RemoteIndexDocument,
}

impl RemoteIndexStore {
    /// Create a store with an empty cache; call [`load`](Self::load) before
    /// reading.
    #[must_use]
    pub fn new(backend: Arc<dyn RemoteBackend>) -> Self {
        Self {
            doc: RemoteIndexDocument::empty(""),
            backend,
        }
    }

    /// Fetch and cache the index document, binding it to the hub identity.
    ///
    /// A missing object, an unparseable document, or a version mismatch all
    /// yield an empty index: "hub empty" is a valid, safe state downstream.
    pub async fn load(&mut self, owner_id: &str) -> Result<()> {
        let doc = match self.backend.get_object(INDEX_OBJECT).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<RemoteIndexDocument>(&bytes) {
                Ok(doc) if doc.version == INDEX_VERSION => Some(doc),
                Ok(doc) => {
                    warn!(
                        found = doc.version,
                        expected = INDEX_VERSION,
                        "index version mismatch, treating hub as empty"
                    );
                    None
                }
                Err(e) => {
                    warn!("unparseable index document, treating hub as empty: {e}");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("index fetch failed, treating hub as empty: {e}");
                None
            }
        };

        self.doc = doc.unwrap_or_else(|| RemoteIndexDocument::empty(owner_id));
        self.doc.owner_id = owner_id.to_string();
        debug!(entries = self.doc.entries.len(), "index loaded");
        Ok(())
    }

    /// The cached document.
    #[must_use]
    pub fn document(&self) -> &RemoteIndexDocument {
        &self.doc
    }

    /// Entry for a logical path, if indexed.
    #[must_use]
    pub fn get_file(&self, path: &str) -> Option<&IndexEntry> {
        self.doc.entries.get(path)
    }

    /// All indexed file entries, in no particular order.
    #[must_use]
    pub fn all_files(&self) -> Vec<&IndexEntry> {
        self.doc.entries.values().collect()
    }

    /// Insert or replace one entry and persist the whole document.
    ///
    /// # Errors
    /// Returns an error if the hub write fails.
    pub async fn update_file(&mut self, entry: IndexEntry) -> Result<()> {
        self.doc.entries.insert(entry.path.clone(), entry);
        self.persist().await
    }

    /// Insert or replace several entries, persisting once.
    ///
    /// # Errors
    /// Returns an error if the hub write fails.
    pub async fn update_files(&mut self, entries: Vec<IndexEntry>) -> Result<()> {
        for entry in entries {
            self.doc.entries.insert(entry.path.clone(), entry);
        }
        self.persist().await
    }

    /// Remove one entry (if present) and persist the whole document.
    ///
    /// # Errors
    /// Returns an error if the hub write fails.
    pub async fn remove_file(&mut self, path: &str) -> Result<()> {
        self.doc.entries.remove(path);
        self.persist().await
    }

    /// Remove several entries, persisting once.
    ///
    /// # Errors
    /// Returns an error if the hub write fails.
    pub async fn remove_files(&mut self, paths: &[String]) -> Result<()> {
        for path in paths {
            self.doc.entries.remove(path);
        }
        self.persist().await
    }

    async fn persist(&mut self) -> Result<()> {
        self.doc.last_updated = crate::now_secs();
        let bytes = serde_json::to_vec(&self.doc)?;
        self.backend.put_object(INDEX_OBJECT, Bytes::from(bytes)).await
    }

    /// Build the cloud-side tree for a target subtree from cached entries.
    /// Directories are inferred from path structure; `"."` selects the
    /// whole namespace.
    ///
    /// # Errors
    /// Returns an error only on malformed entry paths (empty components).
    pub fn subtree(&self, prefix: &str) -> Result<StorageNode> {
        let root_path = if prefix.is_empty() { "." } else { prefix };
        let mut root = StorageNode::directory(root_path)?;

        for entry in self.doc.entries.values() {
            let Some(relative) = relative_to(&entry.path, prefix) else {
                continue;
            };

            insert_entry(&mut root, relative, entry)?;
        }

        Ok(root)
    }
}

/// Remainder of `path` below `prefix`, or `None` when outside the subtree.
fn relative_to<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    if prefix.is_empty() || prefix == "." {
        return Some(path);
    }
    path.strip_prefix(prefix)?.strip_prefix('/')
}

fn insert_entry(root: &mut StorageNode, relative: &str, entry: &IndexEntry) -> Result<()> {
    let mut node = root;
    let mut components = relative.split('/').peekable();

    while let Some(component) = components.next() {
        let is_leaf = components.peek().is_none();
        let child_path = if node.path == "." {
            component.to_string()
        } else {
            format!("{}/{component}", node.path)
        };

        if is_leaf {
            let mut file = StorageNode::file(child_path, entry.modified_secs)?
                .with_size(entry.size)
                .with_remote_id(entry.remote_id.clone());
            if let Some(hash) = parse_digest(&entry.digest) {
                file = file.with_hash(hash);
            }
            node.insert_child(file);
        } else {
            let dir = StorageNode::directory(child_path)?;
            node = node.children.entry(component.to_string()).or_insert(dir);
        }
    }

    Ok(())
}

fn parse_digest(digest: &str) -> Option<ContentHash> {
    let mut raw = [0u8; 32];
    hex::decode_to_slice(digest, &mut raw).ok()?;
    Some(ContentHash::from_raw(raw))
}
