//! Path-addressed node model for a directory snapshot
//!
//! A `StorageNode` tree is built fresh every run, either from a local scan
//! or from the remote index, and never persisted. Two independently-built
//! trees over the same subtree merge into one union view for reconciliation.

use std::collections::BTreeMap;

use color_eyre::Result;
use color_eyre::eyre::bail;

use crate::hash::ContentHash;

/// One file or directory in a snapshot tree.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageNode {
    /// Full path relative to the sync root, '/'-separated
    pub path: String,
    /// Whether this node is a directory
    pub is_dir: bool,
    /// Modification time (seconds since UNIX epoch)
    pub modified_secs: i64,
    /// Size in bytes, when known
    pub size: Option<u64>,
    /// Content digest, when known (cloud-origin nodes carry the indexed one)
    pub content_hash: Option<ContentHash>,
    /// Remote object id, present only for cloud-origin file nodes
    pub remote_id: Option<String>,
    /// Children keyed by name; sorted for deterministic traversal
    pub children: BTreeMap<String, StorageNode>,
}

impl StorageNode {
    /// Create a file node.
    ///
    /// # Errors
    /// An empty path is a caller error and fails fast.
    pub fn file(path: impl Into<String>, modified_secs: i64) -> Result<Self> {
        Self::new(path, false, modified_secs)
    }

    /// Create a directory node.
    ///
    /// # Errors
    /// An empty path is a caller error and fails fast.
    pub fn directory(path: impl Into<String>) -> Result<Self> {
        Self::new(path, true, 0)
    }

    fn new(path: impl Into<String>, is_dir: bool, modified_secs: i64) -> Result<Self> {
        let path = path.into();
        if path.is_empty() {
            bail!("storage node path must not be empty");
        }

        Ok(Self {
            path,
            is_dir,
            modified_secs,
            size: None,
            content_hash: None,
            remote_id: None,
            children: BTreeMap::new(),
        })
    }

    /// Set the size
    #[must_use]
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// Set the content digest
    #[must_use]
    pub fn with_hash(mut self, hash: ContentHash) -> Self {
        self.content_hash = Some(hash);
        self
    }

    /// Set the remote object id
    #[must_use]
    pub fn with_remote_id(mut self, id: impl Into<String>) -> Self {
        self.remote_id = Some(id.into());
        self
    }

    /// Last path component.
    #[must_use]
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Insert a child node, keyed by its name. Replaces any existing child
    /// with the same name.
    pub fn insert_child(&mut self, child: StorageNode) {
        self.children.insert(child.name().to_string(), child);
    }

    /// Merge two trees rooted at the same path.
    ///
    /// Metadata keeps the first non-null value, preferring `a` then `b`.
    /// Children are combined by inserting `a`'s children and then `b`'s into
    /// one name-keyed collection, so on a name collision `b`'s entry wins.
    #[must_use]
    pub fn merge(a: &StorageNode, b: &StorageNode) -> StorageNode {
        let mut children = a.children.clone();
        for (name, child) in &b.children {
            children.insert(name.clone(), child.clone());
        }

        StorageNode {
            path: a.path.clone(),
            is_dir: a.is_dir || b.is_dir,
            // Timestamps are never absent, so preferring `a` means keeping
            // its value outright. Equal-path merges only happen for
            // directory roots; file collisions resolve in `children`.
            modified_secs: a.modified_secs,
            size: a.size.or(b.size),
            content_hash: a.content_hash.or(b.content_hash),
            remote_id: a.remote_id.clone().or_else(|| b.remote_id.clone()),
            children,
        }
    }

    /// All file nodes in this tree, depth-first.
    #[must_use]
    pub fn flatten_files(&self) -> Vec<&StorageNode> {
        self.flatten(|node| !node.is_dir)
    }

    /// All directory nodes below this one, depth-first (self excluded).
    #[must_use]
    pub fn flatten_directories(&self) -> Vec<&StorageNode> {
        let mut dirs = self.flatten(StorageNode::is_directory);
        dirs.retain(|node| node.path != self.path);
        dirs
    }

    fn is_directory(&self) -> bool {
        self.is_dir
    }

    // Explicit worklist traversal; children are pushed in reverse so the
    // sorted map order comes off the stack first.
    fn flatten(&self, keep: fn(&StorageNode) -> bool) -> Vec<&StorageNode> {
        let mut out = Vec::new();
        let mut stack = vec![self];

        while let Some(node) = stack.pop() {
            if keep(node) {
                out.push(node);
            }
            stack.extend(node.children.values().rev());
        }

        out
    }
}
