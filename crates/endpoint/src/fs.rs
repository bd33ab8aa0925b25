//! Filesystem-backed local endpoint

use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use color_eyre::Result;
use filetime::FileTime;
use tracing::debug;

use crate::{LocalEndpoint, LocalEntry};

/// Local endpoint rooted at a directory on the real filesystem.
///
/// All paths passed to the trait methods are interpreted relative to the
/// root. Writes create missing parent directories and stamp the requested
/// modification time so timestamp-based reconciliation stays stable across
/// runs.
pub struct FsEndpoint {
    root: PathBuf,
}

impl FsEndpoint {
    /// Create an endpoint rooted at `root`, creating the directory if needed.
    ///
    /// # Errors
    /// Returns an error if the root cannot be created.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// The endpoint root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full(&self, path: &Path) -> PathBuf {
        self.root.join(path)
    }
}

fn mtime_secs(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[async_trait]
impl LocalEndpoint for FsEndpoint {
    async fn list_dir(&self, path: &Path) -> Result<Vec<LocalEntry>> {
        let full = self.full(path);
        let mut entries = Vec::new();

        for entry in std::fs::read_dir(&full)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            let name = entry.file_name().to_string_lossy().to_string();

            entries.push(LocalEntry {
                name,
                is_dir: metadata.is_dir(),
                modified_secs: mtime_secs(&metadata),
                size: if metadata.is_dir() { 0 } else { metadata.len() },
            });
        }

        // Sort for deterministic ordering
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn read_file(&self, path: &Path) -> Result<Bytes> {
        let data = std::fs::read(self.full(path))?;
        Ok(Bytes::from(data))
    }

    async fn write_file(&self, path: &Path, data: &[u8], modified_secs: i64) -> Result<()> {
        let full = self.full(path);

        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(&full, data)?;

        let mtime = UNIX_EPOCH + Duration::from_secs(modified_secs.max(0) as u64);
        filetime::set_file_mtime(&full, FileTime::from_system_time(mtime))?;
        debug!(path = %full.display(), bytes = data.len(), "wrote local file");
        Ok(())
    }

    async fn create_dir(&self, path: &Path) -> Result<()> {
        std::fs::create_dir_all(self.full(path))?;
        Ok(())
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        let full = self.full(path);
        if full.is_dir() {
            std::fs::remove_dir_all(&full)?;
        } else if full.exists() {
            std::fs::remove_file(&full)?;
        }
        debug!(path = %full.display(), "removed local path");
        Ok(())
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        Ok(self.full(path).exists())
    }
}
