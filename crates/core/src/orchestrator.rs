//! Run orchestration
//!
//! Drives one full sync pass: identity resolution, index load, locking,
//! history load, per-target reconciliation, history persist, lock release.
//! Run-level failures abort with a typed [`RunError`]; per-target and
//! per-file failures are isolated, recorded, and never cancel siblings.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::Result;
use color_eyre::eyre::eyre;
use futures::future::{BoxFuture, join_all};
use tokio::sync::Mutex;
use tracing::{debug, info};

use hubsync_endpoint::{LocalEndpoint, RemoteBackend};

use crate::conflict::{self, Conflict, ConflictStrategy, Resolution};
use crate::history::SyncHistory;
use crate::identity::EndpointIdentity;
use crate::index::{IndexEntry, RemoteIndexStore, encode_remote_name};
use crate::lock;
use crate::report::{RunError, RunReport, SyncError, SyncOp};
use crate::target::TargetSpec;
use crate::transfer::{TransferClient, TransferConfig};
use crate::tree::StorageNode;

/// Explicit run configuration, supplied by the caller. There is no ambient
/// process-wide state.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Conflict resolution policy for targets that track conflicts
    pub strategy: ConflictStrategy,
    /// Subtrees to reconcile, in declared order
    pub targets: Vec<TargetSpec>,
    /// Age past which a run lock counts as abandoned
    pub lock_staleness: Duration,
    /// Hub container file objects live in
    pub container_id: String,
    /// Transfer tunables
    pub transfer: TransferConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            strategy: ConflictStrategy::KeepNewer,
            targets: vec![TargetSpec::new(".")],
            lock_staleness: Duration::from_secs(30 * 60),
            container_id: "root".to_string(),
            transfer: TransferConfig::default(),
        }
    }
}

/// Run-scoped shared state. The index cache is the one piece of shared
/// mutable state; it has a single writer per run behind the mutex.
struct RunContext {
    local: Arc<dyn LocalEndpoint>,
    backend: Arc<dyn RemoteBackend>,
    transfer: TransferClient,
    index: Mutex<RemoteIndexStore>,
    local_id: String,
    cloud_id: String,
    local_history: SyncHistory,
    cloud_history: SyncHistory,
    strategy: ConflictStrategy,
    container_id: String,
}

/// Which endpoint still holds a file the other side is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HolderSide {
    Local,
    Cloud,
}

/// Drives one discrete sync run between a local endpoint and the hub.
pub struct SyncOrchestrator {
    local: Arc<dyn LocalEndpoint>,
    backend: Arc<dyn RemoteBackend>,
    config: SyncConfig,
}

impl SyncOrchestrator {
    /// Create an orchestrator over the two endpoints.
    #[must_use]
    pub fn new(
        local: Arc<dyn LocalEndpoint>,
        backend: Arc<dyn RemoteBackend>,
        config: SyncConfig,
    ) -> Self {
        Self {
            local,
            backend,
            config,
        }
    }

    /// Execute one full run.
    ///
    /// # Errors
    /// Returns [`RunError::Identity`] before locking, [`RunError::LockHeld`]
    /// when another run is active, or [`RunError::Internal`] for other
    /// run-scoped failures. Per-file and per-target failures do not error;
    /// they land in the report.
    pub async fn run(&self) -> Result<RunReport, RunError> {
        let local_identity = EndpointIdentity::resolve(&*self.backend, "local").await?;
        let hub_identity = EndpointIdentity::resolve(&*self.backend, "hub").await?;
        info!(local = %local_identity.id, hub = %hub_identity.id, "identities resolved");

        let mut index = RemoteIndexStore::new(self.backend.clone());
        index.load(&hub_identity.id).await?;

        lock::acquire(&*self.backend, &local_identity.id, self.config.lock_staleness).await?;

        // Everything past the lock must release it, success or not.
        let result = self.run_locked(&local_identity, &hub_identity, index).await;
        lock::release(&*self.backend).await;
        result
    }

    async fn run_locked(
        &self,
        local_identity: &EndpointIdentity,
        hub_identity: &EndpointIdentity,
        index: RemoteIndexStore,
    ) -> Result<RunReport, RunError> {
        let local_history = SyncHistory::load(&*self.backend, &local_identity.id).await?;
        let cloud_history = SyncHistory::load(&*self.backend, &hub_identity.id).await?;

        let ctx = RunContext {
            local: self.local.clone(),
            backend: self.backend.clone(),
            transfer: TransferClient::new(self.backend.clone(), self.config.transfer.clone()),
            index: Mutex::new(index),
            local_id: local_identity.id.clone(),
            cloud_id: hub_identity.id.clone(),
            local_history,
            cloud_history,
            strategy: self.config.strategy,
            container_id: self.config.container_id.clone(),
        };

        let mut report = RunReport::new();
        for target in &self.config.targets {
            debug!(target = %target.path, "reconciling target");
            match process_target(&ctx, target).await {
                Ok(fragment) => report.absorb(fragment),
                Err(e) => report
                    .errors
                    .push(SyncError::new(&target.path, SyncOp::Scan, e)),
            }
        }

        // Stamp the pairwise sync on both sides
        let now = crate::now_secs();
        let RunContext {
            mut local_history,
            mut cloud_history,
            ..
        } = ctx;
        local_history.record_sync(&hub_identity.id, now);
        cloud_history.record_sync(&local_identity.id, now);
        local_history
            .persist(&*self.backend, &local_identity.id)
            .await?;
        cloud_history
            .persist(&*self.backend, &hub_identity.id)
            .await?;

        info!(
            uploads = report.uploads,
            downloads = report.downloads,
            deletions = report.deletions,
            conflicts = report.conflicts.len(),
            errors = report.errors.len(),
            "run finished"
        );
        Ok(report)
    }
}

/// Reconcile one configured target: scan the local subtree, derive the cloud
/// subtree from the index, and walk the merged view.
async fn process_target(ctx: &RunContext, target: &TargetSpec) -> Result<RunReport> {
    let local_tree = scan_local(&*ctx.local, target).await?;
    let cloud_tree = {
        let index = ctx.index.lock().await;
        index.subtree(&target.path)?
    };

    Ok(reconcile_dir(ctx, target, Some(&local_tree), Some(&cloud_tree)).await)
}

/// Build the local tree for a target. A missing local directory yields an
/// empty tree, not an error.
async fn scan_local(local: &dyn LocalEndpoint, target: &TargetSpec) -> Result<StorageNode> {
    let mut root = StorageNode::directory(target.path.clone())?;
    scan_into(local, target, &mut root).await?;
    Ok(root)
}

fn scan_into<'a>(
    local: &'a dyn LocalEndpoint,
    target: &'a TargetSpec,
    node: &'a mut StorageNode,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        if !local.exists(Path::new(&node.path)).await? {
            return Ok(());
        }

        for entry in local.list_dir(Path::new(&node.path)).await? {
            let child_path = join_path(&node.path, &entry.name);
            let relative = target_relative(&child_path, &target.path);
            if target.is_excluded(&entry.name, relative) {
                continue;
            }

            if entry.is_dir {
                let mut dir = StorageNode::directory(child_path)?;
                scan_into(local, target, &mut dir).await?;
                node.insert_child(dir);
            } else {
                let file =
                    StorageNode::file(child_path, entry.modified_secs)?.with_size(entry.size);
                node.insert_child(file);
            }
        }

        Ok(())
    })
}

/// Reconcile one directory level. All child files and subdirectory
/// recursions are launched together and awaited as a group; a failing
/// sibling only contributes its own errors.
fn reconcile_dir<'a>(
    ctx: &'a RunContext,
    target: &'a TargetSpec,
    local: Option<&'a StorageNode>,
    cloud: Option<&'a StorageNode>,
) -> BoxFuture<'a, RunReport> {
    Box::pin(async move {
        let merged = match (local, cloud) {
            (Some(l), Some(c)) => StorageNode::merge(l, c),
            (Some(l), None) => l.clone(),
            (None, Some(c)) => c.clone(),
            (None, None) => return RunReport::new(),
        };
        let children: Vec<(String, bool)> = merged
            .children
            .iter()
            .map(|(name, child)| (name.clone(), child.is_dir))
            .collect();
        drop(merged);

        let mut pending: Vec<BoxFuture<'a, RunReport>> = Vec::new();

        for (name, is_dir) in children {
            let local_child = local.and_then(|n| n.children.get(&name));
            let cloud_child = cloud.and_then(|n| n.children.get(&name));
            let Some(any) = local_child.or(cloud_child) else {
                continue;
            };
            let child_path = any.path.clone();

            let relative = target_relative(&child_path, &target.path);
            if target.is_excluded(&name, relative) {
                continue;
            }

            if is_dir {
                pending.push(reconcile_dir(
                    ctx,
                    target,
                    local_child.filter(|n| n.is_dir),
                    cloud_child.filter(|n| n.is_dir),
                ));
            } else {
                pending.push(Box::pin(reconcile_file(
                    ctx,
                    target,
                    child_path,
                    local_child.filter(|n| !n.is_dir),
                    cloud_child.filter(|n| !n.is_dir),
                )));
            }
        }

        let mut report = RunReport::new();
        for fragment in join_all(pending).await {
            report.absorb(fragment);
        }
        report
    })
}

/// Single-file reconciliation decision table.
async fn reconcile_file(
    ctx: &RunContext,
    target: &TargetSpec,
    path: String,
    local: Option<&StorageNode>,
    cloud: Option<&StorageNode>,
) -> RunReport {
    let mut report = RunReport::new();

    match (local, cloud) {
        (None, None) => {}

        (Some(local_node), Some(cloud_node)) => {
            if target.only_if_missing || local_node.modified_secs == cloud_node.modified_secs {
                return report;
            }

            if target.track_conflicts
                && conflict::detect_conflict(
                    local_node.modified_secs,
                    cloud_node.modified_secs,
                    &ctx.local_history,
                    &ctx.cloud_history,
                    &ctx.local_id,
                    &ctx.cloud_id,
                )
            {
                report.conflicts.push(Conflict {
                    path: path.clone(),
                    local_secs: local_node.modified_secs,
                    cloud_secs: cloud_node.modified_secs,
                    strategy: ctx.strategy,
                });

                match conflict::resolve(ctx.strategy) {
                    Resolution::Skip => return report,
                    Resolution::MaterializeOlderCopy => {
                        if let Err(e) =
                            materialize_older_copy(ctx, &path, local_node, cloud_node).await
                        {
                            report
                                .errors
                                .push(SyncError::new(&path, SyncOp::ConflictCopy, e));
                            return report;
                        }
                    }
                    Resolution::Proceed => {}
                }
            }

            // Newer wins
            if local_node.modified_secs > cloud_node.modified_secs {
                match upload_file(ctx, &path, local_node).await {
                    Ok(()) => report.uploads += 1,
                    Err(e) => report.errors.push(SyncError::new(&path, SyncOp::Upload, e)),
                }
            } else {
                match download_file(ctx, &path, cloud_node).await {
                    Ok(()) => report.downloads += 1,
                    Err(e) => report
                        .errors
                        .push(SyncError::new(&path, SyncOp::Download, e)),
                }
            }
        }

        (Some(holder), None) => {
            deletion_or_restore(ctx, target, &path, holder, HolderSide::Local, &mut report).await;
        }
        (None, Some(holder)) => {
            deletion_or_restore(ctx, target, &path, holder, HolderSide::Cloud, &mut report).await;
        }
    }

    report
}

/// Deletion-vs-creation for a file present on exactly one side.
///
/// The holder's history decides: delete iff it synced with the other side
/// after the file's timestamp and nothing newer happened with anyone else.
/// When the predicate fails, or the target is deletion-averse, the missing
/// side gets a fresh copy instead (never a silent no-op).
async fn deletion_or_restore(
    ctx: &RunContext,
    target: &TargetSpec,
    path: &str,
    holder: &StorageNode,
    side: HolderSide,
    report: &mut RunReport,
) {
    let (holder_history, peer_id) = match side {
        HolderSide::Local => (&ctx.local_history, ctx.cloud_id.as_str()),
        HolderSide::Cloud => (&ctx.cloud_history, ctx.local_id.as_str()),
    };

    let common_sync = holder_history.last_sync_with(peer_id);
    let most_recent = holder_history.most_recent_sync();
    let should_delete =
        common_sync > 0 && common_sync > holder.modified_secs && common_sync >= most_recent;

    if should_delete && target.allows_deletion() {
        let deleted = match side {
            HolderSide::Local => ctx.local.remove(Path::new(path)).await,
            HolderSide::Cloud => delete_cloud_file(ctx, path, holder).await,
        };
        match deleted {
            Ok(()) => report.deletions += 1,
            Err(e) => report.errors.push(SyncError::new(path, SyncOp::Delete, e)),
        }
        return;
    }

    // Restore a fresh copy on the missing side
    let restored = match side {
        HolderSide::Local => upload_file(ctx, path, holder).await.map(|()| {
            report.uploads += 1;
        }),
        HolderSide::Cloud => download_file(ctx, path, holder).await.map(|()| {
            report.downloads += 1;
        }),
    };
    match restored {
        Ok(()) => {
            if should_delete {
                // Deletion was due but the target is protected
                report.restores += 1;
            }
        }
        Err(e) => report.errors.push(SyncError::new(path, SyncOp::Restore, e)),
    }
}

async fn upload_file(ctx: &RunContext, path: &str, node: &StorageNode) -> Result<()> {
    let data = ctx.local.read_file(Path::new(path)).await?;
    let encoded = encode_remote_name(path);

    let outcome = ctx
        .transfer
        .upload(data, &encoded, &ctx.container_id, None, None, None)
        .await?;

    let entry = IndexEntry {
        path: path.to_string(),
        encoded_name: encoded,
        remote_id: outcome.object_id,
        digest: outcome.digest.to_hex(),
        size: outcome.size,
        modified_secs: node.modified_secs,
    };
    ctx.index.lock().await.update_file(entry).await
}

async fn download_file(ctx: &RunContext, path: &str, node: &StorageNode) -> Result<()> {
    let object_id = node
        .remote_id
        .as_deref()
        .ok_or_else(|| eyre!("cloud record for {path} has no object id"))?;

    ctx.transfer
        .download_to_local(&*ctx.local, object_id, Path::new(path), node.modified_secs, None)
        .await
}

async fn delete_cloud_file(ctx: &RunContext, path: &str, node: &StorageNode) -> Result<()> {
    let object_id = node
        .remote_id
        .as_deref()
        .ok_or_else(|| eyre!("cloud record for {path} has no object id"))?;

    ctx.backend.delete(&[object_id.to_string()]).await?;
    ctx.index.lock().await.remove_file(path).await
}

/// keep-both side effect: copy the older version under its derived conflict
/// name. The name is deterministic from the older timestamp, so a repeat run
/// overwrites instead of duplicating.
///
/// The copy lands on both sides with the older timestamp: later runs then
/// see equal timestamps for it and leave it alone, keeping it out of the
/// deletion-vs-creation predicate entirely.
async fn materialize_older_copy(
    ctx: &RunContext,
    path: &str,
    local_node: &StorageNode,
    cloud_node: &StorageNode,
) -> Result<()> {
    let older_secs = local_node.modified_secs.min(cloud_node.modified_secs);
    let copy_path = conflict::conflict_copy_path(path, older_secs);

    let data = if local_node.modified_secs < cloud_node.modified_secs {
        ctx.local.read_file(Path::new(path)).await?
    } else {
        let object_id = cloud_node
            .remote_id
            .as_deref()
            .ok_or_else(|| eyre!("cloud record for {path} has no object id"))?;
        ctx.transfer.download(object_id, None).await?
    };

    ctx.local
        .write_file(Path::new(&copy_path), &data, older_secs)
        .await?;

    let encoded = encode_remote_name(&copy_path);
    let outcome = ctx
        .transfer
        .upload(data, &encoded, &ctx.container_id, None, None, None)
        .await?;
    ctx.index
        .lock()
        .await
        .update_file(IndexEntry {
            path: copy_path.clone(),
            encoded_name: encoded,
            remote_id: outcome.object_id,
            digest: outcome.digest.to_hex(),
            size: outcome.size,
            modified_secs: older_secs,
        })
        .await?;

    debug!(path, copy = %copy_path, "materialized keep-both conflict copy");
    Ok(())
}

fn join_path(base: &str, name: &str) -> String {
    if base == "." {
        name.to_string()
    } else {
        format!("{base}/{name}")
    }
}

fn target_relative<'p>(path: &'p str, target_root: &str) -> &'p str {
    if target_root == "." {
        return path;
    }
    path.strip_prefix(target_root)
        .and_then(|rest| rest.strip_prefix('/'))
        .unwrap_or(path)
}
