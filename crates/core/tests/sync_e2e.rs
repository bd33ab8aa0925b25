//! End-to-end sync runs over a real filesystem endpoint and the in-memory hub
//!
//! Each test drives full `SyncOrchestrator::run` passes and asserts on the
//! run report plus the observable state of both sides afterwards.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tempfile::TempDir;

use hubsync_core::conflict::ConflictStrategy;
use hubsync_core::index::{IndexEntry, RemoteIndexStore, encode_remote_name};
use hubsync_core::lock::{LOCK_OBJECT, LockDocument};
use hubsync_core::report::{RunError, RunOutcome};
use hubsync_core::transfer::{TransferClient, TransferConfig};
use hubsync_core::{EndpointIdentity, SyncConfig, SyncHistory, SyncOrchestrator, TargetSpec};
use hubsync_endpoint::memory::ROOT_CONTAINER;
use hubsync_endpoint::{FsEndpoint, LocalEndpoint, MemoryHub, RemoteBackend};

struct Fixture {
    dir: TempDir,
    local: Arc<FsEndpoint>,
    hub: Arc<MemoryHub>,
}

impl Fixture {
    fn new() -> Self {
        Self::with_chunk_size(8)
    }

    fn with_chunk_size(chunk_size: usize) -> Self {
        let dir = TempDir::new().unwrap();
        let local = Arc::new(FsEndpoint::new(dir.path()).unwrap());
        let hub = Arc::new(MemoryHub::with_chunk_size(chunk_size));
        Self { dir, local, hub }
    }

    fn config(&self) -> SyncConfig {
        SyncConfig {
            transfer: fast_transfer(3),
            ..SyncConfig::default()
        }
    }

    fn orchestrator(&self, config: SyncConfig) -> SyncOrchestrator {
        SyncOrchestrator::new(self.local.clone(), self.hub.clone(), config)
    }

    async fn write_local(&self, path: &str, data: &[u8], mtime: i64) {
        self.local
            .write_file(Path::new(path), data, mtime)
            .await
            .unwrap();
    }

    /// Resolve both identities the same way a run would, so histories can be
    /// seeded before the first run.
    async fn identities(&self) -> (String, String) {
        let local = EndpointIdentity::resolve(&*self.hub, "local").await.unwrap();
        let hub = EndpointIdentity::resolve(&*self.hub, "hub").await.unwrap();
        (local.id, hub.id)
    }

    async fn seed_history(&self, endpoint_id: &str, peer_id: &str, when: i64) {
        let mut history = SyncHistory::new();
        history.record_sync(peer_id, when);
        history.persist(&*self.hub, endpoint_id).await.unwrap();
    }

    /// Place a file on the hub directly, with a matching index entry, as if
    /// another device had synced it up earlier.
    async fn seed_cloud(&self, entries: &[(&str, &[u8], i64)]) {
        let client = TransferClient::new(self.hub.clone(), fast_transfer(3));
        let (_, hub_id) = self.identities().await;

        let mut store = RemoteIndexStore::new(self.hub.clone());
        store.load(&hub_id).await.unwrap();

        let mut index_entries = Vec::new();
        for (path, data, mtime) in entries {
            let encoded = encode_remote_name(path);
            let outcome = client
                .upload(
                    Bytes::copy_from_slice(data),
                    &encoded,
                    ROOT_CONTAINER,
                    None,
                    None,
                    None,
                )
                .await
                .unwrap();
            index_entries.push(IndexEntry {
                path: (*path).to_string(),
                encoded_name: encoded,
                remote_id: outcome.object_id,
                digest: outcome.digest.to_hex(),
                size: outcome.size,
                modified_secs: *mtime,
            });
        }
        store.update_files(index_entries).await.unwrap();
    }

    async fn indexed_paths(&self) -> Vec<String> {
        let (_, hub_id) = self.identities().await;
        let mut store = RemoteIndexStore::new(self.hub.clone());
        store.load(&hub_id).await.unwrap();
        let mut paths: Vec<String> = store.all_files().iter().map(|e| e.path.clone()).collect();
        paths.sort();
        paths
    }

    fn cloud_content(&self, path: &str) -> Option<Bytes> {
        self.hub.object_content(ROOT_CONTAINER, &encode_remote_name(path))
    }
}

fn fast_transfer(retry_limit: u32) -> TransferConfig {
    TransferConfig {
        chunk_timeout: Duration::from_secs(5),
        retry_limit,
        retry_base_delay: Duration::from_millis(1),
        verify_poll_limit: 4,
        verify_poll_delay: Duration::from_millis(1),
    }
}

fn conflict_config(base: SyncConfig, strategy: ConflictStrategy) -> SyncConfig {
    let mut target = TargetSpec::new(".");
    target.track_conflicts = true;
    SyncConfig {
        strategy,
        targets: vec![target],
        ..base
    }
}

#[tokio::test]
async fn test_first_sync_uploads_everything() {
    let fx = Fixture::new();
    for name in ["a.txt", "b.txt", "c.txt", "sub/d.txt", "sub/deep/e.txt"] {
        fx.write_local(name, name.as_bytes(), 1_700_000_000).await;
    }

    let report = fx.orchestrator(fx.config()).run().await.unwrap();

    assert_eq!(report.uploads, 5);
    assert_eq!(report.downloads, 0);
    assert_eq!(report.deletions, 0);
    assert_eq!(report.outcome(), RunOutcome::Clean);

    assert_eq!(
        fx.indexed_paths().await,
        vec!["a.txt", "b.txt", "c.txt", "sub/d.txt", "sub/deep/e.txt"]
    );
    assert_eq!(&fx.cloud_content("sub/deep/e.txt").unwrap()[..], b"sub/deep/e.txt");
}

#[tokio::test]
async fn test_equal_timestamps_move_nothing() {
    let fx = Fixture::new();
    fx.write_local("same.txt", b"stable", 1_700_000_000).await;

    fx.orchestrator(fx.config()).run().await.unwrap();
    let second = fx.orchestrator(fx.config()).run().await.unwrap();

    assert_eq!(second.uploads, 0);
    assert_eq!(second.downloads, 0);
    assert_eq!(second.deletions, 0);
    assert_eq!(second.outcome(), RunOutcome::Clean);
}

#[tokio::test]
async fn test_local_delete_after_sync_propagates_to_hub() {
    let fx = Fixture::new();
    fx.write_local("gone.txt", b"bye", 1_700_000_000).await;
    fx.write_local("kept.txt", b"hi", 1_700_000_000).await;

    fx.orchestrator(fx.config()).run().await.unwrap();
    fx.local.remove(Path::new("gone.txt")).await.unwrap();

    let report = fx.orchestrator(fx.config()).run().await.unwrap();

    // gone.txt predates the pairwise sync stamped by run one, so it is
    // removed from the hub rather than restored locally
    assert_eq!(report.deletions, 1);
    assert_eq!(report.downloads, 0);
    assert_eq!(fx.indexed_paths().await, vec!["kept.txt"]);
    assert!(fx.cloud_content("gone.txt").is_none());
}

#[tokio::test]
async fn test_stale_cloud_file_deleted_not_redownloaded() {
    let fx = Fixture::new();
    let (local_id, hub_id) = fx.identities().await;

    // local={a:100}, cloud={a:100, b:50}, pairwise history=80 on both sides
    fx.write_local("a.txt", b"shared", 100).await;
    fx.seed_cloud(&[("a.txt", b"shared", 100), ("b.txt", b"stale", 50)])
        .await;
    fx.seed_history(&local_id, &hub_id, 80).await;
    fx.seed_history(&hub_id, &local_id, 80).await;

    let report = fx.orchestrator(fx.config()).run().await.unwrap();

    assert_eq!(report.deletions, 1);
    assert_eq!(report.downloads, 0);
    assert_eq!(report.uploads, 0);
    assert_eq!(fx.indexed_paths().await, vec!["a.txt"]);
    assert!(!fx.local.exists(Path::new("b.txt")).await.unwrap());
}

#[tokio::test]
async fn test_never_synced_cloud_file_is_restored_locally() {
    let fx = Fixture::new();
    fx.seed_cloud(&[("fresh.txt", b"from elsewhere", 1_700_000_000)])
        .await;

    let report = fx.orchestrator(fx.config()).run().await.unwrap();

    assert_eq!(report.downloads, 1);
    assert_eq!(report.deletions, 0);
    // Counted as a plain download: `restores` only tracks suppressed deletions
    assert_eq!(report.restores, 0);
    assert_eq!(
        &fx.local.read_file(Path::new("fresh.txt")).await.unwrap()[..],
        b"from elsewhere"
    );

    // The restored file carries the cloud-side modification time
    let metadata = std::fs::metadata(fx.dir.path().join("fresh.txt")).unwrap();
    let mtime = filetime::FileTime::from_last_modification_time(&metadata);
    assert_eq!(mtime.unix_seconds(), 1_700_000_000);
}

#[tokio::test]
async fn test_avoid_deletions_restores_instead() {
    let fx = Fixture::new();
    fx.write_local("precious.txt", b"keep me", 1_700_000_000).await;
    fx.orchestrator(fx.config()).run().await.unwrap();

    fx.local.remove(Path::new("precious.txt")).await.unwrap();

    let mut target = TargetSpec::new(".");
    target.avoid_deletions = true;
    let config = SyncConfig {
        targets: vec![target],
        ..fx.config()
    };
    let report = fx.orchestrator(config).run().await.unwrap();

    assert_eq!(report.deletions, 0);
    assert_eq!(report.downloads, 1);
    assert_eq!(report.restores, 1);
    assert_eq!(
        &fx.local.read_file(Path::new("precious.txt")).await.unwrap()[..],
        b"keep me"
    );
}

#[tokio::test]
async fn test_conflict_keep_local_moves_nothing() {
    let fx = Fixture::new();
    let (local_id, hub_id) = fx.identities().await;

    fx.write_local("f.txt", b"local edit", 200).await;
    fx.seed_cloud(&[("f.txt", b"cloud edit", 150)]).await;
    fx.seed_history(&local_id, &hub_id, 80).await;
    fx.seed_history(&hub_id, &local_id, 80).await;

    let config = conflict_config(fx.config(), ConflictStrategy::KeepLocal);
    let report = fx.orchestrator(config).run().await.unwrap();

    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.outcome(), RunOutcome::WithConflicts);
    assert_eq!(report.uploads, 0);
    assert_eq!(report.downloads, 0);
    assert_eq!(&fx.cloud_content("f.txt").unwrap()[..], b"cloud edit");
    assert_eq!(
        &fx.local.read_file(Path::new("f.txt")).await.unwrap()[..],
        b"local edit"
    );
}

#[tokio::test]
async fn test_conflict_keep_newer_syncs_newer_side() {
    let fx = Fixture::new();
    let (local_id, hub_id) = fx.identities().await;

    fx.write_local("f.txt", b"local newer", 200).await;
    fx.seed_cloud(&[("f.txt", b"cloud older", 150)]).await;
    fx.seed_history(&local_id, &hub_id, 80).await;
    fx.seed_history(&hub_id, &local_id, 80).await;

    let config = conflict_config(fx.config(), ConflictStrategy::KeepNewer);
    let report = fx.orchestrator(config).run().await.unwrap();

    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.uploads, 1);
    assert_eq!(&fx.cloud_content("f.txt").unwrap()[..], b"local newer");
}

#[tokio::test]
async fn test_keep_both_repeat_run_leaves_one_copy() {
    let fx = Fixture::new();
    let (local_id, hub_id) = fx.identities().await;

    // Local holds the older side, so the conflict copy lands locally
    fx.write_local("f.txt", b"local older", 150).await;
    fx.seed_history(&local_id, &hub_id, 80).await;
    fx.seed_history(&hub_id, &local_id, 80).await;
    fx.seed_cloud(&[("f.txt", b"cloud newer", 200)]).await;

    let config = conflict_config(fx.config(), ConflictStrategy::KeepBoth);
    let first = fx.orchestrator(config.clone()).run().await.unwrap();
    assert_eq!(first.conflicts.len(), 1);
    assert_eq!(first.downloads, 1);

    // Re-create the same unresolved conflict and run again
    fx.write_local("f.txt", b"local older", 150).await;
    fx.seed_history(&local_id, &hub_id, 80).await;
    fx.seed_history(&hub_id, &local_id, 80).await;
    fx.orchestrator(config).run().await.unwrap();

    let copies: Vec<String> = fx
        .local
        .list_dir(Path::new("."))
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.name.starts_with("f (conflict "))
        .map(|e| e.name)
        .collect();
    assert_eq!(copies.len(), 1, "repeat run must overwrite, not duplicate");

    assert_eq!(
        &fx.local.read_file(Path::new(&copies[0])).await.unwrap()[..],
        b"local older"
    );
    assert_eq!(
        &fx.local.read_file(Path::new("f.txt")).await.unwrap()[..],
        b"cloud newer"
    );
}

#[tokio::test]
async fn test_keep_both_copy_survives_following_run() {
    let fx = Fixture::new();
    let (local_id, hub_id) = fx.identities().await;

    fx.write_local("f.txt", b"local older", 150).await;
    fx.seed_history(&local_id, &hub_id, 80).await;
    fx.seed_history(&hub_id, &local_id, 80).await;
    fx.seed_cloud(&[("f.txt", b"cloud newer", 200)]).await;

    let config = conflict_config(fx.config(), ConflictStrategy::KeepBoth);
    let first = fx.orchestrator(config.clone()).run().await.unwrap();
    assert_eq!(first.conflicts.len(), 1);

    let copy_path = fx
        .indexed_paths()
        .await
        .into_iter()
        .find(|p| p.starts_with("f (conflict "))
        .expect("conflict copy must be indexed");

    // An ordinary follow-up run must not treat the copy as a deletion
    // candidate on either side
    let second = fx.orchestrator(config).run().await.unwrap();
    assert_eq!(second.deletions, 0);
    assert_eq!(second.conflicts.len(), 0);

    assert!(fx.local.exists(Path::new(&copy_path)).await.unwrap());
    assert_eq!(&fx.cloud_content(&copy_path).unwrap()[..], b"local older");
    assert!(fx.indexed_paths().await.contains(&copy_path));
}

#[tokio::test]
async fn test_delete_folders_only_restores_files() {
    let fx = Fixture::new();
    fx.write_local("shielded.txt", b"still here", 1_700_000_000).await;
    fx.orchestrator(fx.config()).run().await.unwrap();

    fx.local.remove(Path::new("shielded.txt")).await.unwrap();

    let mut target = TargetSpec::new(".");
    target.delete_folders_only = true;
    let config = SyncConfig {
        targets: vec![target],
        ..fx.config()
    };
    let report = fx.orchestrator(config).run().await.unwrap();

    assert_eq!(report.deletions, 0);
    assert_eq!(report.downloads, 1);
    assert_eq!(report.restores, 1);
    assert_eq!(
        &fx.local.read_file(Path::new("shielded.txt")).await.unwrap()[..],
        b"still here"
    );
}

#[tokio::test]
async fn test_only_if_missing_skips_files_present_on_both_sides() {
    let fx = Fixture::new();
    fx.write_local("both.txt", b"local version", 200).await;
    fx.seed_cloud(&[("both.txt", b"cloud version", 150), ("cloud-only.txt", b"new", 100)])
        .await;

    let mut target = TargetSpec::new(".");
    target.only_if_missing = true;
    let config = SyncConfig {
        targets: vec![target],
        ..fx.config()
    };
    let report = fx.orchestrator(config).run().await.unwrap();

    // both.txt untouched despite differing timestamps; the missing file moves
    assert_eq!(report.uploads, 0);
    assert_eq!(report.downloads, 1);
    assert_eq!(&fx.cloud_content("both.txt").unwrap()[..], b"cloud version");
    assert!(fx.local.exists(Path::new("cloud-only.txt")).await.unwrap());
}

#[tokio::test]
async fn test_flaky_chunks_still_yield_one_clean_transfer() {
    let fx = Fixture::with_chunk_size(4);
    fx.write_local("wobbly.bin", b"survives two chunk failures", 1_700_000_000)
        .await;

    // Retry bound is three; the first two attempts of the run fail
    fx.hub.fail_next_chunks(2);
    let report = fx.orchestrator(fx.config()).run().await.unwrap();

    assert_eq!(report.uploads, 1);
    assert!(report.errors.is_empty());
    assert_eq!(
        &fx.cloud_content("wobbly.bin").unwrap()[..],
        b"survives two chunk failures"
    );

    let listed = fx.hub.list_children(ROOT_CONTAINER).await.unwrap();
    assert_eq!(listed.len(), 1, "no partial object may be visible");
}

#[tokio::test]
async fn test_exhausted_retries_fail_only_that_file() {
    let fx = Fixture::with_chunk_size(4);
    fx.write_local("doomed.bin", b"never arrives", 1_700_000_000).await;

    fx.hub.fail_next_chunks(100);
    let report = fx.orchestrator(fx.config()).run().await.unwrap();

    assert_eq!(report.uploads, 0);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.outcome(), RunOutcome::WithErrors);
    assert!(fx.cloud_content("doomed.bin").is_none());
    assert!(fx.indexed_paths().await.is_empty());
}

#[tokio::test]
async fn test_fresh_lock_blocks_run_without_mutation() {
    let fx = Fixture::new();
    fx.write_local("pending.txt", b"waits", 1_700_000_000).await;

    let lock = LockDocument {
        timestamp_secs: hubsync_core::now_secs() - 60,
        holder_id: "other-device".to_string(),
    };
    fx.hub
        .put_object(LOCK_OBJECT, Bytes::from(serde_json::to_vec(&lock).unwrap()))
        .await
        .unwrap();

    let err = fx.orchestrator(fx.config()).run().await.unwrap_err();
    assert!(matches!(err, RunError::LockHeld { .. }));
    assert!(fx.cloud_content("pending.txt").is_none());
}

#[tokio::test]
async fn test_stale_lock_taken_over_and_released() {
    let fx = Fixture::new();
    fx.write_local("goes.txt", b"through", 1_700_000_000).await;

    let staleness = Duration::from_secs(300);
    let lock = LockDocument {
        timestamp_secs: hubsync_core::now_secs() - 600,
        holder_id: "crashed-device".to_string(),
    };
    fx.hub
        .put_object(LOCK_OBJECT, Bytes::from(serde_json::to_vec(&lock).unwrap()))
        .await
        .unwrap();

    let config = SyncConfig {
        lock_staleness: staleness,
        ..fx.config()
    };
    let report = fx.orchestrator(config).run().await.unwrap();

    assert_eq!(report.uploads, 1);
    assert!(
        fx.hub.get_object(LOCK_OBJECT).await.unwrap().is_none(),
        "lock must be released after the run"
    );
}

#[tokio::test]
async fn test_histories_stamped_on_both_sides() {
    let fx = Fixture::new();
    let (local_id, hub_id) = fx.identities().await;
    fx.write_local("x.txt", b"x", 1_700_000_000).await;

    let before = hubsync_core::now_secs();
    fx.orchestrator(fx.config()).run().await.unwrap();

    let local_history = SyncHistory::load(&*fx.hub, &local_id).await.unwrap();
    let cloud_history = SyncHistory::load(&*fx.hub, &hub_id).await.unwrap();
    assert!(local_history.last_sync_with(&hub_id) >= before);
    assert!(cloud_history.last_sync_with(&local_id) >= before);
}

#[tokio::test]
async fn test_excluded_paths_never_reach_the_hub() {
    let fx = Fixture::new();
    fx.write_local("keep/file.txt", b"in", 1_700_000_000).await;
    fx.write_local("skip/file.txt", b"out", 1_700_000_000).await;

    let mut target = TargetSpec::new(".");
    target.exclusions.push("skip".to_string());
    let config = SyncConfig {
        targets: vec![target],
        ..fx.config()
    };
    let report = fx.orchestrator(config).run().await.unwrap();

    assert_eq!(report.uploads, 1);
    assert_eq!(fx.indexed_paths().await, vec!["keep/file.txt"]);
}
