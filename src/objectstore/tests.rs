#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

use super::metadata::{format_time, in_progress_name, queued_name, LEASE_EXPIRATION, PRIORITY};
use super::*;
use crate::conformance;
use crate::storage::{Metadata, MemoryStore};

fn memory_queue(store: &Arc<MemoryStore>, limit: usize, config: QueueConfig) -> ObjectStoreQueue {
    ObjectStoreQueue::new(Arc::clone(store) as Arc<dyn ObjectStore>, limit, config).unwrap()
}

fn fast_config() -> QueueConfig {
    QueueConfig::default().with_refresh_interval(Duration::from_millis(50))
}

fn fresh_queue(limit: usize) -> Arc<dyn WorkQueue> {
    let store = Arc::new(MemoryStore::new());
    Arc::new(memory_queue(&store, limit, QueueConfig::default()))
}

#[tokio::test]
async fn test_conformance() {
    conformance::test_semantics(fresh_queue, Duration::from_millis(300)).await;
}

#[tokio::test]
async fn test_concurrency() {
    conformance::test_concurrency(fresh_queue).await;
}

#[tokio::test]
async fn test_durability() {
    let store = Arc::new(MemoryStore::new());
    conformance::test_durability(|limit| {
        Arc::new(memory_queue(&store, limit, QueueConfig::default())) as Arc<dyn WorkQueue>
    })
    .await;
}

#[tokio::test]
async fn test_expired_lease_is_orphaned_and_reclaimed() {
    let store = Arc::new(MemoryStore::new());
    let wq = memory_queue(&store, 10, QueueConfig::default());

    let mut metadata = Metadata::new();
    metadata.insert(PRIORITY.to_string(), "7".to_string());
    metadata.insert(
        LEASE_EXPIRATION.to_string(),
        format_time(Utc::now() - chrono::Duration::seconds(5)),
    );
    store
        .put(&in_progress_name("foo"), metadata, PutCondition::None)
        .await
        .unwrap();
    // Queued before the reclaim at the same priority, so it stays ahead.
    wq.queue("bar", Options::with_priority(7)).await.unwrap();

    let snapshot = wq.enumerate().await.unwrap();
    assert_eq!(snapshot.in_progress.len(), 1);
    assert!(snapshot.in_progress[0].is_orphaned());
    snapshot.in_progress[0].requeue().await.unwrap();

    let snapshot = wq.enumerate().await.unwrap();
    assert!(snapshot.in_progress.is_empty());
    assert_eq!(snapshot.queued.len(), 2);
    let names: Vec<&str> = snapshot.queued.iter().map(|key| key.name()).collect();
    assert_eq!(names, vec!["bar", "foo"]);
    assert_eq!(snapshot.queued[1].priority(), 7);
}

#[tokio::test]
async fn test_missing_or_malformed_lease_is_orphaned() {
    let store = Arc::new(MemoryStore::new());
    let wq = memory_queue(&store, 10, QueueConfig::default());

    store
        .put(&in_progress_name("missing"), Metadata::new(), PutCondition::None)
        .await
        .unwrap();
    let mut malformed = Metadata::new();
    malformed.insert(LEASE_EXPIRATION.to_string(), "not-a-time".to_string());
    store
        .put(&in_progress_name("malformed"), malformed, PutCondition::None)
        .await
        .unwrap();

    let snapshot = wq.enumerate().await.unwrap();
    assert_eq!(snapshot.in_progress.len(), 2);
    assert!(snapshot.in_progress.iter().all(|key| key.is_orphaned()));
}

#[tokio::test]
async fn test_live_lease_is_not_orphaned() {
    let store = Arc::new(MemoryStore::new());
    let wq = memory_queue(&store, 10, QueueConfig::default());
    wq.queue("foo", Options::default()).await.unwrap();

    let owned = wq.enumerate().await.unwrap().queued[0]
        .start(&CancellationToken::new())
        .await
        .unwrap();

    let snapshot = wq.enumerate().await.unwrap();
    assert_eq!(snapshot.in_progress.len(), 1);
    assert!(!snapshot.in_progress[0].is_orphaned());
    owned.complete().await.unwrap();
}

#[tokio::test]
async fn test_heartbeat_extends_lease() {
    let store = Arc::new(MemoryStore::new());
    let wq = memory_queue(&store, 10, fast_config());
    wq.queue("foo", Options::default()).await.unwrap();

    let owned = wq.enumerate().await.unwrap().queued[0]
        .start(&CancellationToken::new())
        .await
        .unwrap();
    let first = store.attrs(&in_progress_name("foo")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;

    let renewed = store.attrs(&in_progress_name("foo")).await.unwrap();
    assert_ne!(first.etag, renewed.etag);
    assert!(renewed.get(LEASE_EXPIRATION) > first.get(LEASE_EXPIRATION));
    assert!(!owned.context().is_cancelled());

    owned.complete().await.unwrap();
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn test_external_write_cancels_owner() {
    let store = Arc::new(MemoryStore::new());
    let wq = memory_queue(&store, 10, fast_config());
    wq.queue("foo", Options::default()).await.unwrap();

    let owned = wq.enumerate().await.unwrap().queued[0]
        .start(&CancellationToken::new())
        .await
        .unwrap();
    let ctx = owned.context();

    // Someone else rewrites the lease object.
    store
        .put(&in_progress_name("foo"), Metadata::new(), PutCondition::None)
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(2), ctx.cancelled())
        .await
        .expect("owner context should be cancelled after lease loss");

    // Terminal operations on a lost lease leave the object alone.
    owned.complete().await.unwrap();
    assert!(store.attrs(&in_progress_name("foo")).await.is_ok());
}

#[tokio::test]
async fn test_reclaim_fences_out_previous_owner() {
    let store = Arc::new(MemoryStore::new());
    let config = QueueConfig::default().with_refresh_interval(Duration::from_millis(200));
    let wq = memory_queue(&store, 10, config);
    wq.queue("foo", Options::default()).await.unwrap();

    let owned = wq.enumerate().await.unwrap().queued[0]
        .start(&CancellationToken::new())
        .await
        .unwrap();

    let snapshot = wq.enumerate().await.unwrap();
    snapshot.in_progress[0].requeue().await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), owned.context().cancelled())
        .await
        .expect("previous owner should observe the reclaim");

    let next = wq.enumerate().await.unwrap().queued[0]
        .start(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(next.attempts(), 2);

    // The stale owner's cleanup must not disturb the new owner.
    owned.complete().await.unwrap();
    let state = wq.get_key_state("foo").await.unwrap().unwrap();
    assert_eq!(state.status, KeyStatus::InProgress);
    next.complete().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_starts_admit_one_owner() {
    let store = Arc::new(MemoryStore::new());
    let wq = memory_queue(&store, 10, QueueConfig::default());
    wq.queue("foo", Options::default()).await.unwrap();

    let first = wq.enumerate().await.unwrap();
    let second = wq.enumerate().await.unwrap();
    let parent = CancellationToken::new();

    let (a, b) = tokio::join!(first.queued[0].start(&parent), second.queued[0].start(&parent));
    let winners = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
    assert_eq!(winners, 1);

    let loser = a.err().or(b.err()).unwrap();
    assert!(loser.is_lost_race());
}

#[tokio::test]
async fn test_queued_copy_is_hidden_while_in_progress() {
    let store = Arc::new(MemoryStore::new());
    let wq = memory_queue(&store, 10, QueueConfig::default());
    wq.queue("foo", Options::default()).await.unwrap();
    let owned = wq.enumerate().await.unwrap().queued[0]
        .start(&CancellationToken::new())
        .await
        .unwrap();

    wq.queue("foo", Options::with_priority(3)).await.unwrap();
    assert!(store.attrs(&queued_name("foo")).await.is_ok());

    let snapshot = wq.enumerate().await.unwrap();
    assert_eq!(snapshot.in_progress.len(), 1);
    assert!(snapshot.queued.is_empty());

    owned.complete().await.unwrap();
    let snapshot = wq.enumerate().await.unwrap();
    assert_eq!(snapshot.queued.len(), 1);
    assert_eq!(snapshot.queued[0].priority(), 3);
}

#[tokio::test]
async fn test_deadletter_and_key_state() {
    let store = Arc::new(MemoryStore::new());
    let wq = memory_queue(&store, 10, QueueConfig::default());
    wq.queue("foo", Options::with_priority(4)).await.unwrap();

    let queued = wq.get_key_state("foo").await.unwrap().unwrap();
    assert_eq!(queued.status, KeyStatus::Queued);
    assert_eq!(queued.priority, 4);

    let owned = wq.enumerate().await.unwrap().queued[0]
        .start(&CancellationToken::new())
        .await
        .unwrap();
    let in_progress = wq.get_key_state("foo").await.unwrap().unwrap();
    assert_eq!(in_progress.status, KeyStatus::InProgress);
    assert_eq!(in_progress.attempts, 1);

    owned.deadletter().await.unwrap();
    let dead = wq.get_key_state("foo").await.unwrap().unwrap();
    assert_eq!(dead.status, KeyStatus::DeadLettered);
    assert_eq!(dead.attempts, 1);
    assert!(dead.failed_time.is_some());

    // A fresh Queue hides the dead-letter entry from snapshots.
    wq.queue("foo", Options::default()).await.unwrap();
    let snapshot = wq.enumerate().await.unwrap();
    assert!(snapshot.dead_lettered.is_empty());
    assert_eq!(snapshot.queued.len(), 1);

    // Completing the new run clears the stale dead-letter entry.
    let owned = snapshot.queued[0]
        .start(&CancellationToken::new())
        .await
        .unwrap();
    owned.complete().await.unwrap();
    assert!(wq.get_key_state("foo").await.unwrap().is_none());
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn test_unknown_prefixes_are_ignored() {
    let store = Arc::new(MemoryStore::new());
    let wq = memory_queue(&store, 10, QueueConfig::default());
    store
        .put("unrelated/object", Metadata::new(), PutCondition::None)
        .await
        .unwrap();

    let snapshot = wq.enumerate().await.unwrap();
    assert!(snapshot.in_progress.is_empty());
    assert!(snapshot.queued.is_empty());
    assert!(snapshot.dead_lettered.is_empty());
}

/// Pauses the first matching write to `gate` until released, and records
/// every listed prefix.
#[derive(Debug)]
struct GatedStore {
    inner: MemoryStore,
    gate: &'static str,
    on_delete: bool,
    armed: AtomicBool,
    reached: Notify,
    release: Notify,
    listed: Mutex<Vec<String>>,
}

impl GatedStore {
    /// Gates the conditional delete of `gate` when `on_delete`, otherwise
    /// its create-if-absent.
    fn new(gate: &'static str, on_delete: bool) -> Self {
        Self {
            inner: MemoryStore::new(),
            gate,
            on_delete,
            armed: AtomicBool::new(true),
            reached: Notify::new(),
            release: Notify::new(),
            listed: Mutex::new(Vec::new()),
        }
    }

    async fn pause(&self, name: &str) {
        if name == self.gate && self.armed.swap(false, Ordering::SeqCst) {
            self.reached.notify_one();
            self.release.notified().await;
        }
    }
}

#[async_trait]
impl ObjectStore for GatedStore {
    async fn put(
        &self,
        name: &str,
        metadata: Metadata,
        condition: PutCondition,
    ) -> Result<ObjectAttrs, StorageError> {
        if !self.on_delete && condition == PutCondition::IfNoneMatch {
            self.pause(name).await;
        }
        self.inner.put(name, metadata, condition).await
    }

    async fn attrs(&self, name: &str) -> Result<ObjectAttrs, StorageError> {
        self.inner.attrs(name).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectAttrs>, StorageError> {
        self.listed.lock().await.push(prefix.to_string());
        self.inner.list(prefix).await
    }

    async fn delete(&self, name: &str) -> Result<(), StorageError> {
        self.inner.delete(name).await
    }

    async fn delete_if_match(&self, name: &str, etag: &str) -> Result<(), StorageError> {
        if self.on_delete {
            self.pause(name).await;
        }
        self.inner.delete_if_match(name, etag).await
    }
}

fn gated_queue(store: &Arc<GatedStore>) -> Arc<ObjectStoreQueue> {
    Arc::new(
        ObjectStoreQueue::new(
            Arc::clone(store) as Arc<dyn ObjectStore>,
            10,
            QueueConfig::default(),
        )
        .unwrap(),
    )
}

#[tokio::test]
async fn test_queue_while_starting_is_kept_for_another_run() {
    let store = Arc::new(GatedStore::new("queued/foo", true));
    let wq = gated_queue(&store);
    wq.queue("foo", Options::default()).await.unwrap();

    let key = wq.enumerate().await.unwrap().queued.remove(0);
    let starting = tokio::spawn(async move { key.start(&CancellationToken::new()).await });

    // The in-progress object exists; the queued object is not yet deleted.
    store.reached.notified().await;
    wq.queue("foo", Options::default()).await.unwrap();
    store.release.notify_one();

    let owned = starting.await.unwrap().unwrap();
    let state = wq.get_key_state("foo").await.unwrap().unwrap();
    assert_eq!(state.status, KeyStatus::InProgress);
    assert!(wq.enumerate().await.unwrap().queued.is_empty());

    owned.complete().await.unwrap();
    let state = wq.get_key_state("foo").await.unwrap().unwrap();
    assert_eq!(state.status, KeyStatus::Queued);
    let snapshot = wq.enumerate().await.unwrap();
    assert_eq!(snapshot.queued.len(), 1);
    assert_eq!(snapshot.queued[0].name(), "foo");
}

#[tokio::test]
async fn test_stalled_start_does_not_rerun_completed_key() {
    let store = Arc::new(GatedStore::new("in-progress/foo", false));
    let wq = gated_queue(&store);
    wq.queue("foo", Options::default()).await.unwrap();

    let stalled = wq.enumerate().await.unwrap().queued.remove(0);
    let starting = tokio::spawn(async move { stalled.start(&CancellationToken::new()).await });
    store.reached.notified().await;

    // Another worker sees the claimed entry, runs the key and finishes it.
    let snapshot = wq.enumerate().await.unwrap();
    assert_eq!(snapshot.queued.len(), 1);
    let owned = snapshot.queued[0]
        .start(&CancellationToken::new())
        .await
        .unwrap();
    owned.complete().await.unwrap();
    store.release.notify_one();

    let err = match starting.await.unwrap() {
        Ok(_) => panic!("stale start must not take ownership"),
        Err(err) => err,
    };
    assert!(err.is_lost_race());
    assert!(wq.get_key_state("foo").await.unwrap().is_none());
    assert!(store.inner.is_empty().await);
}

#[tokio::test]
async fn test_enumerate_lists_only_queue_prefixes() {
    let store = Arc::new(GatedStore::new("", false));
    let wq = gated_queue(&store);
    wq.enumerate().await.unwrap();

    let mut listed = store.listed.lock().await.clone();
    listed.sort();
    assert_eq!(listed, vec!["dead-letter/", "in-progress/", "queued/"]);
}

#[test]
fn test_zero_refresh_interval_is_rejected() {
    let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
    let config = QueueConfig::default().with_refresh_interval(Duration::ZERO);
    let err = ObjectStoreQueue::new(store, 10, config).unwrap_err();
    assert!(matches!(err, QueueError::InvalidConfig(_)));
}
