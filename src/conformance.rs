//! Behavioural suite shared by every [`WorkQueue`] backend.
//!
//! Each scenario builds a fresh queue through the caller's constructor,
//! which receives the `enumerate` limit to use.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::dispatcher::{Callback, DispatchHandler, DispatchSettings};
use crate::queue::{Enumeration, KeyStatus, Options, OwnedInProgressKey, QueuedKey, WorkQueue};

const LIMIT: usize = 1000;

fn queued_names(keys: &[Box<dyn QueuedKey>]) -> Vec<&str> {
    keys.iter().map(|key| key.name()).collect()
}

/// Enumerates `wq` and checks its in-progress set (any order) and queued
/// list (exact order). No name may appear in both.
pub async fn check_queue(wq: &dyn WorkQueue, in_progress: &[&str], queued: &[&str]) -> Enumeration {
    let snapshot = wq.enumerate().await.unwrap();

    let mut wip: Vec<&str> = snapshot.in_progress.iter().map(|key| key.name()).collect();
    wip.sort_unstable();
    let mut expected_wip = in_progress.to_vec();
    expected_wip.sort_unstable();
    assert_eq!(wip, expected_wip, "in-progress keys");
    assert_eq!(queued_names(&snapshot.queued), queued, "queued keys");

    for key in &snapshot.queued {
        assert!(
            !wip.contains(&key.name()),
            "{} is both queued and in progress",
            key.name()
        );
    }
    snapshot
}

async fn start(wq: &dyn WorkQueue, key: &str) -> Box<dyn OwnedInProgressKey> {
    let snapshot = wq.enumerate().await.unwrap();
    let Some(queued) = snapshot.queued.iter().find(|queued| queued.name() == key) else {
        panic!("{key} is not queued: {snapshot:?}");
    };
    queued.start(&CancellationToken::new()).await.unwrap()
}

async fn queue_all(wq: &dyn WorkQueue, keys: &[&str]) {
    for key in keys {
        wq.queue(key, Options::default()).await.unwrap();
    }
}

/// Ordering, deduplication, ownership, scheduling and dead-letter scenarios.
///
/// `delay` is the smallest deferral the backend reliably honours.
pub async fn test_semantics<F>(ctor: F, delay: Duration)
where
    F: Fn(usize) -> Arc<dyn WorkQueue>,
{
    let settle = delay + Duration::from_millis(200);

    // Arrival order among equal priorities.
    let wq = ctor(LIMIT);
    queue_all(wq.as_ref(), &["foo", "bar", "baz"]).await;
    check_queue(wq.as_ref(), &[], &["foo", "bar", "baz"]).await;

    // Enumerate is bounded.
    let wq = ctor(2);
    queue_all(wq.as_ref(), &["foo", "bar", "baz"]).await;
    check_queue(wq.as_ref(), &[], &["foo", "bar"]).await;

    // Duplicates collapse.
    let wq = ctor(LIMIT);
    queue_all(wq.as_ref(), &["foo", "foo", "bar", "foo"]).await;
    check_queue(wq.as_ref(), &[], &["foo", "bar"]).await;

    // Higher priority first; duplicates keep the highest priority seen.
    let wq = ctor(LIMIT);
    wq.queue("foo", Options::with_priority(0)).await.unwrap();
    wq.queue("bar", Options::with_priority(10)).await.unwrap();
    wq.queue("baz", Options::with_priority(5)).await.unwrap();
    check_queue(wq.as_ref(), &[], &["bar", "baz", "foo"]).await;
    wq.queue("foo", Options::with_priority(20)).await.unwrap();
    wq.queue("bar", Options::with_priority(1)).await.unwrap();
    let snapshot = check_queue(wq.as_ref(), &[], &["foo", "bar", "baz"]).await;
    assert_eq!(snapshot.queued[0].priority(), 20);
    assert_eq!(snapshot.queued[1].priority(), 10);

    // Start then complete.
    let wq = ctor(LIMIT);
    queue_all(wq.as_ref(), &["foo", "bar"]).await;
    let owned = start(wq.as_ref(), "foo").await;
    let ctx = owned.context();
    assert!(!ctx.is_cancelled());
    assert_eq!(owned.attempts(), 1);
    check_queue(wq.as_ref(), &["foo"], &["bar"]).await;
    owned.complete().await.unwrap();
    assert!(ctx.is_cancelled());
    check_queue(wq.as_ref(), &[], &["bar"]).await;

    // A requeued key goes to the back.
    let wq = ctor(LIMIT);
    queue_all(wq.as_ref(), &["foo", "bar"]).await;
    let owned = start(wq.as_ref(), "foo").await;
    owned.requeue().await.unwrap();
    assert!(owned.context().is_cancelled());
    check_queue(wq.as_ref(), &[], &["bar", "foo"]).await;

    // Queuing an in-progress key waits for the current owner.
    let wq = ctor(LIMIT);
    queue_all(wq.as_ref(), &["foo"]).await;
    let owned = start(wq.as_ref(), "foo").await;
    queue_all(wq.as_ref(), &["foo", "bar"]).await;
    check_queue(wq.as_ref(), &["foo"], &["bar"]).await;
    assert_eq!(
        wq.get_key_state("foo").await.unwrap().unwrap().status,
        KeyStatus::InProgress
    );
    owned.complete().await.unwrap();
    check_queue(wq.as_ref(), &[], &["foo", "bar"]).await;
    assert_eq!(
        wq.get_key_state("foo").await.unwrap().unwrap().status,
        KeyStatus::Queued
    );

    // Requeue may raise priority.
    let wq = ctor(LIMIT);
    queue_all(wq.as_ref(), &["foo", "bar"]).await;
    let owned = start(wq.as_ref(), "foo").await;
    owned
        .requeue_with_options(Options::with_priority(10))
        .await
        .unwrap();
    check_queue(wq.as_ref(), &[], &["foo", "bar"]).await;

    // Requeue with a delay hides the key until it elapses.
    let wq = ctor(LIMIT);
    queue_all(wq.as_ref(), &["foo"]).await;
    let owned = start(wq.as_ref(), "foo").await;
    owned
        .requeue_with_options(Options::with_delay(delay))
        .await
        .unwrap();
    check_queue(wq.as_ref(), &[], &[]).await;
    let state = wq.get_key_state("foo").await.unwrap().unwrap();
    assert_eq!(state.status, KeyStatus::Queued);
    assert!(state.not_before.is_some());
    tokio::time::sleep(settle).await;
    check_queue(wq.as_ref(), &[], &["foo"]).await;

    // The earliest not-before wins.
    let wq = ctor(LIMIT);
    wq.queue("foo", Options::with_delay(delay * 100)).await.unwrap();
    wq.queue("foo", Options::with_delay(delay)).await.unwrap();
    check_queue(wq.as_ref(), &[], &[]).await;
    tokio::time::sleep(settle).await;
    check_queue(wq.as_ref(), &[], &["foo"]).await;

    // Deferred keys keep their priority once they surface.
    let wq = ctor(LIMIT);
    wq.queue(
        "urgent",
        Options {
            priority: 10,
            ..Options::with_delay(delay)
        },
    )
    .await
    .unwrap();
    queue_all(wq.as_ref(), &["normal"]).await;
    check_queue(wq.as_ref(), &[], &["normal"]).await;
    tokio::time::sleep(settle).await;
    check_queue(wq.as_ref(), &[], &["urgent", "normal"]).await;

    // A plain duplicate does not clear an existing not-before.
    let wq = ctor(LIMIT);
    wq.queue("foo", Options::with_delay(delay)).await.unwrap();
    queue_all(wq.as_ref(), &["foo"]).await;
    check_queue(wq.as_ref(), &[], &[]).await;
    tokio::time::sleep(settle).await;
    check_queue(wq.as_ref(), &[], &["foo"]).await;

    // Attempts accumulate across starts and survive dead-lettering.
    let wq = ctor(LIMIT);
    queue_all(wq.as_ref(), &["foo"]).await;
    let owned = start(wq.as_ref(), "foo").await;
    assert_eq!(owned.attempts(), 1);
    owned.requeue().await.unwrap();
    assert_eq!(wq.get_key_state("foo").await.unwrap().unwrap().attempts, 1);
    let owned = start(wq.as_ref(), "foo").await;
    assert_eq!(owned.attempts(), 2);
    owned.deadletter().await.unwrap();
    assert!(owned.context().is_cancelled());

    let snapshot = check_queue(wq.as_ref(), &[], &[]).await;
    assert_eq!(snapshot.dead_lettered.len(), 1);
    let dead = &snapshot.dead_lettered[0];
    assert_eq!(dead.name(), "foo");
    assert_eq!(dead.attempts(), 2);
    assert!(dead.failed_time().is_some());
    let state = wq.get_key_state("foo").await.unwrap().unwrap();
    assert_eq!(state.status, KeyStatus::DeadLettered);
    assert_eq!(state.attempts, 2);

    // Returning a dead key resets its attempts.
    dead.requeue().await.unwrap();
    let snapshot = check_queue(wq.as_ref(), &[], &["foo"]).await;
    assert!(snapshot.dead_lettered.is_empty());
    let owned = start(wq.as_ref(), "foo").await;
    assert_eq!(owned.attempts(), 1);
    owned.complete().await.unwrap();
    assert!(wq.get_key_state("foo").await.unwrap().is_none());

    // A live representation hides the dead-letter entry.
    let wq = ctor(LIMIT);
    queue_all(wq.as_ref(), &["foo"]).await;
    start(wq.as_ref(), "foo").await.deadletter().await.unwrap();
    queue_all(wq.as_ref(), &["foo"]).await;
    let snapshot = check_queue(wq.as_ref(), &[], &["foo"]).await;
    assert!(snapshot.dead_lettered.is_empty());

    // Owned operations after a completed handover are no-ops.
    let wq = ctor(LIMIT);
    queue_all(wq.as_ref(), &["foo"]).await;
    let owned = start(wq.as_ref(), "foo").await;
    owned.complete().await.unwrap();
    owned.requeue().await.unwrap();
    check_queue(wq.as_ref(), &[], &[]).await;

    assert!(ctor(LIMIT).get_key_state("nothing").await.unwrap().is_none());
}

/// Drives many keys through [`DispatchHandler`] with overlapping triggers
/// and checks that every key is processed exactly once without exceeding
/// the concurrency bound.
pub async fn test_concurrency<F>(ctor: F)
where
    F: Fn(usize) -> Arc<dyn WorkQueue>,
{
    const KEYS: usize = 40;
    const CONCURRENCY: usize = 5;

    let wq = ctor(LIMIT);
    for i in 0..KEYS {
        wq.queue(&format!("key-{i:02}"), Options::default())
            .await
            .unwrap();
    }

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(HashMap::<String, usize>::new()));
    let callback: Arc<dyn Callback> = {
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        let seen = Arc::clone(&seen);
        Arc::new(move |_ctx: CancellationToken, key: String, _opts: Options| {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let seen = Arc::clone(&seen);
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                *seen.lock().unwrap().entry(key).or_default() += 1;
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                anyhow::Ok(())
            }
        })
    };

    let handler = DispatchHandler::new(
        Arc::clone(&wq),
        DispatchSettings::new(CONCURRENCY),
        callback,
    );

    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let done = seen.lock().unwrap().len() == KEYS;
            if done && wq.enumerate().await.unwrap().in_progress.is_empty() {
                break;
            }
            for outcome in join_all((0..4).map(|_| handler.trigger())).await {
                outcome.unwrap();
            }
        }
    })
    .await
    .expect("keys were not drained in time");

    assert!(peak.load(Ordering::SeqCst) <= CONCURRENCY, "concurrency bound exceeded");
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), KEYS);
    for (key, count) in seen.iter() {
        assert_eq!(*count, 1, "{key} processed {count} times");
    }
    check_queue(wq.as_ref(), &[], &[]).await;
}

/// State written through one instance is visible through another.
///
/// `ctor` must return instances over the same underlying storage.
pub async fn test_durability<F>(ctor: F)
where
    F: Fn(usize) -> Arc<dyn WorkQueue>,
{
    let writer = ctor(LIMIT);
    writer.queue("foo", Options::with_priority(3)).await.unwrap();
    queue_all(writer.as_ref(), &["bar"]).await;
    drop(writer);

    let reader = ctor(LIMIT);
    let snapshot = check_queue(reader.as_ref(), &[], &["foo", "bar"]).await;
    assert_eq!(snapshot.queued[0].priority(), 3);

    let owned = start(reader.as_ref(), "foo").await;
    let other = ctor(LIMIT);
    check_queue(other.as_ref(), &["foo"], &["bar"]).await;

    owned.deadletter().await.unwrap();
    let snapshot = check_queue(other.as_ref(), &[], &["bar"]).await;
    assert_eq!(snapshot.dead_lettered.len(), 1);
    assert_eq!(snapshot.dead_lettered[0].attempts(), 1);

    snapshot.dead_lettered[0].requeue().await.unwrap();
    check_queue(ctor(LIMIT).as_ref(), &[], &["foo", "bar"]).await;
}
