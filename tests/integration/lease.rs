//! Lease renewal and reclaim against S3.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use workqueue::{handle, Callback, DispatchSettings, KeyStatus, Options, QueueConfig};

use crate::common::{isolated_store, queue_over, test_client};

fn short_leases() -> QueueConfig {
    QueueConfig::default().with_refresh_interval(Duration::from_millis(500))
}

#[tokio::test]
#[cfg_attr(
    not(feature = "integration"),
    ignore = "requires S3 (enable feature integration)"
)]
async fn test_heartbeat_keeps_key_owned() {
    let client = test_client().await;
    let wq = queue_over(&isolated_store(&client), 10, short_leases());
    wq.queue("foo", Options::default()).await.unwrap();

    let owned = wq.enumerate().await.unwrap().queued[0]
        .start(&CancellationToken::new())
        .await
        .unwrap();
    // Several lease lengths; only renewal keeps the key alive.
    tokio::time::sleep(Duration::from_secs(4)).await;

    let snapshot = wq.enumerate().await.unwrap();
    assert_eq!(snapshot.in_progress.len(), 1);
    assert!(!snapshot.in_progress[0].is_orphaned());
    assert!(!owned.context().is_cancelled());

    owned.complete().await.unwrap();
    assert!(wq.get_key_state("foo").await.unwrap().is_none());
}

#[tokio::test]
#[cfg_attr(
    not(feature = "integration"),
    ignore = "requires S3 (enable feature integration)"
)]
async fn test_abandoned_key_is_reclaimed_and_rerun() {
    let client = test_client().await;
    let wq = queue_over(&isolated_store(&client), 10, short_leases());
    wq.queue("foo", Options::with_priority(3)).await.unwrap();

    let owned = wq.enumerate().await.unwrap().queued[0]
        .start(&CancellationToken::new())
        .await
        .unwrap();
    drop(owned);
    tokio::time::sleep(Duration::from_secs(3)).await;

    let settings = DispatchSettings::new(2).with_config(short_leases());
    let noop: std::sync::Arc<dyn Callback> =
        std::sync::Arc::new(|_ctx: CancellationToken, _key: String, _opts: Options| async {
            anyhow::Ok(())
        });
    let ctx = CancellationToken::new();

    handle(&ctx, wq.as_ref(), &settings, noop.clone()).await.unwrap();
    let state = wq.get_key_state("foo").await.unwrap().unwrap();
    assert_eq!(state.status, KeyStatus::Queued);
    assert_eq!(state.priority, 3);
    assert_eq!(state.attempts, 1);

    handle(&ctx, wq.as_ref(), &settings, noop).await.unwrap();
    assert!(wq.get_key_state("foo").await.unwrap().is_none());
}
