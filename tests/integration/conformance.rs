//! The shared backend suite against S3.

use std::time::Duration;

use workqueue::conformance;
use workqueue::QueueConfig;

use crate::common::{isolated_store, queue_over, test_client};

#[tokio::test]
#[cfg_attr(
    not(feature = "integration"),
    ignore = "requires S3 (enable feature integration)"
)]
async fn test_s3_semantics() {
    let client = test_client().await;
    conformance::test_semantics(
        |limit| queue_over(&isolated_store(&client), limit, QueueConfig::default()),
        Duration::from_secs(2),
    )
    .await;
}

#[tokio::test]
#[cfg_attr(
    not(feature = "integration"),
    ignore = "requires S3 (enable feature integration)"
)]
async fn test_s3_concurrency() {
    let client = test_client().await;
    conformance::test_concurrency(|limit| {
        queue_over(&isolated_store(&client), limit, QueueConfig::default())
    })
    .await;
}

#[tokio::test]
#[cfg_attr(
    not(feature = "integration"),
    ignore = "requires S3 (enable feature integration)"
)]
async fn test_s3_durability() {
    let client = test_client().await;
    let store = isolated_store(&client);
    conformance::test_durability(|limit| queue_over(&store, limit, QueueConfig::default())).await;
}
