//! Lease renewal for owned in-progress objects.

use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::metadata::{after, format_time, LEASE_EXPIRATION};
use crate::queue::QueueConfig;
use crate::storage::{ObjectAttrs, ObjectStore, PutCondition};

/// Spawns the renewal loop for one owned object.
///
/// Every `refresh_interval` the lease expiration is pushed to
/// `now + lease_ttl` with an `If-Match` write against the last observed
/// `ETag`. Any failed renewal means another process touched the object, so
/// the owner token is cancelled and the loop exits. The loop also exits as
/// soon as `owner` is cancelled.
///
/// `attrs` is write-locked for the duration of each renewal; terminal
/// operations cancel `owner` and then take the lock, which fences them
/// behind any renewal already in flight.
pub(crate) fn spawn(
    store: Arc<dyn ObjectStore>,
    attrs: Arc<RwLock<ObjectAttrs>>,
    owner: CancellationToken,
    config: QueueConfig,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = config.refresh_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = owner.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let mut current = attrs.write().await;
            if owner.is_cancelled() {
                return;
            }

            let mut metadata = current.metadata.clone();
            metadata.insert(
                LEASE_EXPIRATION.to_string(),
                format_time(after(Utc::now(), config.lease_ttl())),
            );

            match store
                .put(
                    &current.name,
                    metadata,
                    PutCondition::IfMatch(current.etag.clone()),
                )
                .await
            {
                Ok(renewed) => {
                    debug!(object = %current.name, "Renewed lease");
                    *current = renewed;
                }
                Err(err) => {
                    warn!(object = %current.name, error = %err, "Lost lease, cancelling owner");
                    counter!("workqueue.lease.lost").increment(1);
                    owner.cancel();
                    return;
                }
            }
        }
    })
}
