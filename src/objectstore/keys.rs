//! Key handles for the object-store backend.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::histogram;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::enqueue;
use super::heartbeat;
use super::metadata::{
    after, attempts, dead_letter_name, format_time, in_progress_name, parse_time, priority, Entry,
    ATTEMPTS, CLAIMED_AT, FAILED_TIME, LEASE_EXPIRATION, NOT_BEFORE, QUEUED_AT,
};
use crate::queue::{
    priority_class, DeadLetteredKey, InProgressKey, Key, ObservedInProgressKey, Options,
    OwnedInProgressKey, QueueConfig, QueueError, QueuedKey,
};
use crate::storage::{ObjectAttrs, ObjectStore, PutCondition, StorageError};

pub(crate) struct QueuedObject {
    store: Arc<dyn ObjectStore>,
    key: String,
    priority: i64,
    attrs: ObjectAttrs,
    config: QueueConfig,
}

impl QueuedObject {
    pub(crate) fn new(
        store: Arc<dyn ObjectStore>,
        key: String,
        attrs: ObjectAttrs,
        config: QueueConfig,
    ) -> Self {
        Self {
            priority: priority(&attrs.metadata),
            store,
            key,
            attrs,
            config,
        }
    }
}

/// What became of the queued object after the in-progress object was created.
enum ClaimRelease {
    /// Deleted as claimed.
    Released,
    /// Merged with a new `Queue` since the claim; kept for another run.
    Requeued,
    /// Deleted by another worker that started the key meanwhile.
    Consumed,
}

impl QueuedObject {
    /// Deletes the claimed queued object unless a `Queue` merged into it.
    ///
    /// A rewrite that still carries a claim marker came from a starter that
    /// lost the in-progress create; it is deleted too.
    async fn release_claim(&self, mut etag: String) -> Result<ClaimRelease, StorageError> {
        loop {
            match self.store.delete_if_match(&self.attrs.name, &etag).await {
                Ok(()) => return Ok(ClaimRelease::Released),
                Err(StorageError::NotFound { .. }) => return Ok(ClaimRelease::Consumed),
                Err(StorageError::PreconditionFailed { .. }) => {}
                Err(err) => return Err(err),
            }

            match self.store.attrs(&self.attrs.name).await {
                Ok(current) if current.metadata.contains_key(CLAIMED_AT) => etag = current.etag,
                Ok(_) => return Ok(ClaimRelease::Requeued),
                Err(StorageError::NotFound { .. }) => return Ok(ClaimRelease::Released),
                Err(err) => return Err(err),
            }
        }
    }
}

impl Key for QueuedObject {
    fn name(&self) -> &str {
        &self.key
    }

    fn priority(&self) -> i64 {
        self.priority
    }
}

#[async_trait]
impl QueuedKey for QueuedObject {
    /// Claims the key.
    ///
    /// Steps:
    /// 1. Rewrite `queued/{key}` with a claim marker under `If-Match` on the
    ///    enumerated `ETag`; of several workers starting from the same
    ///    snapshot, one wins.
    /// 2. Create `in-progress/{key}` under `If-None-Match` with attempts
    ///    bumped, not-before cleared and a fresh lease.
    /// 3. Delete `queued/{key}` under `If-Match` on the claimed `ETag`. An
    ///    entry merged with a new `Queue` since the claim is kept; a missing
    ///    entry means another worker ran the key meanwhile, so the new lease
    ///    is rolled back.
    async fn start(
        &self,
        parent: &CancellationToken,
    ) -> Result<Box<dyn OwnedInProgressKey>, QueueError> {
        let now = Utc::now();
        let mut claim = self.attrs.metadata.clone();
        claim.insert(CLAIMED_AT.to_string(), format_time(now));
        let claimed = match self
            .store
            .put(
                &self.attrs.name,
                claim,
                PutCondition::IfMatch(self.attrs.etag.clone()),
            )
            .await
        {
            Ok(claimed) => claimed,
            Err(StorageError::PreconditionFailed { .. } | StorageError::NotFound { .. }) => {
                return Err(QueueError::NotQueued {
                    key: self.key.clone(),
                })
            }
            Err(err) => return Err(err.into()),
        };

        let attempts = attempts(&claimed.metadata).saturating_add(1);
        let mut metadata = claimed.metadata.clone();
        metadata.remove(CLAIMED_AT);
        metadata.insert(ATTEMPTS.to_string(), attempts.to_string());
        metadata.insert(
            LEASE_EXPIRATION.to_string(),
            format_time(after(now, self.config.lease_ttl())),
        );
        metadata.remove(NOT_BEFORE);

        let lease = match self
            .store
            .put(
                &in_progress_name(&self.key),
                metadata,
                PutCondition::IfNoneMatch,
            )
            .await
        {
            Ok(lease) => lease,
            Err(StorageError::PreconditionFailed { .. }) => {
                return Err(QueueError::AlreadyInProgress {
                    key: self.key.clone(),
                })
            }
            Err(err) => return Err(err.into()),
        };

        match self.release_claim(claimed.etag).await {
            Ok(ClaimRelease::Released) => {}
            Ok(ClaimRelease::Requeued) => {
                debug!(key = %self.key, "Key was queued again while starting, keeping the new entry");
            }
            Ok(ClaimRelease::Consumed) => {
                info!(key = %self.key, "Queued entry was consumed by another worker, abandoning start");
                if let Err(err) = self.store.delete_if_match(&lease.name, &lease.etag).await {
                    if !err.is_not_found() && !err.is_precondition_failed() {
                        warn!(key = %self.key, error = %err, "Failed to roll back stale in-progress object");
                    }
                }
                return Err(QueueError::NotQueued {
                    key: self.key.clone(),
                });
            }
            Err(err) => {
                warn!(key = %self.key, error = %err, "Failed to delete queued object after claiming it; the key will run again");
            }
        }

        if let Some(queued_at) = parse_time(&lease.metadata, QUEUED_AT) {
            let waited = (now - queued_at).to_std().unwrap_or_default();
            histogram!("workqueue.wait_latency_seconds", "priority_class" => priority_class(self.priority))
                .record(waited.as_secs_f64());
        }
        histogram!("workqueue.retry_attempts").record(f64::from(attempts.saturating_sub(1)));
        debug!(key = %self.key, attempts, "Started key");

        Ok(Box::new(OwnedObject::new(
            Arc::clone(&self.store),
            self.key.clone(),
            self.priority,
            attempts,
            lease,
            self.config,
            parent.child_token(),
        )))
    }
}

pub(crate) struct ObservedObject {
    store: Arc<dyn ObjectStore>,
    key: String,
    priority: i64,
    attrs: ObjectAttrs,
    orphaned: bool,
}

impl ObservedObject {
    pub(crate) fn new(
        store: Arc<dyn ObjectStore>,
        key: String,
        attrs: ObjectAttrs,
        now: DateTime<Utc>,
    ) -> Self {
        // Missing and malformed leases count as expired.
        let orphaned = parse_time(&attrs.metadata, LEASE_EXPIRATION).map_or(true, |exp| exp <= now);
        Self {
            priority: priority(&attrs.metadata),
            store,
            key,
            attrs,
            orphaned,
        }
    }
}

impl Key for ObservedObject {
    fn name(&self) -> &str {
        &self.key
    }

    fn priority(&self) -> i64 {
        self.priority
    }
}

#[async_trait]
impl InProgressKey for ObservedObject {
    /// Takes the key away from whoever holds it.
    ///
    /// The in-progress object is first rewritten under `If-Match` without a
    /// lease, so the holder's next renewal fails and cancels it. If the
    /// object changed since it was observed, the holder is alive and the
    /// requeue is skipped.
    async fn requeue(&self) -> Result<(), QueueError> {
        let mut metadata = self.attrs.metadata.clone();
        metadata.remove(LEASE_EXPIRATION);
        match self
            .store
            .put(
                &self.attrs.name,
                metadata,
                PutCondition::IfMatch(self.attrs.etag.clone()),
            )
            .await
        {
            Ok(_) => {}
            Err(StorageError::PreconditionFailed { .. } | StorageError::NotFound { .. }) => {
                info!(key = %self.key, "In-progress key changed since it was observed, not requeuing");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }

        let entry = Entry {
            priority: self.priority,
            not_before: None,
            attempts: attempts(&self.attrs.metadata),
        };
        enqueue(self.store.as_ref(), &self.key, entry).await?;
        self.store.delete(&self.attrs.name).await?;
        Ok(())
    }
}

impl ObservedInProgressKey for ObservedObject {
    fn is_orphaned(&self) -> bool {
        self.orphaned
    }
}

pub(crate) struct OwnedObject {
    store: Arc<dyn ObjectStore>,
    key: String,
    priority: i64,
    attempts: u32,
    attrs: Arc<RwLock<ObjectAttrs>>,
    owner: CancellationToken,
    started: Instant,
}

impl OwnedObject {
    fn new(
        store: Arc<dyn ObjectStore>,
        key: String,
        priority: i64,
        attempts: u32,
        lease: ObjectAttrs,
        config: QueueConfig,
        owner: CancellationToken,
    ) -> Self {
        let attrs = Arc::new(RwLock::new(lease));
        // Detached; the loop ends when `owner` is cancelled.
        drop(heartbeat::spawn(
            Arc::clone(&store),
            Arc::clone(&attrs),
            owner.clone(),
            config,
        ));
        Self {
            store,
            key,
            priority,
            attempts,
            attrs,
            owner,
            started: Instant::now(),
        }
    }

    /// Ends ownership and returns the lease object if it is still ours.
    async fn release(&self) -> Result<Option<ObjectAttrs>, QueueError> {
        self.owner.cancel();
        let attrs = self.attrs.read().await.clone();

        histogram!("workqueue.process_latency_seconds", "priority_class" => priority_class(self.priority))
            .record(self.started.elapsed().as_secs_f64());

        match self.store.attrs(&attrs.name).await {
            Ok(current) if current.etag == attrs.etag => Ok(Some(attrs)),
            Ok(_) | Err(StorageError::NotFound { .. }) => {
                warn!(key = %self.key, "Lease was lost, leaving the key to its current holder");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl Drop for OwnedObject {
    fn drop(&mut self) {
        self.owner.cancel();
    }
}

impl Key for OwnedObject {
    fn name(&self) -> &str {
        &self.key
    }

    fn priority(&self) -> i64 {
        self.priority
    }
}

#[async_trait]
impl InProgressKey for OwnedObject {
    async fn requeue(&self) -> Result<(), QueueError> {
        self.requeue_with_options(Options::default()).await
    }
}

#[async_trait]
impl OwnedInProgressKey for OwnedObject {
    fn context(&self) -> CancellationToken {
        self.owner.clone()
    }

    fn attempts(&self) -> u32 {
        self.attempts
    }

    async fn requeue_with_options(&self, opts: Options) -> Result<(), QueueError> {
        let Some(lease) = self.release().await? else {
            return Ok(());
        };

        let entry = Entry {
            priority: self.priority.max(opts.priority),
            not_before: opts.effective_not_before(Utc::now()),
            attempts: self.attempts,
        };
        enqueue(self.store.as_ref(), &self.key, entry).await?;
        self.store.delete(&lease.name).await?;
        Ok(())
    }

    async fn complete(&self) -> Result<(), QueueError> {
        let Some(lease) = self.release().await? else {
            return Ok(());
        };

        if let Err(err) = self.store.delete(&dead_letter_name(&self.key)).await {
            warn!(key = %self.key, error = %err, "Failed to delete stale dead-letter entry");
        }
        self.store.delete(&lease.name).await?;
        Ok(())
    }

    async fn deadletter(&self) -> Result<(), QueueError> {
        let Some(lease) = self.release().await? else {
            return Ok(());
        };

        let mut metadata = lease.metadata.clone();
        metadata.remove(LEASE_EXPIRATION);
        metadata.insert(FAILED_TIME.to_string(), format_time(Utc::now()));
        // Unconditional: a key that fails again replaces its old entry.
        self.store
            .put(&dead_letter_name(&self.key), metadata, PutCondition::None)
            .await?;
        self.store.delete(&lease.name).await?;
        Ok(())
    }
}

pub(crate) struct DeadObject {
    store: Arc<dyn ObjectStore>,
    key: String,
    priority: i64,
    attempts: u32,
    failed_time: Option<DateTime<Utc>>,
    name: String,
}

impl DeadObject {
    pub(crate) fn new(store: Arc<dyn ObjectStore>, key: String, attrs: ObjectAttrs) -> Self {
        Self {
            store,
            key,
            priority: priority(&attrs.metadata),
            attempts: attempts(&attrs.metadata),
            failed_time: parse_time(&attrs.metadata, FAILED_TIME),
            name: attrs.name,
        }
    }
}

impl Key for DeadObject {
    fn name(&self) -> &str {
        &self.key
    }

    fn priority(&self) -> i64 {
        self.priority
    }
}

#[async_trait]
impl DeadLetteredKey for DeadObject {
    fn failed_time(&self) -> Option<DateTime<Utc>> {
        self.failed_time
    }

    fn attempts(&self) -> u32 {
        self.attempts
    }

    async fn requeue(&self) -> Result<(), QueueError> {
        let entry = Entry {
            priority: self.priority,
            not_before: None,
            attempts: 0,
        };
        enqueue(self.store.as_ref(), &self.key, entry).await?;
        self.store.delete(&self.name).await?;
        Ok(())
    }
}
