//! Durable queue backend over any [`ObjectStore`].
//!
//! Layout, one object per key with all state in user metadata:
//!
//! ```text
//! queued/{key}        priority, queued-at, [not-before], [attempts]
//! in-progress/{key}   priority, queued-at, attempts, lease-expiration
//! dead-letter/{key}   priority, queued-at, attempts, failed-time
//! ```
//!
//! Every transition is a create-if-absent or update-if-unchanged write, so
//! any number of dispatchers can share one bucket.

mod heartbeat;
mod keys;
mod metadata;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use tracing::{debug, info};

use self::keys::{DeadObject, ObservedObject, QueuedObject};
use self::metadata::{
    attempts, dead_letter_name, in_progress_name, merge, parse_time, priority, queued_name, Entry,
    DEAD_LETTER_PREFIX, FAILED_TIME, IN_PROGRESS_PREFIX, NOT_BEFORE, QUEUED_AT, QUEUED_PREFIX,
};
use crate::queue::{
    validate_key, DeadLetteredKey, Enumeration, KeyState, KeyStatus, ObservedInProgressKey,
    Options, QueueConfig, QueueError, QueuedKey, WorkQueue,
};
use crate::storage::{ObjectAttrs, ObjectStore, PutCondition, StorageError};

/// Bound on create/merge rounds when concurrent writers keep racing a key.
const MAX_ENQUEUE_ATTEMPTS: usize = 8;

/// Object-store backed [`WorkQueue`].
#[derive(Debug, Clone)]
pub struct ObjectStoreQueue {
    store: Arc<dyn ObjectStore>,
    limit: usize,
    config: QueueConfig,
}

impl ObjectStoreQueue {
    /// Creates a queue whose `enumerate` returns at most `limit` queued keys.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::InvalidConfig` if `config` fails validation; a
    /// zero refresh interval cannot drive the lease heartbeat.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        limit: usize,
        config: QueueConfig,
    ) -> Result<Self, QueueError> {
        config.validate().map_err(QueueError::InvalidConfig)?;
        Ok(Self {
            store,
            limit,
            config,
        })
    }

    /// The configured lease and retry timing.
    #[must_use]
    pub const fn config(&self) -> &QueueConfig {
        &self.config
    }
}

/// How an entry landed in the queued set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Enqueued {
    Created,
    Merged,
}

/// Writes `queued/{key}`, merging into an existing entry.
///
/// A duplicate that vanishes or changes between the failed create and the
/// merge restarts the whole operation.
pub(crate) async fn enqueue(
    store: &dyn ObjectStore,
    key: &str,
    entry: Entry,
) -> Result<Enqueued, QueueError> {
    let name = queued_name(key);

    for _ in 0..MAX_ENQUEUE_ATTEMPTS {
        match store
            .put(&name, entry.to_metadata(Utc::now()), PutCondition::IfNoneMatch)
            .await
        {
            Ok(_) => return Ok(Enqueued::Created),
            Err(StorageError::PreconditionFailed { .. }) => {}
            Err(err) => return Err(err.into()),
        }

        debug!(key, "Key already queued, merging");
        let existing = match store.attrs(&name).await {
            Ok(existing) => existing,
            Err(StorageError::NotFound { .. }) => {
                info!(key, "Key was claimed before the duplicate could be read, retrying");
                continue;
            }
            Err(err) => return Err(err.into()),
        };

        let Some(merged) = merge(&existing.metadata, entry) else {
            return Ok(Enqueued::Merged);
        };
        match store
            .put(&name, merged, PutCondition::IfMatch(existing.etag))
            .await
        {
            Ok(_) => return Ok(Enqueued::Merged),
            Err(StorageError::PreconditionFailed { .. }) => {
                info!(key, "Queued key changed during merge, retrying");
            }
            Err(err) => return Err(err.into()),
        }
    }

    Err(QueueError::Contended {
        key: key.to_string(),
        attempts: MAX_ENQUEUE_ATTEMPTS,
    })
}

fn strip_names(objects: Vec<ObjectAttrs>, prefix: &str) -> Vec<(String, ObjectAttrs)> {
    objects
        .into_iter()
        .filter_map(|attrs| {
            let key = attrs.name.strip_prefix(prefix)?.to_string();
            Some((key, attrs))
        })
        .collect()
}

#[async_trait]
impl WorkQueue for ObjectStoreQueue {
    async fn queue(&self, key: &str, opts: Options) -> Result<(), QueueError> {
        validate_key(key)?;
        let entry = Entry {
            priority: opts.priority,
            not_before: opts.effective_not_before(Utc::now()),
            attempts: 0,
        };

        match enqueue(self.store.as_ref(), key, entry).await? {
            Enqueued::Created => counter!("workqueue.added_keys").increment(1),
            Enqueued::Merged => counter!("workqueue.deduped_keys").increment(1),
        }
        Ok(())
    }

    #[allow(clippy::cast_precision_loss)]
    async fn enumerate(&self) -> Result<Enumeration, QueueError> {
        // In-progress first: a key moving from queued to in-progress while
        // the listings run then shows up in at most one of them.
        let leased = self.store.list(IN_PROGRESS_PREFIX).await?;
        let (waiting, failed) = tokio::try_join!(
            self.store.list(QUEUED_PREFIX),
            self.store.list(DEAD_LETTER_PREFIX),
        )?;
        let now = Utc::now();

        let mut max_attempts = 0;
        let mut in_progress: Vec<Box<dyn ObservedInProgressKey>> = Vec::new();
        for attrs in leased {
            let Some(key) = attrs.name.strip_prefix(IN_PROGRESS_PREFIX).map(str::to_string) else {
                continue;
            };
            max_attempts = max_attempts.max(attempts(&attrs.metadata));
            in_progress.push(Box::new(ObservedObject::new(
                Arc::clone(&self.store),
                key,
                attrs,
                now,
            )));
        }
        let queued = strip_names(waiting, QUEUED_PREFIX);
        let dead = strip_names(failed, DEAD_LETTER_PREFIX);

        let active: HashSet<String> = in_progress
            .iter()
            .map(|key| key.name().to_string())
            .collect();

        let mut deferred = 0_usize;
        let mut live_names: HashSet<String> = HashSet::new();
        let mut visible: Vec<(i64, DateTime<Utc>, String, ObjectAttrs)> = Vec::new();
        for (key, attrs) in queued {
            live_names.insert(key.clone());
            max_attempts = max_attempts.max(attempts(&attrs.metadata));
            if parse_time(&attrs.metadata, NOT_BEFORE).is_some_and(|nbf| nbf > now) {
                deferred += 1;
                continue;
            }
            if active.contains(&key) {
                continue;
            }
            let queued_at =
                parse_time(&attrs.metadata, QUEUED_AT).unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
            visible.push((priority(&attrs.metadata), queued_at, key, attrs));
        }
        let ready = visible.len();
        visible.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));
        visible.truncate(self.limit);

        let queued: Vec<Box<dyn QueuedKey>> = visible
            .into_iter()
            .map(|(_, _, key, attrs)| {
                Box::new(QueuedObject::new(
                    Arc::clone(&self.store),
                    key,
                    attrs,
                    self.config,
                )) as Box<dyn QueuedKey>
            })
            .collect();

        let dead_lettered: Vec<Box<dyn DeadLetteredKey>> = dead
            .into_iter()
            .filter(|(key, _)| !active.contains(key) && !live_names.contains(key))
            .map(|(key, attrs)| {
                Box::new(DeadObject::new(Arc::clone(&self.store), key, attrs))
                    as Box<dyn DeadLetteredKey>
            })
            .collect();

        gauge!("workqueue.in_progress_keys").set(in_progress.len() as f64);
        gauge!("workqueue.queued_keys").set(ready as f64);
        gauge!("workqueue.notbefore_keys").set(deferred as f64);
        gauge!("workqueue.dead_lettered_keys").set(dead_lettered.len() as f64);
        gauge!("workqueue.max_attempts").set(f64::from(max_attempts));

        Ok(Enumeration {
            in_progress,
            queued,
            dead_lettered,
        })
    }

    async fn get_key_state(&self, key: &str) -> Result<Option<KeyState>, QueueError> {
        validate_key(key)?;
        let lookups = [
            (in_progress_name(key), KeyStatus::InProgress),
            (queued_name(key), KeyStatus::Queued),
            (dead_letter_name(key), KeyStatus::DeadLettered),
        ];

        for (name, status) in lookups {
            let attrs = match self.store.attrs(&name).await {
                Ok(attrs) => attrs,
                Err(StorageError::NotFound { .. }) => continue,
                Err(err) => return Err(err.into()),
            };
            return Ok(Some(KeyState {
                key: key.to_string(),
                status,
                priority: priority(&attrs.metadata),
                attempts: attempts(&attrs.metadata),
                not_before: (status == KeyStatus::Queued)
                    .then(|| parse_time(&attrs.metadata, NOT_BEFORE))
                    .flatten(),
                failed_time: (status == KeyStatus::DeadLettered)
                    .then(|| parse_time(&attrs.metadata, FAILED_TIME))
                    .flatten(),
            }));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests;
