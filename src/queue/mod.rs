//! Key vocabulary shared by every queue backend.
//!
//! A key moves through three sets: queued, in-progress, dead-lettered.
//! [`WorkQueue::enumerate`] returns a snapshot of all three; the handles in
//! that snapshot carry the operations legal from each state.

pub mod config;
mod error;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub use config::{
    QueueConfig, DEFAULT_BACKOFF_PERIOD, DEFAULT_MAXIMUM_BACKOFF_PERIOD, DEFAULT_REFRESH_INTERVAL,
};
pub use error::{
    get_non_retriable_details, get_requeue_delay, non_retriable, requeue_after, retry_after,
    NoRetryDetails, NonRetriableError, QueueError, RequeueError,
};

/// Options for [`WorkQueue::queue`] and [`OwnedInProgressKey::requeue_with_options`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Options {
    /// Higher runs earlier.
    pub priority: i64,
    /// Hide the key until this instant.
    pub not_before: Option<DateTime<Utc>>,
    /// Hide the key for this long from now.
    pub delay: Duration,
}

impl Options {
    /// Options with only a priority.
    #[must_use]
    pub fn with_priority(priority: i64) -> Self {
        Self {
            priority,
            ..Self::default()
        }
    }

    /// Options with only a delay.
    #[must_use]
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// The instant the key becomes visible, if deferred. When both a delay and
    /// an explicit instant are given, the later one applies.
    #[must_use]
    pub fn effective_not_before(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let from_delay = if self.delay.is_zero() {
            None
        } else {
            chrono::Duration::from_std(self.delay)
                .ok()
                .and_then(|delay| now.checked_add_signed(delay))
        };
        match (self.not_before, from_delay) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }
}

/// Where a key currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyStatus {
    /// Waiting to be claimed.
    Queued,
    /// Claimed by a worker.
    InProgress,
    /// Parked after exhausting its retries.
    DeadLettered,
}

/// Point-in-time description of one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyState {
    /// The key.
    pub key: String,
    /// Which set holds it.
    pub status: KeyStatus,
    /// Current priority.
    pub priority: i64,
    /// Completed `start` calls so far.
    pub attempts: u32,
    /// Deferred visibility, for queued keys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    /// When the key was dead-lettered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_time: Option<DateTime<Utc>>,
}

/// Snapshot returned by [`WorkQueue::enumerate`].
#[derive(Default)]
pub struct Enumeration {
    /// Every in-progress key, owned by anyone.
    pub in_progress: Vec<Box<dyn ObservedInProgressKey>>,
    /// Visible queued keys in dispatch order, at most `limit` of them.
    pub queued: Vec<Box<dyn QueuedKey>>,
    /// Every dead-lettered key without a live representation.
    pub dead_lettered: Vec<Box<dyn DeadLetteredKey>>,
}

impl std::fmt::Debug for Enumeration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Enumeration")
            .field("in_progress", &names(&self.in_progress))
            .field("queued", &names(&self.queued))
            .field("dead_lettered", &names(&self.dead_lettered))
            .finish()
    }
}

fn names<K: Key + ?Sized>(keys: &[Box<K>]) -> Vec<&str> {
    keys.iter().map(|key| key.name()).collect()
}

/// A queue backend.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Adds `key` to the queue, merging with an existing queued entry.
    async fn queue(&self, key: &str, opts: Options) -> Result<(), QueueError>;

    /// Takes a snapshot of all three sets.
    async fn enumerate(&self) -> Result<Enumeration, QueueError>;

    /// Looks up a single key. In-progress wins over queued, which wins over
    /// dead-lettered.
    async fn get_key_state(&self, key: &str) -> Result<Option<KeyState>, QueueError>;
}

#[async_trait]
impl<T: WorkQueue + ?Sized> WorkQueue for std::sync::Arc<T> {
    async fn queue(&self, key: &str, opts: Options) -> Result<(), QueueError> {
        (**self).queue(key, opts).await
    }

    async fn enumerate(&self) -> Result<Enumeration, QueueError> {
        (**self).enumerate().await
    }

    async fn get_key_state(&self, key: &str) -> Result<Option<KeyState>, QueueError> {
        (**self).get_key_state(key).await
    }
}

/// Common to every key handle.
pub trait Key: Send + Sync {
    /// The key's name.
    fn name(&self) -> &str;
    /// The key's priority at the time the handle was produced.
    fn priority(&self) -> i64;
}

/// A queued key from a snapshot.
#[async_trait]
pub trait QueuedKey: Key {
    /// Claims the key. The returned owner's context is a child of `parent`.
    ///
    /// # Errors
    ///
    /// Fails with a lost-race error (see [`QueueError::is_lost_race`]) if
    /// another worker claimed it first.
    async fn start(
        &self,
        parent: &CancellationToken,
    ) -> Result<Box<dyn OwnedInProgressKey>, QueueError>;
}

/// Operations on any in-progress key.
#[async_trait]
pub trait InProgressKey: Key {
    /// Returns the key to the queue immediately.
    async fn requeue(&self) -> Result<(), QueueError>;
}

/// An in-progress key observed in a snapshot, owned by anyone.
pub trait ObservedInProgressKey: InProgressKey {
    /// True when the owner's lease is missing, malformed or expired.
    fn is_orphaned(&self) -> bool;
}

/// An in-progress key owned by the current worker.
#[async_trait]
pub trait OwnedInProgressKey: InProgressKey {
    /// Cancelled when ownership ends, detected lease loss included.
    fn context(&self) -> CancellationToken;

    /// Number of times this key has been started, this start included.
    fn attempts(&self) -> u32;

    /// Returns the key to the queue with a delay and/or raised priority.
    async fn requeue_with_options(&self, opts: Options) -> Result<(), QueueError>;

    /// Removes the key; the work is done.
    async fn complete(&self) -> Result<(), QueueError>;

    /// Parks the key in the dead-letter set.
    async fn deadletter(&self) -> Result<(), QueueError>;
}

/// A dead-lettered key from a snapshot.
#[async_trait]
pub trait DeadLetteredKey: Key {
    /// When the key was dead-lettered.
    fn failed_time(&self) -> Option<DateTime<Utc>>;

    /// Attempts consumed before dead-lettering.
    fn attempts(&self) -> u32;

    /// Moves the key back to the queue with fresh attempts.
    async fn requeue(&self) -> Result<(), QueueError>;
}

/// Latency label for a priority: `"{priority / 100}xx"`.
#[must_use]
pub fn priority_class(priority: i64) -> String {
    format!("{}xx", priority / 100)
}

/// Rejects keys the object layout cannot hold.
///
/// # Errors
///
/// Returns `QueueError::InvalidKey` for empty keys and keys with a leading
/// `/` or control characters.
pub fn validate_key(key: &str) -> Result<(), QueueError> {
    let reason = if key.is_empty() {
        "must not be empty"
    } else if key.starts_with('/') {
        "must not start with '/'"
    } else if key.chars().any(char::is_control) {
        "must not contain control characters"
    } else {
        return Ok(());
    };
    Err(QueueError::InvalidKey {
        key: key.to_string(),
        reason,
    })
}
