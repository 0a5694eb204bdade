//! Errors raised by queue backends, and the vocabulary callbacks use to tell
//! the dispatcher what to do with a key.
//!
//! Callbacks return `anyhow::Result<()>`. Three constructors mark an error
//! with a disposition:
//!
//! - [`requeue_after`]: not a failure; run the key again after a delay.
//! - [`retry_after`]: a failure that should be retried after a delay.
//! - [`non_retriable`]: a permanent failure; the key is completed.
//!
//! The markers survive any amount of wrapping (`anyhow::Context`, or custom
//! error types holding the `anyhow::Error` as their `#[source]`), because the
//! accessors walk the whole error chain. Converting the error into a
//! `Box<dyn Error>` hides the marker type; keep the `anyhow::Error` instead.

use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::StorageError;

/// Errors returned by [`WorkQueue`](super::WorkQueue) and key operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The key name cannot be stored.
    #[error("invalid key {key:?}: {reason}")]
    InvalidKey {
        /// The rejected key.
        key: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// Another worker already holds this key.
    #[error("key {key:?} is already in progress")]
    AlreadyInProgress {
        /// The contended key.
        key: String,
    },

    /// The queued entry was claimed or changed after it was enumerated.
    #[error("key {key:?} is no longer queued")]
    NotQueued {
        /// The key that lost the race.
        key: String,
    },

    /// Concurrent writers kept invalidating a read-modify-write.
    #[error("key {key:?} kept changing after {attempts} attempts")]
    Contended {
        /// The contended key.
        key: String,
        /// How many attempts were made.
        attempts: usize,
    },

    /// The backend was given unusable timing.
    #[error("invalid queue configuration: {0}")]
    InvalidConfig(String),

    /// The underlying storage failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl QueueError {
    /// True when a `start` lost to another worker. Dispatchers skip such keys.
    #[must_use]
    pub const fn is_lost_race(&self) -> bool {
        matches!(self, Self::AlreadyInProgress { .. } | Self::NotQueued { .. })
    }
}

/// Marker carried by [`requeue_after`] and [`retry_after`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequeueError {
    delay: Duration,
    is_error: bool,
}

impl RequeueError {
    /// Requested delay before the key runs again.
    #[must_use]
    pub const fn delay(&self) -> Duration {
        self.delay
    }

    /// True when the requeue stems from a failure.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.is_error
    }
}

impl fmt::Display for RequeueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_error {
            write!(f, "retry after {:?}", self.delay)
        } else {
            write!(f, "requeue after {:?}", self.delay)
        }
    }
}

impl StdError for RequeueError {}

/// Details attached to a permanent failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoRetryDetails {
    /// Human-readable reason the key will not be retried.
    pub message: String,
}

/// Marker carried by [`non_retriable`].
#[derive(Debug)]
pub struct NonRetriableError {
    details: NoRetryDetails,
    source: anyhow::Error,
}

impl fmt::Display for NonRetriableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "non-retriable: {}", self.details.message)
    }
}

impl StdError for NonRetriableError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        // Deref yields the wrapped error itself, so markers below stay
        // reachable by downcast.
        Some(&*self.source)
    }
}

impl NonRetriableError {
    /// The attached details.
    #[must_use]
    pub const fn details(&self) -> &NoRetryDetails {
        &self.details
    }
}

/// Asks for the key to be processed again after `delay`. Not a failure: the
/// attempt counter does not drive dead-lettering for this outcome.
#[must_use]
pub fn requeue_after(delay: Duration) -> anyhow::Error {
    RequeueError {
        delay,
        is_error: false,
    }
    .into()
}

/// Reports a failure and asks for a retry after `delay` instead of the
/// default backoff.
#[must_use]
pub fn retry_after(delay: Duration) -> anyhow::Error {
    RequeueError {
        delay,
        is_error: true,
    }
    .into()
}

/// Marks `err` as permanent: the dispatcher completes the key instead of
/// retrying it.
#[must_use]
pub fn non_retriable(err: impl Into<anyhow::Error>, reason: impl Into<String>) -> anyhow::Error {
    NonRetriableError {
        details: NoRetryDetails {
            message: reason.into(),
        },
        source: err.into(),
    }
    .into()
}

/// Finds a requeue marker anywhere in `err`'s chain.
///
/// Returns the requested delay and whether the requeue stems from a failure.
#[must_use]
pub fn get_requeue_delay(err: &anyhow::Error) -> Option<(Duration, bool)> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<RequeueError>())
        .map(|marker| (marker.delay, marker.is_error))
}

/// Finds non-retriable details anywhere in `err`'s chain.
#[must_use]
pub fn get_non_retriable_details(err: &anyhow::Error) -> Option<&NoRetryDetails> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<NonRetriableError>())
        .map(NonRetriableError::details)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use anyhow::Context;

    use super::*;

    #[derive(Debug, Error)]
    #[error("reconcile failed")]
    struct ReconcileError {
        #[source]
        source: anyhow::Error,
    }

    fn wrapped(inner: anyhow::Error) -> anyhow::Error {
        ReconcileError { source: inner }.into()
    }

    #[test]
    fn test_requeue_after_is_not_an_error() {
        let err = requeue_after(Duration::from_secs(5));
        assert_eq!(
            get_requeue_delay(&err),
            Some((Duration::from_secs(5), false))
        );
        assert!(get_non_retriable_details(&err).is_none());
    }

    #[test]
    fn test_retry_after_is_an_error() {
        let err = retry_after(Duration::from_millis(1500));
        assert_eq!(
            get_requeue_delay(&err),
            Some((Duration::from_millis(1500), true))
        );
    }

    #[test]
    fn test_markers_survive_context() {
        let err = Err::<(), _>(retry_after(Duration::from_secs(2)))
            .context("calling upstream")
            .context("processing key")
            .unwrap_err();
        assert_eq!(
            get_requeue_delay(&err),
            Some((Duration::from_secs(2), true))
        );
    }

    #[test]
    fn test_markers_survive_custom_wrapping() {
        let err = wrapped(requeue_after(Duration::from_secs(7)));
        assert_eq!(err.to_string(), "reconcile failed");
        assert_eq!(
            get_requeue_delay(&err),
            Some((Duration::from_secs(7), false))
        );

        let err = wrapped(non_retriable(anyhow::anyhow!("bad input"), "malformed key"));
        let details = get_non_retriable_details(&err).unwrap();
        assert_eq!(details.message, "malformed key");
    }

    #[test]
    fn test_non_retriable_exposes_inner_markers() {
        let err = non_retriable(
            wrapped(retry_after(Duration::from_secs(3))),
            "gave up",
        );
        assert_eq!(
            get_requeue_delay(&err),
            Some((Duration::from_secs(3), true))
        );
        assert_eq!(get_non_retriable_details(&err).unwrap().message, "gave up");
    }

    #[test]
    fn test_plain_error_carries_nothing() {
        let err = anyhow::anyhow!("boom");
        assert!(get_requeue_delay(&err).is_none());
        assert!(get_non_retriable_details(&err).is_none());
    }

    #[test]
    fn test_non_retriable_keeps_cause_in_chain() {
        let err = non_retriable(anyhow::anyhow!("disk full"), "cannot recover");
        assert_eq!(err.to_string(), "non-retriable: cannot recover");
        let causes: Vec<String> = err.chain().map(ToString::to_string).collect();
        assert!(causes.iter().any(|c| c == "disk full"));
    }

    #[test]
    fn test_lost_race_classification() {
        let raced = QueueError::AlreadyInProgress {
            key: "a".to_string(),
        };
        let storage = QueueError::from(StorageError::ConnectionError("down".to_string()));
        assert!(raced.is_lost_race());
        assert!(!storage.is_lost_race());
    }
}
