//! Operator views over one enumeration.

use std::fmt::Write;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::queue::{Enumeration, QueueError, WorkQueue};

/// One key as shown by `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeySummary {
    /// Key name.
    pub key: String,
    /// Priority.
    pub priority: i64,
    /// Lease lapsed (in-progress keys only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orphaned: Option<bool>,
    /// Attempts used (dead-lettered keys only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    /// When the key was dead-lettered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_time: Option<DateTime<Utc>>,
}

impl KeySummary {
    fn new(key: &str, priority: i64) -> Self {
        Self {
            key: key.to_string(),
            priority,
            orphaned: None,
            attempts: None,
            failed_time: None,
        }
    }
}

/// Snapshot of the queue for `status`.
///
/// `queued` holds only keys available now, in dispatch order and bounded by
/// the backend's enumerate limit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    /// Available keys, in dispatch order.
    pub queued: Vec<KeySummary>,
    /// Claimed keys.
    pub in_progress: Vec<KeySummary>,
    /// Parked keys.
    pub dead_lettered: Vec<KeySummary>,
}

impl StatusReport {
    /// Builds the report from a snapshot.
    #[must_use]
    pub fn from_enumeration(snapshot: &Enumeration) -> Self {
        let queued = snapshot
            .queued
            .iter()
            .map(|key| KeySummary::new(key.name(), key.priority()))
            .collect();
        let mut in_progress: Vec<_> = snapshot
            .in_progress
            .iter()
            .map(|key| KeySummary {
                orphaned: Some(key.is_orphaned()),
                ..KeySummary::new(key.name(), key.priority())
            })
            .collect();
        in_progress.sort_by(|a, b| a.key.cmp(&b.key));
        let mut dead_lettered: Vec<_> = snapshot
            .dead_lettered
            .iter()
            .map(|key| KeySummary {
                attempts: Some(key.attempts()),
                failed_time: key.failed_time(),
                ..KeySummary::new(key.name(), key.priority())
            })
            .collect();
        dead_lettered.sort_by(|a, b| a.key.cmp(&b.key));

        Self {
            queued,
            in_progress,
            dead_lettered,
        }
    }

    /// Human-readable rendering.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Queued: {}", self.queued.len());
        for key in &self.queued {
            let _ = writeln!(out, "  {} (priority {})", key.key, key.priority);
        }
        let _ = writeln!(out, "In progress: {}", self.in_progress.len());
        for key in &self.in_progress {
            let orphaned = if key.orphaned == Some(true) { " [orphaned]" } else { "" };
            let _ = writeln!(out, "  {} (priority {}){orphaned}", key.key, key.priority);
        }
        let _ = writeln!(out, "Dead-lettered: {}", self.dead_lettered.len());
        for key in &self.dead_lettered {
            let failed = key
                .failed_time
                .map_or_else(|| "unknown".to_string(), |t| t.to_rfc3339());
            let _ = writeln!(
                out,
                "  {} (priority {}, attempts {}, failed {failed})",
                key.key,
                key.priority,
                key.attempts.unwrap_or_default(),
            );
        }
        out
    }
}

/// Outcome of [`reenqueue_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReenqueueSummary {
    /// Keys returned to the queue.
    pub requeued: Vec<String>,
    /// Keys whose requeue failed.
    pub failed: Vec<String>,
}

/// Returns every dead-lettered key to the queue.
///
/// A failure on one key does not stop the others; see
/// [`ReenqueueSummary::failed`].
///
/// # Errors
///
/// Returns an error only if the queue cannot be enumerated.
pub async fn reenqueue_all(wq: &dyn WorkQueue) -> Result<ReenqueueSummary, QueueError> {
    let snapshot = wq.enumerate().await?;
    let mut summary = ReenqueueSummary::default();
    for key in &snapshot.dead_lettered {
        match key.requeue().await {
            Ok(()) => {
                info!(key = key.name(), "Re-enqueued dead-lettered key");
                summary.requeued.push(key.name().to_string());
            }
            Err(err) => {
                warn!(key = key.name(), error = %err, "Failed to re-enqueue dead-lettered key");
                summary.failed.push(key.name().to_string());
            }
        }
    }
    Ok(summary)
}
