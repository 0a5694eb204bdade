//! Object names and metadata encoding for the object-store layout.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::storage::Metadata;

pub(crate) const QUEUED_PREFIX: &str = "queued/";
pub(crate) const IN_PROGRESS_PREFIX: &str = "in-progress/";
pub(crate) const DEAD_LETTER_PREFIX: &str = "dead-letter/";

pub(crate) const LEASE_EXPIRATION: &str = "lease-expiration";
pub(crate) const ATTEMPTS: &str = "attempts";
pub(crate) const PRIORITY: &str = "priority";
pub(crate) const NOT_BEFORE: &str = "not-before";
pub(crate) const FAILED_TIME: &str = "failed-time";
pub(crate) const QUEUED_AT: &str = "queued-at";
/// Set on a queued object by the worker that is starting it.
pub(crate) const CLAIMED_AT: &str = "claimed-at";

pub(crate) fn queued_name(key: &str) -> String {
    format!("{QUEUED_PREFIX}{key}")
}

pub(crate) fn in_progress_name(key: &str) -> String {
    format!("{IN_PROGRESS_PREFIX}{key}")
}

pub(crate) fn dead_letter_name(key: &str) -> String {
    format!("{DEAD_LETTER_PREFIX}{key}")
}

pub(crate) fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn parse_time(metadata: &Metadata, field: &str) -> Option<DateTime<Utc>> {
    let raw = metadata.get(field)?;
    match DateTime::parse_from_rfc3339(raw) {
        Ok(time) => Some(time.with_timezone(&Utc)),
        Err(err) => {
            tracing::warn!(field, value = %raw, error = %err, "Ignoring malformed timestamp");
            None
        }
    }
}

pub(crate) fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub(crate) fn priority(metadata: &Metadata) -> i64 {
    metadata.get(PRIORITY).map_or(0, |raw| {
        raw.parse().unwrap_or_else(|err| {
            tracing::warn!(value = %raw, error = %err, "Failed to parse priority");
            0
        })
    })
}

pub(crate) fn attempts(metadata: &Metadata) -> u32 {
    metadata.get(ATTEMPTS).map_or(0, |raw| {
        raw.parse().unwrap_or_else(|err| {
            tracing::warn!(value = %raw, error = %err, "Failed to parse attempts");
            0
        })
    })
}

/// A queued entry as written by `Queue` and by every requeue path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Entry {
    pub priority: i64,
    pub not_before: Option<DateTime<Utc>>,
    pub attempts: u32,
}

impl Entry {
    pub(crate) fn to_metadata(self, queued_at: DateTime<Utc>) -> Metadata {
        let mut metadata = Metadata::new();
        metadata.insert(PRIORITY.to_string(), self.priority.to_string());
        metadata.insert(QUEUED_AT.to_string(), format_time(queued_at));
        if let Some(not_before) = self.not_before {
            metadata.insert(NOT_BEFORE.to_string(), format_time(not_before));
        }
        if self.attempts > 0 {
            metadata.insert(ATTEMPTS.to_string(), self.attempts.to_string());
        }
        metadata
    }
}

/// Folds `incoming` into an existing queued object's metadata.
///
/// Priority and attempts rise to the maximum. Not-before is merged only when
/// both sides carry one, keeping the earliest; otherwise the existing value
/// stands. The enqueue time is untouched. Returns `None` when nothing changes.
///
/// Merging into a claimed entry always rewrites it without the claim, so the
/// starter sees the change and keeps the entry for another run.
pub(crate) fn merge(existing: &Metadata, incoming: Entry) -> Option<Metadata> {
    let mut merged = existing.clone();
    merged.remove(CLAIMED_AT);

    if incoming.priority > priority(existing) {
        merged.insert(PRIORITY.to_string(), incoming.priority.to_string());
    }
    if incoming.attempts > attempts(existing) {
        merged.insert(ATTEMPTS.to_string(), incoming.attempts.to_string());
    }
    match (parse_time(existing, NOT_BEFORE), incoming.not_before) {
        (Some(current), Some(new)) if new < current => {
            merged.insert(NOT_BEFORE.to_string(), format_time(new));
        }
        _ => {}
    }

    (merged != *existing).then_some(merged)
}
