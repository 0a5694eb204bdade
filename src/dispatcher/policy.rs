//! What happens to a key after its callback returns.

use std::time::Duration;

use super::DispatchSettings;
use crate::queue::{get_non_retriable_details, get_requeue_delay};

/// The transition applied to a processed key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Remove the key.
    Complete,
    /// Return the key to the queue after the delay.
    Requeue(Duration),
    /// Park the key in the dead-letter set.
    Deadletter,
}

/// Maps a callback outcome to a disposition.
///
/// Precedence: success completes; `requeue_after` requeues with its delay and
/// never counts toward dead-lettering; a non-retriable marker completes; any
/// other failure dead-letters once `max_retry` attempts are used up, and
/// otherwise requeues after the `retry_after` delay or the default backoff.
#[must_use]
pub fn decide(
    result: &anyhow::Result<()>,
    attempts: u32,
    settings: &DispatchSettings,
) -> Disposition {
    let Err(err) = result else {
        return Disposition::Complete;
    };

    let requested = get_requeue_delay(err);
    if let Some((delay, false)) = requested {
        return Disposition::Requeue(delay);
    }
    if get_non_retriable_details(err).is_some() {
        return Disposition::Complete;
    }
    if settings.max_retry > 0 && attempts >= settings.max_retry {
        return Disposition::Deadletter;
    }
    match requested {
        Some((delay, true)) if !delay.is_zero() => Disposition::Requeue(delay),
        _ => Disposition::Requeue(settings.config.backoff_for(attempts)),
    }
}
