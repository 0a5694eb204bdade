//! Bounded-concurrency dispatch rounds over a [`WorkQueue`].
//!
//! A round enumerates the queue, reclaims orphaned keys, claims up to
//! `concurrency - active` queued keys and runs the callback for each one in
//! its own task. The round's outcome is collected through [`RoundHandle`].

mod callback;
mod handler;
mod policy;

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use metrics::counter;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use callback::{service_callback, Callback};
pub use handler::{create_router, AppState, DispatchHandler, TriggerOutcome};
pub use policy::{decide, Disposition};

use crate::queue::{Options, OwnedInProgressKey, QueueConfig, QueueError, WorkQueue};

/// Round-level failures. Individual callback failures never show up here;
/// they are absorbed by the retry policy.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The snapshot could not be taken; nothing was launched.
    #[error("enumerate failed")]
    Enumerate(#[source] QueueError),

    /// Claiming a key failed for a reason other than losing the race.
    #[error("failed to start key {key:?}")]
    Start {
        /// The key.
        key: String,
        /// The backend failure.
        #[source]
        source: QueueError,
    },

    /// Returning an orphaned key to the queue failed.
    #[error("failed to reclaim orphaned key {key:?}")]
    Reclaim {
        /// The key.
        key: String,
        /// The backend failure.
        #[source]
        source: QueueError,
    },

    /// Completing, requeuing or dead-lettering a processed key failed.
    #[error("failed to {action} key {key:?}")]
    Cleanup {
        /// The key.
        key: String,
        /// Which transition failed.
        action: &'static str,
        /// The backend failure.
        #[source]
        source: QueueError,
    },

    /// A per-key task panicked or was aborted.
    #[error("dispatch task failed: {0}")]
    Task(String),
}

/// Knobs for a dispatch round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSettings {
    /// Maximum keys in progress at once. Zero launches nothing.
    pub concurrency: usize,
    /// Maximum keys launched per round. Zero means no cap beyond `concurrency`.
    pub batch_size: usize,
    /// Attempts before a failing key is dead-lettered. Zero means unlimited.
    pub max_retry: u32,
    /// Backoff timing for failed keys.
    pub config: QueueConfig,
}

impl DispatchSettings {
    /// Settings with the given concurrency and no batch or retry limits.
    #[must_use]
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency,
            batch_size: 0,
            max_retry: 0,
            config: QueueConfig::default(),
        }
    }

    /// Caps how many keys one round launches.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Dead-letters keys after this many attempts.
    #[must_use]
    pub const fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    /// Sets the backoff timing.
    #[must_use]
    pub const fn with_config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    fn launch_budget(&self, active: usize) -> usize {
        let open_slots = self.concurrency.saturating_sub(active);
        if self.batch_size == 0 {
            open_slots
        } else {
            open_slots.min(self.batch_size)
        }
    }
}

/// Outstanding work of one dispatch round.
///
/// Tasks are detached: dropping the handle lets every launched key run to
/// completion and clean up after itself.
#[must_use = "a round's failures are only reported through wait()"]
#[derive(Debug)]
pub struct RoundHandle {
    error: Option<DispatchError>,
    tasks: Vec<JoinHandle<Result<(), DispatchError>>>,
    launched: usize,
}

impl RoundHandle {
    fn failed(error: DispatchError) -> Self {
        Self {
            error: Some(error),
            tasks: Vec::new(),
            launched: 0,
        }
    }

    /// Keys this round attempted to claim.
    #[must_use]
    pub const fn launched(&self) -> usize {
        self.launched
    }

    /// Waits for every task of the round and returns the first failure.
    ///
    /// # Errors
    ///
    /// Returns the first round-level failure; later ones are logged.
    pub async fn wait(self) -> Result<(), DispatchError> {
        let mut first = self.error;
        for task in self.tasks {
            let result = task
                .await
                .unwrap_or_else(|err| Err(DispatchError::Task(err.to_string())));
            if let Err(err) = result {
                if first.is_some() {
                    warn!(error = %err, "Additional dispatch failure");
                } else {
                    first = Some(err);
                }
            }
        }
        first.map_or(Ok(()), Err)
    }
}

/// Runs one dispatch round and waits for it.
///
/// # Errors
///
/// See [`RoundHandle::wait`].
pub async fn handle(
    ctx: &CancellationToken,
    wq: &dyn WorkQueue,
    settings: &DispatchSettings,
    callback: Arc<dyn Callback>,
) -> Result<(), DispatchError> {
    handle_async(ctx, wq, settings, callback).await.wait().await
}

/// Launches one dispatch round.
///
/// Returns once every launched key has been claimed, so a round started
/// after this one observes them as in progress. Callbacks receive owner
/// contexts derived from `ctx`; cleanup transitions ignore `ctx`.
pub async fn handle_async(
    ctx: &CancellationToken,
    wq: &dyn WorkQueue,
    settings: &DispatchSettings,
    callback: Arc<dyn Callback>,
) -> RoundHandle {
    let snapshot = match wq.enumerate().await {
        Ok(snapshot) => snapshot,
        Err(err) => return RoundHandle::failed(DispatchError::Enumerate(err)),
    };

    let mut tasks = Vec::new();
    let mut active = HashSet::new();
    for key in snapshot.in_progress {
        if !key.is_orphaned() {
            active.insert(key.name().to_string());
            continue;
        }
        counter!("workqueue.dispatch.orphans_reclaimed").increment(1);
        tasks.push(tokio::spawn(async move {
            let name = key.name().to_string();
            info!(key = %name, "Reclaiming orphaned key");
            key.requeue()
                .await
                .map_err(|source| DispatchError::Reclaim { key: name, source })
        }));
    }

    let wip = active.len();
    let candidates: Vec<_> = snapshot
        .queued
        .into_iter()
        .filter(|key| !active.contains(key.name()))
        .take(settings.launch_budget(wip))
        .collect();
    let launched = candidates.len();

    let mut error = None;
    let starts = join_all(candidates.iter().map(|key| key.start(ctx))).await;
    for (key, started) in candidates.iter().zip(starts) {
        match started {
            Ok(owned) => tasks.push(tokio::spawn(process(
                owned,
                Arc::clone(&callback),
                *settings,
            ))),
            Err(err) if err.is_lost_race() => {
                debug!(key = key.name(), error = %err, "Failed to start key");
            }
            Err(source) => {
                warn!(key = key.name(), error = %source, "Failed to start key");
                error.get_or_insert(DispatchError::Start {
                    key: key.name().to_string(),
                    source,
                });
            }
        }
    }

    counter!("workqueue.dispatch.launched").increment(launched as u64);
    info!(launched, wip, "Launched {launched} new keys (wip: {wip})");

    RoundHandle {
        error,
        tasks,
        launched,
    }
}

/// Runs the callback for one owned key and applies the retry policy.
async fn process(
    owned: Box<dyn OwnedInProgressKey>,
    callback: Arc<dyn Callback>,
    settings: DispatchSettings,
) -> Result<(), DispatchError> {
    let name = owned.name().to_string();
    let attempts = owned.attempts();
    let result = callback
        .call(owned.context(), &name, Options::with_priority(owned.priority()))
        .await;
    if let Err(ref err) = result {
        warn!(key = %name, attempts, error = %format!("{err:#}"), "Failed callback for key");
    }

    match decide(&result, attempts, &settings) {
        Disposition::Complete => owned
            .complete()
            .await
            .map_err(cleanup_error(&name, "complete")),
        Disposition::Requeue(delay) => owned
            .requeue_with_options(Options::with_delay(delay))
            .await
            .map_err(cleanup_error(&name, "requeue")),
        Disposition::Deadletter => {
            info!(key = %name, attempts, max_retry = settings.max_retry, "Key reached max retry limit, dead-lettering");
            counter!("workqueue.dispatch.deadlettered").increment(1);
            owned
                .deadletter()
                .await
                .map_err(cleanup_error(&name, "deadletter"))
        }
    }
}

fn cleanup_error<'a>(
    key: &'a str,
    action: &'static str,
) -> impl FnOnce(QueueError) -> DispatchError + 'a {
    move |source| DispatchError::Cleanup {
        key: key.to_string(),
        action,
        source,
    }
}
