//! Deduplicating HTTP trigger for dispatch rounds.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use metrics::counter;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::{handle_async, Callback, DispatchError, DispatchSettings};
use crate::queue::WorkQueue;

/// Shared state for the dispatch routes.
pub type AppState = Arc<DispatchHandler>;

/// How a trigger was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// This trigger ran a round.
    Dispatched,
    /// A running round plus a waiting trigger already cover this one.
    Deduplicated,
}

/// Admits at most one running round and one waiting trigger.
///
/// A trigger that finds a round running takes the single waiting-room slot,
/// waits for the work permit, then frees the waiting room and runs its own
/// round. A trigger that finds both taken returns at once: the waiting
/// round will observe whatever prompted it. The work permit is held only
/// while a round launches, not while its keys run.
pub struct DispatchHandler {
    work: Semaphore,
    wait: Semaphore,
    queue: Arc<dyn WorkQueue>,
    settings: DispatchSettings,
    callback: Arc<dyn Callback>,
}

impl DispatchHandler {
    /// Creates a handler dispatching `queue` into `callback`.
    #[must_use]
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        settings: DispatchSettings,
        callback: Arc<dyn Callback>,
    ) -> Self {
        Self {
            work: Semaphore::new(1),
            wait: Semaphore::new(1),
            queue,
            settings,
            callback,
        }
    }

    /// Runs or deduplicates one trigger.
    ///
    /// Dropping the returned future cancels the owner contexts of the
    /// round's callbacks; their cleanup still runs.
    ///
    /// # Errors
    ///
    /// Returns the round's first round-level failure.
    pub async fn trigger(&self) -> Result<TriggerOutcome, DispatchError> {
        let work = if let Ok(permit) = self.work.try_acquire() {
            permit
        } else {
            let Ok(waiting) = self.wait.try_acquire() else {
                debug!("Dispatch already running with a waiter, deduplicating trigger");
                counter!("workqueue.dispatch.deduped_triggers").increment(1);
                return Ok(TriggerOutcome::Deduplicated);
            };
            let permit = self
                .work
                .acquire()
                .await
                .map_err(|err| DispatchError::Task(err.to_string()))?;
            drop(waiting);
            permit
        };

        let ctx = CancellationToken::new();
        let _cancel_on_drop = ctx.clone().drop_guard();

        let round = handle_async(
            &ctx,
            self.queue.as_ref(),
            &self.settings,
            Arc::clone(&self.callback),
        )
        .await;
        drop(work);

        round.wait().await?;
        Ok(TriggerOutcome::Dispatched)
    }
}

/// Routes every method on `/` to [`DispatchHandler::trigger`].
///
/// Answers 200 for completed and deduplicated triggers, 500 with the
/// failure chain when the round fails.
pub fn create_router(handler: DispatchHandler) -> Router {
    let state: AppState = Arc::new(handler);
    Router::new().route("/", any(dispatch)).with_state(state)
}

async fn dispatch(State(handler): State<AppState>) -> Response {
    match handler.trigger().await {
        Ok(_) => StatusCode::OK.into_response(),
        Err(err) => {
            let err = anyhow::Error::from(err);
            error!(error = %format!("{err:#}"), "Dispatch round failed");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}")).into_response()
        }
    }
}
