use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error};

use super::{
    GetKeyStateRequest, ProcessRequest, ProcessResponse, ServiceError, WorkqueueService,
};
use crate::queue::{KeyState, Options, QueueError, WorkQueue};

/// Serves [`WorkqueueService`] by enqueuing into a [`WorkQueue`].
#[derive(Debug, Clone)]
pub struct Receiver<Q> {
    queue: Q,
}

impl<Q: WorkQueue> Receiver<Q> {
    /// Wraps `queue`.
    pub const fn new(queue: Q) -> Self {
        Self { queue }
    }

    /// The wrapped queue.
    pub const fn queue(&self) -> &Q {
        &self.queue
    }
}

fn to_status(err: &QueueError) -> ServiceError {
    match err {
        QueueError::InvalidKey { .. } => ServiceError::invalid_argument(err.to_string()),
        _ => ServiceError::internal(err.to_string()),
    }
}

#[async_trait]
impl<Q: WorkQueue> WorkqueueService for Receiver<Q> {
    async fn process(&self, request: ProcessRequest) -> Result<ProcessResponse, ServiceError> {
        let mut opts = Options::with_priority(request.priority);
        if request.delay_seconds > 0 {
            opts.delay = Duration::from_secs(request.delay_seconds.unsigned_abs());
        }

        debug!(key = %request.key, priority = request.priority, delay_seconds = request.delay_seconds, "Queuing key");
        self.queue.queue(&request.key, opts).await.map_err(|err| {
            error!(key = %request.key, error = %err, "Failed to queue key");
            to_status(&err)
        })?;
        Ok(ProcessResponse::default())
    }

    async fn get_key_state(&self, request: GetKeyStateRequest) -> Result<KeyState, ServiceError> {
        self.queue
            .get_key_state(&request.key)
            .await
            .map_err(|err| to_status(&err))?
            .ok_or_else(|| ServiceError::not_found(format!("key {:?} not found", request.key)))
    }
}
