use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::queue::{non_retriable, requeue_after, Options};
use crate::rpc::{ProcessRequest, ServiceError, WorkqueueService};

/// Work performed for one key.
///
/// `ctx` is the key's owner context: it is cancelled when ownership ends,
/// including when the lease is lost, and callbacks should abandon work then.
/// Failures are classified by the requeue vocabulary in [`crate::queue`].
#[async_trait]
pub trait Callback: Send + Sync {
    /// Processes `key`.
    async fn call(&self, ctx: CancellationToken, key: &str, opts: Options) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> Callback for F
where
    F: Fn(CancellationToken, String, Options) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn call(&self, ctx: CancellationToken, key: &str, opts: Options) -> anyhow::Result<()> {
        self(ctx, key.to_string(), opts).await
    }
}

/// A callback that forwards each key to a remote worker's `Process`.
///
/// A positive `requeue_after_seconds` becomes [`requeue_after`]; a
/// `ServiceError` carrying no-retry details becomes [`non_retriable`].
#[must_use]
pub fn service_callback(client: Arc<dyn WorkqueueService>) -> Arc<dyn Callback> {
    Arc::new(move |ctx: CancellationToken, key: String, opts: Options| {
        forward(Arc::clone(&client), ctx, key, opts)
    })
}

async fn forward(
    client: Arc<dyn WorkqueueService>,
    ctx: CancellationToken,
    key: String,
    opts: Options,
) -> anyhow::Result<()> {
    let request = ProcessRequest {
        key,
        priority: opts.priority,
        delay_seconds: 0,
    };
    let response = tokio::select! {
        response = client.process(request) => response.map_err(callback_error)?,
        () = ctx.cancelled() => anyhow::bail!("ownership ended before the worker replied"),
    };

    if response.requeue_after_seconds > 0 {
        return Err(requeue_after(Duration::from_secs(
            response.requeue_after_seconds.unsigned_abs(),
        )));
    }
    Ok(())
}

fn callback_error(status: ServiceError) -> anyhow::Error {
    match status.no_retry.clone() {
        Some(details) => non_retriable(status, details.message),
        None => status.into(),
    }
}
