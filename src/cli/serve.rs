//! Long-running server plumbing for the `dispatch` and `receive` commands.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::signal;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::queue::WorkQueue;

/// How often a dispatcher enumerates on its own to keep queue gauges fresh.
pub const METRICS_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Resolves on SIGINT (Ctrl+C) or, on Unix, SIGTERM.
pub async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}

/// Enumerates `wq` every `period` until `shutdown` is cancelled, so the
/// queue gauges stay current between triggers.
pub async fn refresh_metrics(wq: Arc<dyn WorkQueue>, period: Duration, shutdown: CancellationToken) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        if let Err(err) = wq.enumerate().await {
            warn!(error = %err, "Failed to enumerate");
        }
    }
}

/// Serves `app` on `0.0.0.0:port` until `shutdown` is cancelled.
///
/// # Errors
///
/// Returns an error if the port cannot be bound or the server fails.
pub async fn serve(app: Router, port: u16, shutdown: CancellationToken) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    info!(port, "Listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::queue::{Enumeration, KeyState, Options, QueueError};

    #[derive(Default)]
    struct CountingQueue {
        enumerations: AtomicUsize,
    }

    #[async_trait]
    impl WorkQueue for CountingQueue {
        async fn queue(&self, _key: &str, _opts: Options) -> Result<(), QueueError> {
            Ok(())
        }

        async fn enumerate(&self) -> Result<Enumeration, QueueError> {
            self.enumerations.fetch_add(1, Ordering::SeqCst);
            Ok(Enumeration::default())
        }

        async fn get_key_state(&self, _key: &str) -> Result<Option<KeyState>, QueueError> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_refresh_metrics_enumerates_until_shutdown() {
        let queue = Arc::new(CountingQueue::default());
        let shutdown = CancellationToken::new();
        let refresher = tokio::spawn(refresh_metrics(
            Arc::clone(&queue) as Arc<dyn WorkQueue>,
            Duration::from_millis(20),
            shutdown.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(110)).await;
        assert!(queue.enumerations.load(Ordering::SeqCst) >= 2);

        shutdown.cancel();
        refresher.await.unwrap();
        let settled = queue.enumerations.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(queue.enumerations.load(Ordering::SeqCst), settled);
    }
}
