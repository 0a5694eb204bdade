//! workqueue - operator CLI for a durable lease-based work queue

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;
use workqueue::cli::{
    reenqueue_all, refresh_metrics, serve, wait_for_shutdown_signal, Cli, Commands, StatusReport,
    METRICS_REFRESH_INTERVAL,
};
use workqueue::dispatcher::{create_router, service_callback, DispatchHandler};
use workqueue::rpc::{service_router, HttpClient, Receiver};
use workqueue::storage::StorageError;
use workqueue::{connect, load_config, Options};

/// Prints an error, with storage hints when a storage failure is in the chain.
fn display_error(err: &anyhow::Error) {
    if let Some(storage_err) = err.downcast_ref::<StorageError>() {
        eprintln!("{}", storage_err.display_rich());
        return;
    }

    for cause in err.chain() {
        if let Some(storage_err) = cause.downcast_ref::<StorageError>() {
            eprintln!("Error: {err}\n");
            eprintln!("Caused by: {}", storage_err.display_rich());
            return;
        }
    }

    eprintln!("Error: {err:#}");
}

/// A token cancelled on SIGINT or SIGTERM.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        cancel.cancel();
    });
    token
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("workqueue=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run().await {
        display_error(&e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse_args();
    let config = load_config(cli.config.as_deref()).context("failed to load configuration")?;
    let wq = connect(&config).await?;

    match cli.command {
        Commands::Queue {
            key,
            priority,
            delay,
        } => {
            let opts = Options {
                priority,
                ..delay.map(Options::with_delay).unwrap_or_default()
            };
            wq.queue(&key, opts)
                .await
                .with_context(|| format!("failed to queue {key:?}"))?;
            println!("Queued {key}");
        }

        Commands::Status { json } => {
            let snapshot = wq.enumerate().await.context("failed to enumerate queue")?;
            let report = StatusReport::from_enumeration(&snapshot);
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", report.render());
            }
        }

        Commands::State { key, json } => {
            let state = wq
                .get_key_state(&key)
                .await
                .with_context(|| format!("failed to look up {key:?}"))?;
            match (state, json) {
                (Some(state), true) => println!("{}", serde_json::to_string_pretty(&state)?),
                (None, true) => println!("null"),
                (Some(state), false) => {
                    println!("Key:      {}", state.key);
                    println!("Status:   {:?}", state.status);
                    println!("Priority: {}", state.priority);
                    println!("Attempts: {}", state.attempts);
                    if let Some(not_before) = state.not_before {
                        println!("Not before: {}", not_before.to_rfc3339());
                    }
                    if let Some(failed) = state.failed_time {
                        println!("Failed:   {}", failed.to_rfc3339());
                    }
                }
                (None, false) => println!("Key {key} not found"),
            }
        }

        Commands::Reenqueue => {
            let summary = reenqueue_all(wq.as_ref())
                .await
                .context("failed to enumerate dead-lettered keys")?;
            println!("Re-enqueued {} key(s)", summary.requeued.len());
            if !summary.failed.is_empty() {
                anyhow::bail!(
                    "failed to re-enqueue {} key(s): {}",
                    summary.failed.len(),
                    summary.failed.join(", ")
                );
            }
        }

        Commands::Dispatch { port, target } => {
            let settings = config.dispatch_settings();
            info!(
                worker = %target,
                concurrency = settings.concurrency,
                batch_size = settings.batch_size,
                max_retry = settings.max_retry,
                "Starting dispatcher"
            );
            let shutdown = shutdown_token();
            tokio::spawn(refresh_metrics(
                Arc::clone(&wq),
                METRICS_REFRESH_INTERVAL,
                shutdown.clone(),
            ));

            let callback = service_callback(Arc::new(HttpClient::new(target)));
            let app = create_router(DispatchHandler::new(wq, settings, callback));
            serve(app, port, shutdown).await.context("dispatch server failed")?;
        }

        Commands::Receive { port } => {
            let app = service_router(Arc::new(Receiver::new(wq)));
            serve(app, port, shutdown_token())
                .await
                .context("receiver server failed")?;
        }
    }

    Ok(())
}
