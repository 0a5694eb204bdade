//! CLI module for the `workqueue` operator binary.

mod commands;
mod report;
mod serve;

pub use commands::{parse_duration, Cli, Commands};
pub use report::{reenqueue_all, ReenqueueSummary, StatusReport};
pub use serve::{refresh_metrics, serve, wait_for_shutdown_signal, METRICS_REFRESH_INTERVAL};
