//! CLI commands for the workqueue.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

/// workqueue - durable lease-based work queue CLI
#[derive(Parser, Debug)]
#[command(name = "workqueue", version, about = "Durable lease-based work queue")]
pub struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true, env = "WORKQUEUE_CONFIG")]
    pub config: Option<PathBuf>,

    /// The subcommand to run
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Add a key to the queue (merging with an existing entry)
    Queue {
        /// The key to enqueue
        key: String,

        /// Higher runs earlier
        #[arg(long, short = 'p', default_value_t = 0, allow_hyphen_values = true)]
        priority: i64,

        /// Hide the key for this long (e.g., 90s, 30m, 1h)
        #[arg(long, value_name = "DURATION", value_parser = parse_duration)]
        delay: Option<Duration>,
    },

    /// Show queued, in-progress and dead-lettered keys
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show one key's state
    State {
        /// The key to look up
        key: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Return every dead-lettered key to the queue
    Reenqueue,

    /// Serve the dispatch trigger, forwarding keys to a worker
    Dispatch {
        /// Port to listen on
        #[arg(long, env = "PORT", default_value_t = 8080)]
        port: u16,

        /// Base URL of the worker serving `/process`
        #[arg(long, env = "WORKQUEUE_TARGET")]
        target: String,
    },

    /// Serve `/process` and `/state`, queuing received keys
    Receive {
        /// Port to listen on
        #[arg(long, env = "PORT", default_value_t = 8080)]
        port: u16,
    },
}

impl Cli {
    /// Parse command line arguments.
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

/// Parses `90s`, `30m`, `2h`, `1d`, `1w` or a bare number of seconds.
///
/// # Errors
///
/// Returns a message naming the rejected input.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim().to_lowercase();
    let num_end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    if num_end == 0 {
        return Err(format!("invalid duration '{s}'"));
    }

    let num: u64 = s[..num_end]
        .parse()
        .map_err(|_| format!("invalid duration '{s}'"))?;
    let unit = match s[num_end..].trim() {
        "" | "s" | "sec" | "secs" | "second" | "seconds" => 1,
        "m" | "min" | "mins" | "minute" | "minutes" => 60,
        "h" | "hr" | "hrs" | "hour" | "hours" => 60 * 60,
        "d" | "day" | "days" => 24 * 60 * 60,
        "w" | "week" | "weeks" => 7 * 24 * 60 * 60,
        other => return Err(format!("unknown duration unit '{other}'")),
    };
    num.checked_mul(unit)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("duration '{s}' is too large"))
}
