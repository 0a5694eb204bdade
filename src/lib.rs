//! workqueue - durable lease-based work queue
//!
//! Coordinates exactly-once-in-flight processing of keyed work items across
//! stateless worker replicas. Keys live in an S3-compatible bucket under
//! `queued/`, `in-progress/` and `dead-letter/` prefixes; workers claim keys
//! atomically via conditional writes and hold them under a heartbeat-renewed
//! lease. A bounded-concurrency dispatcher drains the queue, and a sharding
//! router spreads one logical queue across several independent backends.

pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod hyperqueue;
pub mod inmem;
pub mod objectstore;
pub mod queue;
pub mod rpc;
pub mod storage;

#[cfg(any(test, feature = "integration"))]
pub mod conformance;

pub use config::{connect, load_config, ConfigError, QueueMode, WorkqueueConfig};
pub use dispatcher::{
    handle, handle_async, service_callback, Callback, DispatchError, DispatchHandler,
    DispatchSettings, RoundHandle, TriggerOutcome,
};
pub use hyperqueue::{RouterError, ShardRouter};
pub use inmem::InMemoryQueue;
pub use objectstore::ObjectStoreQueue;
pub use queue::{
    get_non_retriable_details, get_requeue_delay, non_retriable, requeue_after, retry_after,
    DeadLetteredKey, Enumeration, InProgressKey, Key, KeyState, KeyStatus, NoRetryDetails,
    ObservedInProgressKey, Options, OwnedInProgressKey, QueueConfig, QueueError, QueuedKey,
    WorkQueue,
};
pub use rpc::{Receiver, ServiceError, WorkqueueService};
