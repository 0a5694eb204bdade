//! Transport-agnostic shapes of the workqueue service.
//!
//! `Process(key, priority, delay_seconds) -> requeue_after_seconds` and
//! `GetKeyState(key) -> KeyState`. [`Receiver`] serves them from any
//! [`WorkQueue`](crate::queue::WorkQueue); [`ShardRouter`](crate::hyperqueue::ShardRouter)
//! fans them out over several services. [`service_router`] and [`HttpClient`]
//! carry them as JSON over HTTP.

mod http;
mod receiver;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use http::{service_router, HttpClient};
pub use receiver::Receiver;

use crate::queue::{get_non_retriable_details, get_requeue_delay, KeyState, NoRetryDetails};
pub use crate::queue::KeyStatus;

/// Request to process (enqueue) a key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRequest {
    /// The key.
    pub key: String,
    /// Higher runs earlier.
    #[serde(default)]
    pub priority: i64,
    /// Defer the key by this many seconds; zero or negative means now.
    #[serde(default)]
    pub delay_seconds: i64,
}

/// Reply to [`ProcessRequest`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessResponse {
    /// Ask the caller to run the key again after this many seconds. Zero is
    /// plain success.
    #[serde(default)]
    pub requeue_after_seconds: i64,
}

/// Request for a key's state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetKeyStateRequest {
    /// The key.
    pub key: String,
}

/// Status codes carried by [`ServiceError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Code {
    /// The request is malformed.
    InvalidArgument,
    /// The key does not exist.
    NotFound,
    /// The service failed.
    Internal,
    /// The service could not be reached.
    Unavailable,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InvalidArgument => "invalid argument",
            Self::NotFound => "not found",
            Self::Internal => "internal",
            Self::Unavailable => "unavailable",
        };
        f.write_str(name)
    }
}

/// Error status of a service call.
///
/// `no_retry` carries [`NoRetryDetails`] across the service boundary, so a
/// permanent failure reported by a remote worker stays permanent.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct ServiceError {
    /// Status code.
    pub code: Code,
    /// Human-readable message.
    pub message: String,
    /// Present when the failure must not be retried.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_retry: Option<NoRetryDetails>,
}

impl ServiceError {
    /// Builds an error with the given code.
    #[must_use]
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            no_retry: None,
        }
    }

    /// `Internal` error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    /// `InvalidArgument` error.
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    /// `NotFound` error.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Code::NotFound, message)
    }

    /// Attaches no-retry details.
    #[must_use]
    pub fn with_no_retry(mut self, details: NoRetryDetails) -> Self {
        self.no_retry = Some(details);
        self
    }
}

/// The workqueue service surface.
#[async_trait]
pub trait WorkqueueService: Send + Sync {
    /// Processes (enqueues) a key.
    async fn process(&self, request: ProcessRequest) -> Result<ProcessResponse, ServiceError>;

    /// Reports a key's state.
    async fn get_key_state(&self, request: GetKeyStateRequest) -> Result<KeyState, ServiceError>;
}

/// Converts a worker-side callback outcome into a `Process` reply.
///
/// `requeue_after(d)` becomes `requeue_after_seconds` (rounded up to whole
/// seconds); a non-retriable failure keeps its details; anything else is an
/// `Internal` error.
///
/// # Errors
///
/// Returns a `ServiceError` for every failure that is not a requeue request.
pub fn process_result(result: anyhow::Result<()>) -> Result<ProcessResponse, ServiceError> {
    let Err(err) = result else {
        return Ok(ProcessResponse::default());
    };

    if let Some((delay, false)) = get_requeue_delay(&err) {
        return Ok(ProcessResponse {
            requeue_after_seconds: whole_seconds(delay),
        });
    }

    let status = ServiceError::internal(format!("{err:#}"));
    match get_non_retriable_details(&err) {
        Some(details) => Err(status.with_no_retry(details.clone())),
        None => Err(status),
    }
}

fn whole_seconds(delay: Duration) -> i64 {
    let secs = delay.as_secs() + u64::from(delay.subsec_nanos() > 0);
    i64::try_from(secs).unwrap_or(i64::MAX)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::queue::{non_retriable, requeue_after};

    #[test]
    fn test_process_result_success() {
        assert_eq!(process_result(Ok(())).unwrap().requeue_after_seconds, 0);
    }

    #[test]
    fn test_process_result_requeue_rounds_up() {
        let response = process_result(Err(requeue_after(Duration::from_millis(1500)))).unwrap();
        assert_eq!(response.requeue_after_seconds, 2);
    }

    #[test]
    fn test_process_result_non_retriable_keeps_details() {
        let err = process_result(Err(non_retriable(anyhow::anyhow!("boom"), "bad payload")))
            .unwrap_err();
        assert_eq!(err.code, Code::Internal);
        assert_eq!(err.no_retry.unwrap().message, "bad payload");
    }

    #[test]
    fn test_process_result_plain_failure() {
        let err = process_result(Err(anyhow::anyhow!("flaky upstream"))).unwrap_err();
        assert_eq!(err.code, Code::Internal);
        assert!(err.no_retry.is_none());
        assert!(err.message.contains("flaky upstream"));
    }

    #[test]
    fn test_service_error_json_shape() {
        let err = ServiceError::not_found("no such key");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "NOT_FOUND");
        assert!(json.get("no_retry").is_none());
        assert_eq!(err.to_string(), "not found: no such key");
    }
}
