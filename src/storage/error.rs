use thiserror::Error;

/// Errors surfaced by an [`ObjectStore`](super::ObjectStore).
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// The requested object does not exist (HTTP 404).
    #[error("Object not found: {key}")]
    NotFound {
        /// The object name that was not found.
        key: String,
    },

    /// A conditional write was rejected (HTTP 412).
    ///
    /// Raised for `If-None-Match: *` when the object already exists, and for
    /// `If-Match` when the object changed (or vanished) since it was read.
    #[error("Precondition failed for object: {key}")]
    PreconditionFailed {
        /// The object name whose precondition failed.
        key: String,
    },

    /// Failed to reach the storage endpoint.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Invalid or unsupported configuration.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Access denied (HTTP 403).
    #[error("Access denied to bucket '{bucket}'")]
    AccessDenied {
        /// The bucket access was denied to.
        bucket: String,
    },

    /// Catch-all for other S3 errors.
    #[error("S3 error: {0}")]
    S3Error(String),
}

impl StorageError {
    /// True for the 404 family.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// True when a conditional write lost to a concurrent writer.
    #[must_use]
    pub const fn is_precondition_failed(&self) -> bool {
        matches!(self, Self::PreconditionFailed { .. })
    }

    /// Returns a helpful suggestion for resolving this error.
    #[must_use]
    pub const fn suggestion(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => {
                "The key may have been completed, requeued or reclaimed by another \
                 worker. Run `workqueue state <key>` to see where it is now."
            }
            Self::PreconditionFailed { .. } => {
                "Another worker modified this key between your read and write. \
                 This is expected under contention; the conditional write kept \
                 the queue consistent."
            }
            Self::ConnectionError(_) => {
                "Check that your S3 endpoint is correct and the service is running. \
                 For local development, ensure LocalStack or MinIO is started \
                 (e.g., docker compose up -d) and S3_ENDPOINT points at it."
            }
            Self::ConfigurationError(_) => {
                "Check your configuration settings. Common issues include: \
                 missing WORKQUEUE_BUCKET, invalid region, or incorrect endpoint."
            }
            Self::AccessDenied { .. } => {
                "Check that AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY are set correctly \
                 and that the credentials may read, write and list this bucket."
            }
            Self::S3Error(_) => {
                "An unexpected S3 error occurred. Check the error message for details \
                 and verify your S3 configuration is correct."
            }
        }
    }

    /// Returns a richly formatted error message with context and suggestions,
    /// for CLI output.
    #[must_use]
    pub fn display_rich(&self) -> String {
        format!("Error: {}\n\nSuggestion:\n  {}", self, self.suggestion())
    }
}
