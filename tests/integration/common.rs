//! Common test utilities.
//!
//! Configuration is read from environment variables:
//! - `S3_ENDPOINT`: S3 endpoint URL (default: `http://localhost:4566`)
//! - `WORKQUEUE_BUCKET`: Bucket name (default: `workqueue-dev`)
//! - `S3_REGION`: AWS region (default: `us-east-1`)
//!
//! AWS credentials are read by the AWS SDK from its usual sources.
//! Every test works under its own random prefix so tests can share a bucket.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;
use workqueue::storage::{
    Metadata, ObjectAttrs, ObjectStore, PutCondition, S3Client, S3Config, StorageError,
};
use workqueue::{ObjectStoreQueue, QueueConfig, WorkQueue};

/// An [`ObjectStore`] view of `inner` confined to `prefix`.
#[derive(Debug, Clone)]
pub struct Namespaced {
    inner: Arc<S3Client>,
    prefix: String,
}

impl Namespaced {
    fn full(&self, name: &str) -> String {
        format!("{}{name}", self.prefix)
    }

    fn strip(&self, mut attrs: ObjectAttrs) -> ObjectAttrs {
        if let Some(name) = attrs.name.strip_prefix(&self.prefix) {
            attrs.name = name.to_string();
        }
        attrs
    }
}

#[async_trait]
impl ObjectStore for Namespaced {
    async fn put(
        &self,
        name: &str,
        metadata: Metadata,
        condition: PutCondition,
    ) -> Result<ObjectAttrs, StorageError> {
        let attrs = self.inner.put(&self.full(name), metadata, condition).await?;
        Ok(self.strip(attrs))
    }

    async fn attrs(&self, name: &str) -> Result<ObjectAttrs, StorageError> {
        Ok(self.strip(self.inner.attrs(&self.full(name)).await?))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectAttrs>, StorageError> {
        let listed = self.inner.list(&self.full(prefix)).await?;
        Ok(listed.into_iter().map(|attrs| self.strip(attrs)).collect())
    }

    async fn delete(&self, name: &str) -> Result<(), StorageError> {
        self.inner.delete(&self.full(name)).await
    }

    async fn delete_if_match(&self, name: &str, etag: &str) -> Result<(), StorageError> {
        self.inner.delete_if_match(&self.full(name), etag).await
    }
}

/// Creates the shared S3 client.
///
/// # Panics
///
/// Panics if the S3 client cannot be created (e.g., docker not running).
pub async fn test_client() -> Arc<S3Client> {
    let endpoint =
        std::env::var("S3_ENDPOINT").unwrap_or_else(|_| "http://localhost:4566".to_string());
    let bucket = std::env::var("WORKQUEUE_BUCKET").unwrap_or_else(|_| "workqueue-dev".to_string());
    let region = std::env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".to_string());

    let config = S3Config::new(Some(endpoint), bucket, region);
    Arc::new(
        S3Client::new(config)
            .await
            .expect("Failed to create S3 client - is LocalStack running? Try: docker run -d -p 4566:4566 localstack/localstack"),
    )
}

/// A store under a fresh random prefix.
#[must_use]
pub fn isolated_store(client: &Arc<S3Client>) -> Arc<dyn ObjectStore> {
    Arc::new(Namespaced {
        inner: Arc::clone(client),
        prefix: format!("test-{}/", Uuid::new_v4()),
    })
}

/// A queue over `store`.
#[must_use]
pub fn queue_over(
    store: &Arc<dyn ObjectStore>,
    limit: usize,
    config: QueueConfig,
) -> Arc<dyn WorkQueue> {
    Arc::new(ObjectStoreQueue::new(Arc::clone(store), limit, config).expect("valid queue config"))
}
