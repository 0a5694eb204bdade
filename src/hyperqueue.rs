//! Fan-out of the workqueue service across shards.
//!
//! Every request is forwarded to `backends[fnv1a(key) % backends.len()]`.
//! Changing the number of backends reshuffles most keys.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::queue::KeyState;
use crate::rpc::{GetKeyStateRequest, ProcessRequest, ProcessResponse, ServiceError, WorkqueueService};

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Errors building a [`ShardRouter`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouterError {
    /// A router needs at least one backend.
    #[error("at least one backend is required")]
    NoBackends,
}

/// Routes each key to exactly one backend.
pub struct ShardRouter {
    backends: Vec<Arc<dyn WorkqueueService>>,
}

impl ShardRouter {
    /// Creates a router over `backends`, in shard order.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::NoBackends`] for an empty list.
    pub fn new(backends: Vec<Arc<dyn WorkqueueService>>) -> Result<Self, RouterError> {
        if backends.is_empty() {
            return Err(RouterError::NoBackends);
        }
        Ok(Self { backends })
    }

    /// Number of shards.
    #[must_use]
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Always false; a router is never built without backends.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Index of the backend that owns `key`.
    #[must_use]
    pub fn shard_for(&self, key: &str) -> usize {
        // u32 always fits in usize on supported targets.
        fnv1a_32(key.as_bytes()) as usize % self.backends.len()
    }

    fn backend(&self, key: &str) -> &dyn WorkqueueService {
        self.backends[self.shard_for(key)].as_ref()
    }
}

impl std::fmt::Debug for ShardRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardRouter")
            .field("shards", &self.backends.len())
            .finish()
    }
}

#[async_trait]
impl WorkqueueService for ShardRouter {
    async fn process(&self, request: ProcessRequest) -> Result<ProcessResponse, ServiceError> {
        self.backend(&request.key).process(request).await
    }

    async fn get_key_state(&self, request: GetKeyStateRequest) -> Result<KeyState, ServiceError> {
        self.backend(&request.key).get_key_state(request).await
    }
}

fn fnv1a_32(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}
