use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{error::StorageError, Metadata, ObjectAttrs, ObjectStore, PutCondition};

#[derive(Debug, Clone)]
struct StoredObject {
    etag: String,
    metadata: Metadata,
}

/// In-process [`ObjectStore`] with S3 conditional-write semantics.
///
/// Lets tests drive the object-store backend's lease protocol without S3.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    generation: AtomicU64,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the store holds no objects.
    pub async fn is_empty(&self) -> bool {
        self.objects.lock().await.is_empty()
    }

    fn next_etag(&self) -> String {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        format!("\"{generation:016x}\"")
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put(
        &self,
        name: &str,
        metadata: Metadata,
        condition: PutCondition,
    ) -> Result<ObjectAttrs, StorageError> {
        let mut objects = self.objects.lock().await;

        let allowed = match (&condition, objects.get(name)) {
            (PutCondition::None, _) | (PutCondition::IfNoneMatch, None) => true,
            (PutCondition::IfNoneMatch, Some(_)) | (PutCondition::IfMatch(_), None) => false,
            (PutCondition::IfMatch(expected), Some(current)) => *expected == current.etag,
        };
        if !allowed {
            return Err(StorageError::PreconditionFailed {
                key: name.to_string(),
            });
        }

        let etag = self.next_etag();
        objects.insert(
            name.to_string(),
            StoredObject {
                etag: etag.clone(),
                metadata: metadata.clone(),
            },
        );

        Ok(ObjectAttrs {
            name: name.to_string(),
            etag,
            metadata,
        })
    }

    async fn attrs(&self, name: &str) -> Result<ObjectAttrs, StorageError> {
        let objects = self.objects.lock().await;
        objects
            .get(name)
            .map(|object| ObjectAttrs {
                name: name.to_string(),
                etag: object.etag.clone(),
                metadata: object.metadata.clone(),
            })
            .ok_or_else(|| StorageError::NotFound {
                key: name.to_string(),
            })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectAttrs>, StorageError> {
        let objects = self.objects.lock().await;
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(name, _)| name.starts_with(prefix))
            .map(|(name, object)| ObjectAttrs {
                name: name.clone(),
                etag: object.etag.clone(),
                metadata: object.metadata.clone(),
            })
            .collect())
    }

    async fn delete(&self, name: &str) -> Result<(), StorageError> {
        self.objects.lock().await.remove(name);
        Ok(())
    }

    async fn delete_if_match(&self, name: &str, etag: &str) -> Result<(), StorageError> {
        let mut objects = self.objects.lock().await;
        match objects.get(name) {
            None => Err(StorageError::NotFound {
                key: name.to_string(),
            }),
            Some(current) if current.etag != etag => Err(StorageError::PreconditionFailed {
                key: name.to_string(),
            }),
            Some(_) => {
                objects.remove(name);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn meta(pairs: &[(&str, &str)]) -> Metadata {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_if_none_match_rejects_existing() {
        let store = MemoryStore::new();
        store
            .put("queued/a", meta(&[]), PutCondition::IfNoneMatch)
            .await
            .unwrap();

        let err = store
            .put("queued/a", meta(&[]), PutCondition::IfNoneMatch)
            .await
            .unwrap_err();
        assert!(err.is_precondition_failed());
    }

    #[tokio::test]
    async fn test_if_match_detects_intervening_write() {
        let store = MemoryStore::new();
        let first = store
            .put("k", meta(&[("attempts", "1")]), PutCondition::None)
            .await
            .unwrap();

        // Same metadata still changes the etag.
        let second = store
            .put("k", meta(&[("attempts", "1")]), PutCondition::None)
            .await
            .unwrap();
        assert_ne!(first.etag, second.etag);

        let err = store
            .put("k", meta(&[]), PutCondition::IfMatch(first.etag))
            .await
            .unwrap_err();
        assert!(err.is_precondition_failed());

        store
            .put("k", meta(&[]), PutCondition::IfMatch(second.etag))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_if_match_on_missing_object_fails() {
        let store = MemoryStore::new();
        let err = store
            .put("gone", meta(&[]), PutCondition::IfMatch("\"1\"".to_string()))
            .await
            .unwrap_err();
        assert!(err.is_precondition_failed());
    }

    #[tokio::test]
    async fn test_list_is_prefix_scoped() {
        let store = MemoryStore::new();
        for name in ["queued/a", "queued/b", "in-progress/a", "queuedx"] {
            store.put(name, meta(&[]), PutCondition::None).await.unwrap();
        }

        let names: Vec<String> = store
            .list("queued/")
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.name)
            .collect();
        assert_eq!(names, vec!["queued/a", "queued/b"]);
        assert_eq!(store.list("").await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let store = MemoryStore::new();
        store.delete("nothing").await.unwrap();
        assert!(store.attrs("nothing").await.unwrap_err().is_not_found());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_delete_if_match() {
        let store = MemoryStore::new();
        let first = store.put("k", meta(&[]), PutCondition::None).await.unwrap();
        let second = store.put("k", meta(&[]), PutCondition::None).await.unwrap();

        let err = store.delete_if_match("k", &first.etag).await.unwrap_err();
        assert!(err.is_precondition_failed());
        assert!(store.attrs("k").await.is_ok());

        store.delete_if_match("k", &second.etag).await.unwrap();
        let err = store.delete_if_match("k", &second.etag).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
