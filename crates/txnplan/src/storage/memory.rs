//! In-process coordination store

use super::{segments, CoordinationStore};
use crate::error::StorageError;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};

/// `BTreeMap`-backed store; contents live as long as the value
///
/// Share one instance through an `Arc` to simulate a restart: build a new
/// executor over the same store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    /// Empty store
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs
    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

#[async_trait::async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, StorageError> {
        segments(path)?;
        Ok(self.blobs.read().get(path).cloned())
    }

    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        if segments(path)?.is_empty() {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
        self.blobs.write().insert(path.to_string(), bytes);
        Ok(())
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, StorageError> {
        segments(path)?;
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        let blobs = self.blobs.read();
        let names: BTreeSet<String> = blobs
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| key[prefix.len()..].split('/').next().map(str::to_string))
            .collect();
        Ok(names.into_iter().collect())
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        segments(path)?;
        self.blobs.write().remove(path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryStore::new();
        store.put("/a/b", b"one".to_vec()).await.unwrap();
        store.put("/a/b", b"two".to_vec()).await.unwrap();

        assert_eq!(store.get("/a/b").await.unwrap(), Some(b"two".to_vec()));
        assert_eq!(store.len(), 1);

        store.delete("/a/b").await.unwrap();
        store.delete("/a/b").await.unwrap();
        assert!(store.get("/a/b").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_children_are_direct_and_sorted() {
        let store = MemoryStore::new();
        store.put("/plans/b", vec![]).await.unwrap();
        store.put("/plans/a", vec![]).await.unwrap();
        store.put("/plans/a/nested", vec![]).await.unwrap();
        store.put("/plansx/c", vec![]).await.unwrap();

        assert_eq!(store.children("/plans").await.unwrap(), vec!["a", "b"]);
        assert_eq!(store.children("/").await.unwrap(), vec!["plans", "plansx"]);
        assert!(store.children("/missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_bad_paths() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.put("relative", vec![]).await,
            Err(StorageError::InvalidPath(_))
        ));
        assert!(store.put("/", vec![]).await.is_err());
    }
}
