//! Directory-tree coordination store
//!
//! Each blob is a file: `/plans/<id>` lives at `<root>/plans/<id>`. Writes go
//! to a temporary sibling, are fsynced, then renamed over the target, so a
//! reader sees either the old blob or the new one.

use super::{segments, CoordinationStore};
use crate::error::StorageError;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

const TMP_PREFIX: &str = ".tmp-";

/// Store rooted at a local directory
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Open (creating if needed) a store rooted at `root`
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| StorageError::io(root.display().to_string(), e))?;
        Ok(Self { root })
    }

    /// Root directory
    #[inline]
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let mut resolved = self.root.clone();
        for segment in segments(path)? {
            if segment.starts_with(TMP_PREFIX) {
                return Err(StorageError::InvalidPath(path.to_string()));
            }
            resolved.push(segment);
        }
        Ok(resolved)
    }
}

#[async_trait::async_trait]
impl CoordinationStore for FsStore {
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let file = self.resolve(path)?;
        match tokio::fs::read(&file).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::io(path, e)),
        }
    }

    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        let target = self.resolve(path)?;
        let (Some(dir), Some(name)) = (target.parent(), target.file_name()) else {
            return Err(StorageError::InvalidPath(path.to_string()));
        };
        if target == self.root {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| StorageError::io(path, e))?;

        let tmp = dir.join(format!(
            "{TMP_PREFIX}{}-{}",
            name.to_string_lossy(),
            uuid::Uuid::new_v4().simple()
        ));
        let write = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(&bytes).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp, &target).await
        };
        if let Err(e) = write.await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(StorageError::io(path, e));
        }

        // Make the rename itself durable
        #[cfg(unix)]
        {
            let handle = tokio::fs::File::open(dir)
                .await
                .map_err(|e| StorageError::io(path, e))?;
            handle
                .sync_all()
                .await
                .map_err(|e| StorageError::io(path, e))?;
        }
        Ok(())
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, StorageError> {
        let dir = self.resolve(path)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::io(path, e)),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::io(path, e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(TMP_PREFIX) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        let file = self.resolve(path)?;
        match tokio::fs::remove_file(&file).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io(path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_replaces_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path()).await.unwrap();

        store.put("/statuses/p1", b"first".to_vec()).await.unwrap();
        store.put("/statuses/p1", b"second".to_vec()).await.unwrap();

        assert_eq!(store.get("/statuses/p1").await.unwrap(), Some(b"second".to_vec()));
        // No temporary files left behind
        assert_eq!(store.children("/statuses").await.unwrap(), vec!["p1"]);
    }

    #[tokio::test]
    async fn test_missing_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path()).await.unwrap();

        assert!(store.get("/nothing/here").await.unwrap().is_none());
        assert!(store.children("/nothing").await.unwrap().is_empty());
        store.delete("/nothing/here").await.unwrap();
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FsStore::open(dir.path()).await.unwrap();
            store.put("/scheduler_state", b"{}".to_vec()).await.unwrap();
        }
        let reopened = FsStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.get("/scheduler_state").await.unwrap(), Some(b"{}".to_vec()));
    }

    #[tokio::test]
    async fn test_put_creates_and_syncs_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path()).await.unwrap();
        store.put("/plans/a/b/p1", b"plan".to_vec()).await.unwrap();
        drop(store);

        let reopened = FsStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.get("/plans/a/b/p1").await.unwrap(), Some(b"plan".to_vec()));
        assert_eq!(reopened.children("/plans/a/b").await.unwrap(), vec!["p1"]);
    }

    #[tokio::test]
    async fn test_rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path()).await.unwrap();
        assert!(store.put("/../outside", vec![]).await.is_err());
        assert!(store.put("/", vec![]).await.is_err());
        assert!(store.get("/.tmp-x").await.is_err());
    }
}
