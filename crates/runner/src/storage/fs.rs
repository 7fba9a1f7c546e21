use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::common::fsutils::copy_tree;
use crate::storage::{ObjectStat, StorageAdapter, StorageError};

/// Directory-backed storage used for `file://` artifacts and as the test
/// stand-in for an object store.  Keys map onto paths under the root; the
/// ETag is a content digest so rewritten objects change identity.
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FsStorage { root: root.into() }
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.root.join(key.trim_start_matches('/'))
    }
}

#[async_trait]
impl StorageAdapter for FsStorage {
    async fn head(&self, key: &str) -> Result<ObjectStat, StorageError> {
        let path = self.object_path(key);
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|_| StorageError::NotFound(key.to_string()))?;
        let content = tokio::fs::read(&path)
            .await
            .map_err(|e| StorageError::Transient(e.to_string()))?;
        Ok(ObjectStat {
            etag: format!("{:x}", Sha256::digest(&content)),
            size: metadata.len(),
            modified: metadata.modified().ok(),
        })
    }

    async fn fetch(
        &self,
        key: &str,
        _unpack: bool,
        dest: &Path,
        _timeout: Duration,
    ) -> Result<(), StorageError> {
        let path = self.object_path(key);
        if !path.exists() {
            return Err(StorageError::NotFound(key.to_string()));
        }
        let file_name = key.rsplit('/').next().unwrap_or(key);
        tokio::fs::create_dir_all(dest)
            .await
            .map_err(|e| StorageError::Transient(e.to_string()))?;
        let target = dest.join(file_name);
        copy_tree(&path, &target).map_err(|e| StorageError::Transient(e.to_string()))?;
        Ok(())
    }

    async fn deposit(
        &self,
        source: &Path,
        key: &str,
        _timeout: Duration,
    ) -> Result<(), StorageError> {
        if !source.exists() {
            return Err(StorageError::NotFound(source.display().to_string()));
        }
        let target = self.object_path(key);
        copy_tree(source, &target).map_err(|e| StorageError::Transient(e.to_string()))?;
        Ok(())
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_head_fetch_deposit_roundtrip() {
        let store = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(store.path());

        std::fs::write(scratch.path().join("weights"), b"layer data").unwrap();
        storage
            .deposit(
                &scratch.path().join("weights"),
                "bucket/weights",
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        let stat = storage.head("bucket/weights").await.unwrap();
        assert_eq!(stat.size, 10);

        let dest = scratch.path().join("out");
        storage
            .fetch("bucket/weights", false, &dest, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(std::fs::read(dest.join("weights")).unwrap(), b"layer data");
    }

    #[tokio::test]
    async fn test_etag_tracks_content() {
        let store = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(store.path());
        std::fs::create_dir_all(store.path().join("b")).unwrap();

        std::fs::write(store.path().join("b/k"), b"one").unwrap();
        let first = storage.head("b/k").await.unwrap().etag;
        std::fs::write(store.path().join("b/k"), b"two").unwrap();
        let second = storage.head("b/k").await.unwrap().etag;
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let store = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(store.path());
        assert!(matches!(
            storage.head("absent").await,
            Err(StorageError::NotFound(_))
        ));
    }
}
