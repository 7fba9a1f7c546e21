pub mod fs;

use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reference to a named artifact bundle held in object storage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Fully qualified URI, for example `s3://host/bucket/key`.
    #[serde(default)]
    pub qualified: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub key: String,
    /// Mutable artifacts (logs, models) are returned to storage and bypass
    /// the artifact cache.
    #[serde(default)]
    pub mutable: bool,
    #[serde(default)]
    pub unpack: bool,
}

impl ArtifactRef {
    pub fn scheme(&self) -> &str {
        self.qualified
            .split_once("://")
            .map(|(scheme, _)| scheme)
            .unwrap_or("")
    }

    pub fn host(&self) -> &str {
        self.qualified
            .split_once("://")
            .map(|(_, rest)| rest.split('/').next().unwrap_or(""))
            .unwrap_or("")
    }

    /// Final path segment of the key, used as the installed file name.
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("storage authentication failed: {0}")]
    AuthFailed(String),
    #[error("transient storage failure: {0}")]
    Transient(String),
    #[error("fatal storage failure: {0}")]
    Fatal(String),
}

/// Metadata returned by a cheap HEAD, used for content addressing.
#[derive(Debug, Clone)]
pub struct ObjectStat {
    pub etag: String,
    pub size: u64,
    pub modified: Option<SystemTime>,
}

/// Narrow contract the pipeline consumes from object-store backends.  The
/// concrete cloud clients live outside this crate; `fs::FsStorage` serves
/// `file://` artifacts and the test suite.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    async fn head(&self, key: &str) -> Result<ObjectStat, StorageError>;

    /// Downloads `key` into the directory `dest`.  `unpack` requests archive
    /// expansion where the backend supports it.
    async fn fetch(
        &self,
        key: &str,
        unpack: bool,
        dest: &Path,
        timeout: Duration,
    ) -> Result<(), StorageError>;

    /// Uploads a local file or directory tree under `key`.
    async fn deposit(&self, source: &Path, key: &str, timeout: Duration)
        -> Result<(), StorageError>;

    async fn close(&self);
}

/// Builds a storage adapter for an artifact's URI scheme using the
/// experiment environment for credentials.
pub trait StorageFactory: Send + Sync {
    fn open(
        &self,
        artifact: &ArtifactRef,
        env: &HashMap<String, String>,
    ) -> crate::Result<Box<dyn StorageAdapter>>;
}

/// Retries `Transient` fetch failures with exponential backoff until the
/// timeout budget is spent; other error kinds surface immediately.
pub async fn fetch_with_retry(
    storage: &dyn StorageAdapter,
    key: &str,
    unpack: bool,
    dest: &Path,
    timeout: Duration,
) -> Result<(), StorageError> {
    let deadline = Instant::now() + timeout;
    let mut pause = Duration::from_millis(500);
    loop {
        match storage.fetch(key, unpack, dest, timeout).await {
            Err(StorageError::Transient(msg)) if Instant::now() + pause < deadline => {
                log::debug!("transient failure fetching {key}, retrying in {pause:?}: {msg}");
                tokio::time::sleep(pause).await;
                pause *= 2;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Flaky {
        failures: AtomicUsize,
    }

    #[async_trait]
    impl StorageAdapter for Flaky {
        async fn head(&self, _key: &str) -> Result<ObjectStat, StorageError> {
            unimplemented!()
        }

        async fn fetch(
            &self,
            _key: &str,
            _unpack: bool,
            _dest: &Path,
            _timeout: Duration,
        ) -> Result<(), StorageError> {
            if self.failures.fetch_sub(1, Ordering::SeqCst) > 1 {
                Err(StorageError::Transient("connection reset".to_string()))
            } else {
                Ok(())
            }
        }

        async fn deposit(
            &self,
            _source: &Path,
            _key: &str,
            _timeout: Duration,
        ) -> Result<(), StorageError> {
            unimplemented!()
        }

        async fn close(&self) {}
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let storage = Flaky { failures: AtomicUsize::new(3) };
        fetch_with_retry(
            &storage,
            "k",
            false,
            Path::new("/nonexistent"),
            Duration::from_secs(30),
        )
        .await
        .unwrap();
    }

    #[test]
    fn test_artifact_uri_parts() {
        let art = ArtifactRef {
            qualified: "s3://minio.local:9000/bucket/output/model.tar".to_string(),
            bucket: "bucket".to_string(),
            key: "output/model.tar".to_string(),
            ..Default::default()
        };
        assert_eq!(art.scheme(), "s3");
        assert_eq!(art.host(), "minio.local:9000");
        assert_eq!(art.file_name(), "model.tar");
    }
}
