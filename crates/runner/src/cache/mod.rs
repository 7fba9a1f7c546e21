//! Content-addressed local store for immutable experiment artifacts.
//!
//! Files live under `<working-dir>/blob-cache/`, named by fingerprint; the
//! directory is the source of truth and the in-memory index is rebuilt from
//! it on restart.  Eviction is driven synchronously by admission and the
//! total resident size never exceeds the configured footprint.

pub mod lru;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cache::lru::{LruCache, LruConfig};
use crate::common::hash64;
use crate::metrics::{MetricsRegistry, CACHE_HITS, CACHE_MISSES};
use crate::storage::{fetch_with_retry, ArtifactRef, StorageAdapter};

/// 64-bit content address of an immutable artifact.  Derived from the
/// qualified URI, the store's ETag (or last-modified metadata), and any
/// decryption key material, so byte-identical content maps to one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(u64);

impl Fingerprint {
    pub fn derive(qualified: &str, version: &str, key_material: &str) -> Fingerprint {
        let mut data = Vec::with_capacity(qualified.len() + version.len() + key_material.len() + 2);
        data.extend_from_slice(qualified.as_bytes());
        data.push(0);
        data.extend_from_slice(version.as_bytes());
        data.push(0);
        data.extend_from_slice(key_material.as_bytes());
        Fingerprint(hash64(&data))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(s, 16).map(Fingerprint)
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    path: PathBuf,
    size: u64,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Directory holding the content-addressed blobs.
    pub root: PathBuf,
    /// Disk budget in bytes.
    pub footprint: u64,
    /// Release grace window, see `lru::LruConfig::grace`.
    pub grace: Duration,
    /// Budget for one backend download.
    pub fetch_timeout: Duration,
}

impl CacheConfig {
    pub fn new(root: impl Into<PathBuf>, footprint: u64) -> Self {
        CacheConfig {
            root: root.into(),
            footprint,
            grace: Duration::from_secs(2),
            fetch_timeout: Duration::from_secs(300),
        }
    }
}

/// The artifact cache.  Concurrent fetches for one fingerprint collapse into
/// a single download; fetches for distinct fingerprints run in parallel.
pub struct ArtifactCache {
    config: CacheConfig,
    index: Mutex<LruCache<Fingerprint, CacheEntry>>,
    gates: Mutex<HashMap<Fingerprint, Arc<tokio::sync::Mutex<()>>>>,
    metrics: Arc<MetricsRegistry>,
}

impl ArtifactCache {
    /// Opens the cache, reconstituting the index from the blobs already on
    /// disk (oldest first, so their relative LRU order survives a restart).
    pub fn open(config: CacheConfig, metrics: Arc<MetricsRegistry>) -> crate::Result<Self> {
        std::fs::create_dir_all(&config.root)?;

        let mut resident: Vec<(Fingerprint, PathBuf, u64, std::time::SystemTime)> = Vec::new();
        for entry in std::fs::read_dir(&config.root)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            let name = entry.file_name().to_string_lossy().into_owned();
            match name.parse::<Fingerprint>() {
                Ok(fingerprint) if metadata.is_file() => {
                    let modified = metadata.modified().unwrap_or(std::time::UNIX_EPOCH);
                    resident.push((fingerprint, entry.path(), metadata.len(), modified));
                }
                _ => {
                    // Interrupted download leftovers or foreign files
                    log::debug!("removing stray cache entry {}", entry.path().display());
                    let path = entry.path();
                    if metadata.is_dir() {
                        let _ = std::fs::remove_dir_all(&path);
                    } else {
                        let _ = std::fs::remove_file(&path);
                    }
                }
            }
        }
        resident.sort_by_key(|(_, _, _, modified)| *modified);

        let mut index = LruCache::new(LruConfig {
            max_size: config.footprint,
            items_to_prune: 1,
            gets_per_promote: 1,
            grace: config.grace,
        });
        for (fingerprint, path, size, _) in resident {
            match index.set(fingerprint, CacheEntry { path: path.clone(), size }, size) {
                Ok(evicted) => remove_blobs(evicted),
                Err(_) => {
                    let _ = std::fs::remove_file(&path);
                }
            }
        }

        Ok(ArtifactCache {
            config,
            index: Mutex::new(index),
            gates: Mutex::new(HashMap::new()),
            metrics,
        })
    }

    pub fn footprint(&self) -> u64 {
        self.config.footprint
    }

    pub fn resident_bytes(&self) -> u64 {
        self.index.lock().unwrap().total_size()
    }

    /// Content address for an artifact.  Requires a cheap HEAD against the
    /// store to pick up the object's version metadata.
    pub async fn hash(
        &self,
        artifact: &ArtifactRef,
        storage: &dyn StorageAdapter,
        env: &HashMap<String, String>,
    ) -> crate::Result<Fingerprint> {
        let stat = storage.head(&artifact.key).await?;
        let version = if !stat.etag.is_empty() {
            stat.etag
        } else {
            stat.modified
                .and_then(|m| m.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs().to_string())
                .unwrap_or_default()
        };
        let key_material = env
            .get("STUDIOML_DECRYPTION_KEY")
            .map(String::as_str)
            .unwrap_or("");
        Ok(Fingerprint::derive(&artifact.qualified, &version, key_material))
    }

    /// Non-mutating residency check.
    pub fn probe(&self, fingerprint: Fingerprint) -> bool {
        self.index.lock().unwrap().peek(&fingerprint).is_some()
    }

    /// Fetches an artifact into the directory `dest`.  Immutable artifacts
    /// go through the cache; mutable ones bypass it entirely.  Returns
    /// operator-facing warnings for conditions that were recovered.
    pub async fn fetch(
        &self,
        artifact: &ArtifactRef,
        storage: &dyn StorageAdapter,
        env: &HashMap<String, String>,
        dest: &Path,
    ) -> crate::Result<Vec<String>> {
        if artifact.mutable {
            fetch_with_retry(
                storage,
                &artifact.key,
                artifact.unpack,
                dest,
                self.config.fetch_timeout,
            )
            .await?;
            return Ok(Vec::new());
        }

        let fingerprint = self.hash(artifact, storage, env).await?;
        let gate = self.gate(fingerprint);
        let _serialized = gate.lock().await;

        // Warm path: the blob is resident, promote and link it out.
        let resident = {
            let mut index = self.index.lock().unwrap();
            if let Some(entry) = index.get(&fingerprint) {
                let entry = entry.clone();
                index.pin(&fingerprint);
                Some(entry)
            } else {
                None
            }
        };
        if let Some(entry) = resident {
            let installed = install(&entry.path, dest, artifact.file_name());
            self.index.lock().unwrap().unpin(&fingerprint);
            installed?;
            self.metrics
                .inc(CACHE_HITS, &[("hash", &fingerprint.to_string())]);
            return Ok(Vec::new());
        }

        // Cold path: download outside of any index lock, then admit.
        let mut warnings = Vec::new();
        let staging = self
            .config
            .root
            .join(format!("{fingerprint}.partial-{}", std::process::id()));
        let download = self.download(artifact, storage, &staging).await;
        let blob = match download {
            Ok(blob) => blob,
            Err(err) => {
                let _ = std::fs::remove_dir_all(&staging);
                return Err(err);
            }
        };
        let size = std::fs::metadata(&blob)?.len();
        let blob_path = self.config.root.join(fingerprint.to_string());
        std::fs::rename(&blob, &blob_path)?;
        let _ = std::fs::remove_dir_all(&staging);

        let admitted = {
            let mut index = self.index.lock().unwrap();
            match index.set(
                fingerprint,
                CacheEntry { path: blob_path.clone(), size },
                size,
            ) {
                Ok(evicted) => {
                    index.pin(&fingerprint);
                    drop(index);
                    remove_blobs(evicted);
                    true
                }
                Err(_) => false,
            }
        };

        if admitted {
            let installed = install(&blob_path, dest, artifact.file_name());
            self.index.lock().unwrap().unpin(&fingerprint);
            installed?;
        } else {
            // The victims available cannot make room; hand the bytes to the
            // caller directly and leave the cache untouched.
            warnings.push(format!(
                "artifact {} ({} bytes) could not be admitted to the cache",
                artifact.qualified, size
            ));
            std::fs::create_dir_all(dest)?;
            std::fs::rename(&blob_path, dest.join(artifact.file_name()))?;
        }

        self.metrics
            .inc(CACHE_MISSES, &[("hash", &fingerprint.to_string())]);
        Ok(warnings)
    }

    async fn download(
        &self,
        artifact: &ArtifactRef,
        storage: &dyn StorageAdapter,
        staging: &Path,
    ) -> crate::Result<PathBuf> {
        std::fs::create_dir_all(staging)?;
        fetch_with_retry(
            storage,
            &artifact.key,
            false,
            staging,
            self.config.fetch_timeout,
        )
        .await?;
        Ok(staging.join(artifact.file_name()))
    }

    fn gate(&self, fingerprint: Fingerprint) -> Arc<tokio::sync::Mutex<()>> {
        let mut gates = self.gates.lock().unwrap();
        gates.retain(|_, gate| Arc::strong_count(gate) > 1);
        gates
            .entry(fingerprint)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

fn remove_blobs(evicted: Vec<(Fingerprint, CacheEntry)>) {
    for (fingerprint, entry) in evicted {
        log::debug!("evicting cached artifact {fingerprint}");
        if let Err(err) = std::fs::remove_file(&entry.path) {
            log::warn!(
                "could not remove evicted blob {}: {err}",
                entry.path.display()
            );
        }
    }
}

/// Links the resident blob into the destination directory, falling back to
/// a copy when the destination lives on another filesystem.
fn install(blob: &Path, dest: &Path, file_name: &str) -> crate::Result<()> {
    std::fs::create_dir_all(dest)?;
    let target = dest.join(file_name);
    if target.exists() {
        std::fs::remove_file(&target)?;
    }
    if std::fs::hard_link(blob, &target).is_err() {
        std::fs::copy(blob, &target)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::fs::FsStorage;
    use crate::storage::{ObjectStat, StorageError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const MIB: u64 = 1024 * 1024;

    struct Fixture {
        _dirs: Vec<tempfile::TempDir>,
        store: FsStorage,
        store_root: PathBuf,
        cache: Arc<ArtifactCache>,
        metrics: Arc<MetricsRegistry>,
        scratch: PathBuf,
    }

    fn fixture(footprint: u64, grace: Duration) -> Fixture {
        let store_dir = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let scratch_dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(MetricsRegistry::new());
        let mut config = CacheConfig::new(cache_dir.path().join("blob-cache"), footprint);
        config.grace = grace;
        config.fetch_timeout = Duration::from_secs(5);
        let cache = Arc::new(ArtifactCache::open(config, metrics.clone()).unwrap());
        Fixture {
            store: FsStorage::new(store_dir.path()),
            store_root: store_dir.path().to_path_buf(),
            scratch: scratch_dir.path().to_path_buf(),
            _dirs: vec![store_dir, cache_dir, scratch_dir],
            cache,
            metrics,
        }
    }

    fn upload(fx: &Fixture, key: &str, content: &[u8]) -> ArtifactRef {
        let path = fx.store_root.join(key);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
        ArtifactRef {
            qualified: format!("s3://test-store/{key}"),
            bucket: "bucket".to_string(),
            key: key.to_string(),
            mutable: false,
            unpack: false,
        }
    }

    fn hits(fx: &Fixture, fp: Fingerprint) -> u64 {
        fx.metrics.value(CACHE_HITS, &[("hash", &fp.to_string())])
    }

    fn misses(fx: &Fixture, fp: Fingerprint) -> u64 {
        fx.metrics.value(CACHE_MISSES, &[("hash", &fp.to_string())])
    }

    #[test]
    fn test_fingerprint_distinctness() {
        let a = Fingerprint::derive("s3://h/b/k", "etag-1", "");
        let b = Fingerprint::derive("s3://h/b/k", "etag-2", "");
        let c = Fingerprint::derive("s3://h/b/k", "etag-1", "secret");
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, Fingerprint::derive("s3://h/b/k", "etag-1", ""));
        assert_eq!(a.to_string().parse::<Fingerprint>().unwrap(), a);
    }

    #[tokio::test]
    async fn test_cold_then_warm_fetch() {
        let fx = fixture(64 * MIB, Duration::ZERO);
        let content: Vec<u8> = (0..MIB).map(|i| (i % 251) as u8).collect();
        let art = upload(&fx, "bucket/file-1", &content);
        let env = HashMap::new();
        let fp = fx.cache.hash(&art, &fx.store, &env).await.unwrap();

        let (h0, m0) = (hits(&fx, fp), misses(&fx, fp));
        fx.cache
            .fetch(&art, &fx.store, &env, &fx.scratch.join("cold"))
            .await
            .unwrap();
        assert_eq!(misses(&fx, fp), m0 + 1);
        assert_eq!(hits(&fx, fp), h0);

        fx.cache
            .fetch(&art, &fx.store, &env, &fx.scratch.join("warm"))
            .await
            .unwrap();
        assert_eq!(hits(&fx, fp), h0 + 1);
        assert_eq!(misses(&fx, fp), m0 + 1);

        let fetched = std::fs::read(fx.scratch.join("warm/file-1")).unwrap();
        assert_eq!(fetched, content);
    }

    #[tokio::test]
    async fn test_eviction_under_pressure() {
        let files_in_cache = 10u64;
        let file_size = 8 * 1024u64;
        let grace = Duration::from_millis(50);
        let fx = fixture(files_in_cache * file_size, grace);
        let env = HashMap::new();

        let mut template: Vec<u8> = (0..file_size).map(|i| (i % 249) as u8).collect();
        let arts: Vec<ArtifactRef> = (1..=files_in_cache + 1)
            .map(|i| {
                template[0] = i as u8;
                upload(&fx, &format!("bucket/file-{i:02}"), &template)
            })
            .collect();

        // All cold, fetched most recent number first
        for art in arts.iter().rev() {
            let fp = fx.cache.hash(art, &fx.store, &env).await.unwrap();
            let (h0, m0) = (hits(&fx, fp), misses(&fx, fp));
            fx.cache
                .fetch(art, &fx.store, &env, &fx.scratch.join("stage"))
                .await
                .unwrap();
            assert_eq!(hits(&fx, fp), h0);
            assert_eq!(misses(&fx, fp), m0 + 1);
            assert!(fx.cache.resident_bytes() <= fx.cache.footprint());
        }

        // Everything except the very last file is still warm
        for art in &arts[1..=files_in_cache as usize - 1] {
            let fp = fx.cache.hash(art, &fx.store, &env).await.unwrap();
            let (h0, m0) = (hits(&fx, fp), misses(&fx, fp));
            fx.cache
                .fetch(art, &fx.store, &env, &fx.scratch.join("stage"))
                .await
                .unwrap();
            assert_eq!(hits(&fx, fp), h0 + 1);
            assert_eq!(misses(&fx, fp), m0);
        }

        tokio::time::sleep(grace * 2).await;

        let last = &arts[files_in_cache as usize];
        let fp = fx.cache.hash(last, &fx.store, &env).await.unwrap();
        assert!(!fx.cache.probe(fp));

        let (h0, m0) = (hits(&fx, fp), misses(&fx, fp));
        fx.cache
            .fetch(last, &fx.store, &env, &fx.scratch.join("stage"))
            .await
            .unwrap();
        assert_eq!(hits(&fx, fp), h0);
        assert_eq!(misses(&fx, fp), m0 + 1);
    }

    struct CountingStorage {
        inner: FsStorage,
        downloads: AtomicUsize,
    }

    #[async_trait]
    impl StorageAdapter for CountingStorage {
        async fn head(&self, key: &str) -> Result<ObjectStat, StorageError> {
            self.inner.head(key).await
        }

        async fn fetch(
            &self,
            key: &str,
            unpack: bool,
            dest: &Path,
            timeout: Duration,
        ) -> Result<(), StorageError> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.inner.fetch(key, unpack, dest, timeout).await
        }

        async fn deposit(
            &self,
            source: &Path,
            key: &str,
            timeout: Duration,
        ) -> Result<(), StorageError> {
            self.inner.deposit(source, key, timeout).await
        }

        async fn close(&self) {}
    }

    #[tokio::test]
    async fn test_single_flight_per_fingerprint() {
        let fx = fixture(64 * MIB, Duration::ZERO);
        let art = upload(&fx, "bucket/shared", b"shared artifact body");
        let env = HashMap::new();
        let storage = Arc::new(CountingStorage {
            inner: FsStorage::new(&fx.store_root),
            downloads: AtomicUsize::new(0),
        });
        let fp = fx.cache.hash(&art, storage.as_ref(), &env).await.unwrap();

        let workers = 6;
        let mut tasks = Vec::new();
        for i in 0..workers {
            let cache = fx.cache.clone();
            let storage = storage.clone();
            let art = art.clone();
            let dest = fx.scratch.join(format!("w{i}"));
            tasks.push(tokio::spawn(async move {
                cache
                    .fetch(&art, storage.as_ref(), &HashMap::new(), &dest)
                    .await
                    .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(storage.downloads.load(Ordering::SeqCst), 1);
        assert_eq!(misses(&fx, fp), 1);
        assert_eq!(hits(&fx, fp), workers - 1);
        for i in 0..workers {
            assert_eq!(
                std::fs::read(fx.scratch.join(format!("w{i}/shared"))).unwrap(),
                b"shared artifact body"
            );
        }
    }

    #[tokio::test]
    async fn test_mutable_artifacts_bypass_cache() {
        let fx = fixture(64 * MIB, Duration::ZERO);
        let mut art = upload(&fx, "bucket/log", b"log body");
        art.mutable = true;
        let env = HashMap::new();

        fx.cache
            .fetch(&art, &fx.store, &env, &fx.scratch.join("out"))
            .await
            .unwrap();
        assert_eq!(fx.cache.resident_bytes(), 0);
        assert_eq!(
            std::fs::read(fx.scratch.join("out/log")).unwrap(),
            b"log body"
        );
    }

    #[tokio::test]
    async fn test_oversized_artifact_falls_through() {
        let fx = fixture(16, Duration::ZERO);
        let art = upload(&fx, "bucket/huge", b"this body is larger than the footprint");
        let env = HashMap::new();
        let fp = fx.cache.hash(&art, &fx.store, &env).await.unwrap();

        let warnings = fx
            .cache
            .fetch(&art, &fx.store, &env, &fx.scratch.join("out"))
            .await
            .unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(!fx.cache.probe(fp));
        assert_eq!(misses(&fx, fp), 1);
        assert!(fx.scratch.join("out/huge").exists());
    }

    #[tokio::test]
    async fn test_index_reconstituted_on_restart() {
        let store_dir = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let root = cache_dir.path().join("blob-cache");
        let metrics = Arc::new(MetricsRegistry::new());
        let storage = FsStorage::new(store_dir.path());
        std::fs::create_dir_all(store_dir.path().join("bucket")).unwrap();
        std::fs::write(store_dir.path().join("bucket/k"), b"persisted").unwrap();
        let art = ArtifactRef {
            qualified: "s3://test-store/bucket/k".to_string(),
            bucket: "bucket".to_string(),
            key: "bucket/k".to_string(),
            ..Default::default()
        };
        let env = HashMap::new();

        let fp = {
            let cache =
                ArtifactCache::open(CacheConfig::new(&root, MIB), metrics.clone()).unwrap();
            cache
                .fetch(&art, &storage, &env, scratch.path())
                .await
                .unwrap();
            cache.hash(&art, &storage, &env).await.unwrap()
        };

        let reopened = ArtifactCache::open(CacheConfig::new(&root, MIB), metrics).unwrap();
        assert!(reopened.probe(fp));
        assert_eq!(reopened.resident_bytes(), 9);
    }
}
