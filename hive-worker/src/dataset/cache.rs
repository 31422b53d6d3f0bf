//! Dataset cache
//!
//! For a dataset shared by N co-located workers exactly one of them (the
//! downloader) fetches it; the others (waiters) take a counted reference
//! and poll until the downloader marks the entry ready. The directory is
//! deleted when the last reference is released, unless the entry is
//! persisted.
//!
//! Every successful [`DatasetCache::acquire`] must be paired with exactly one
//! [`DatasetCache::release`]. A failed acquire never leaves a reference behind.

use anyhow::{Context, Result};
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::registry::{DatasetRegistry, ReleaseOutcome};
use crate::storage;

/// Seconds between two readiness checks of a waiter
pub const WAIT_INTERVAL: Duration = Duration::from_secs(10);

/// Readiness checks before a waiter gives up (10 minutes in total)
pub const WAIT_ATTEMPTS: u32 = 60;

pub struct DatasetCache {
    registry: Arc<dyn DatasetRegistry>,
    root: PathBuf,
    http: Client,
    wait_interval: Duration,
    wait_attempts: u32,
}

impl DatasetCache {
    /// Creates a cache storing datasets under `root`
    pub fn new(registry: Arc<dyn DatasetRegistry>, root: impl Into<PathBuf>) -> Self {
        Self {
            registry,
            root: root.into(),
            http: Client::new(),
            wait_interval: WAIT_INTERVAL,
            wait_attempts: WAIT_ATTEMPTS,
        }
    }

    /// Overrides how long waiters poll for readiness
    #[cfg(test)]
    pub fn with_wait(mut self, interval: Duration, attempts: u32) -> Self {
        self.wait_interval = interval;
        self.wait_attempts = attempts;
        self
    }

    /// Directory a dataset lives in once downloaded
    pub fn local_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Obtains a usable local copy of `name`, downloading it if no worker has
    ///
    /// # Returns
    /// The dataset directory; the caller now holds one reference
    pub async fn acquire(&self, name: &str, urls: &[String], persist: bool) -> Result<PathBuf> {
        validate_name(name)?;
        let path = self.local_path(name);

        let inserted = self
            .registry
            .insert_if_absent(name, &path, persist)
            .await
            .with_context(|| format!("Failed to register dataset {}", name))?;

        if inserted {
            info!(dataset = name, "Downloading dataset");
            self.download(name, &path, urls).await?;
            Ok(path)
        } else {
            info!(dataset = name, "Dataset already registered, waiting for it");
            self.wait(name).await
        }
    }

    async fn download(&self, name: &str, path: &Path, urls: &[String]) -> Result<()> {
        if tokio::fs::try_exists(path).await.unwrap_or(true) {
            error!(
                dataset = name,
                "Directory {} exists without a registry row, discarding both",
                path.display()
            );
            self.discard(name, path).await;
            anyhow::bail!("Dataset directory {} was corrupt and has been removed", path.display());
        }

        if let Err(e) = storage::download_all(&self.http, urls, path).await {
            error!(dataset = name, "Dataset download failed: {:#}", e);
            self.discard(name, path).await;
            return Err(e.context(format!("Failed to download dataset {}", name)));
        }

        match self.registry.mark_ready(name).await {
            Ok(true) => {
                info!(dataset = name, "Dataset ready at {}", path.display());
                Ok(())
            }
            Ok(false) => {
                self.discard(name, path).await;
                anyhow::bail!("Registry row for dataset {} vanished during download", name)
            }
            Err(e) => {
                self.discard(name, path).await;
                Err(anyhow::Error::new(e).context(format!("Failed to mark dataset {} ready", name)))
            }
        }
    }

    async fn wait(&self, name: &str) -> Result<PathBuf> {
        let generation = self
            .registry
            .increment(name)
            .await
            .with_context(|| format!("Failed to take a reference on dataset {}", name))?
            .with_context(|| format!("Dataset {} disappeared before a reference could be taken", name))?;

        for attempt in 1..=self.wait_attempts {
            match self.registry.get(name).await {
                // Our counted row was discarded and someone registered the
                // dataset again; that reference went with the old row.
                Ok(Some(entry)) if entry.generation != generation => {
                    anyhow::bail!("Dataset {} was replaced while waiting for it", name);
                }
                Ok(Some(entry)) if entry.ready => {
                    info!(dataset = name, "Dataset ready after {} check(s)", attempt);
                    return Ok(entry.local_path);
                }
                Ok(Some(_)) => {
                    debug!(dataset = name, "Dataset not ready ({}/{})", attempt, self.wait_attempts);
                }
                Ok(None) => {
                    anyhow::bail!("Dataset {} was discarded while waiting for it", name);
                }
                Err(e) => {
                    self.give_back(name).await;
                    return Err(anyhow::Error::new(e)
                        .context(format!("Failed to query readiness of dataset {}", name)));
                }
            }
            if attempt < self.wait_attempts {
                tokio::time::sleep(self.wait_interval).await;
            }
        }

        self.give_back(name).await;
        anyhow::bail!(
            "Timed out waiting for dataset {} after {} checks",
            name,
            self.wait_attempts
        )
    }

    /// Gives back one reference, deleting the directory if it was the last
    pub async fn release(&self, name: &str) -> Result<()> {
        let outcome = self
            .registry
            .release(name)
            .await
            .with_context(|| format!("Failed to release dataset {}", name))?;

        match outcome {
            ReleaseOutcome::Remove(path) => {
                info!(dataset = name, "Last reference released, removing {}", path.display());
                remove_dir(&path).await;
            }
            ReleaseOutcome::Retained { refcount } => {
                debug!(dataset = name, "Dataset retained with {} reference(s)", refcount);
            }
            ReleaseOutcome::NotHeld => {
                warn!(dataset = name, "Released a dataset without a counted reference");
            }
        }

        Ok(())
    }

    async fn give_back(&self, name: &str) {
        if let Err(e) = self.release(name).await {
            warn!(dataset = name, "Failed to give back reference: {:#}", e);
        }
    }

    async fn discard(&self, name: &str, path: &Path) {
        remove_dir(path).await;
        if let Err(e) = self.registry.remove(name).await {
            warn!(dataset = name, "Failed to delete registry row: {}", e);
        }
    }
}

async fn remove_dir(path: &Path) {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
    }
}

/// Dataset names become directory names under the shared root
fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        anyhow::bail!("Invalid dataset name '{}'", name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::registry::SqliteRegistry;
    use httpmock::prelude::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        db: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path().join("datasets");
            let db = root.join("registry.db");
            Self { _dir: dir, root, db }
        }

        /// A cache with its own connection pool, like a separate worker process
        async fn worker(&self) -> (DatasetCache, Arc<SqliteRegistry>) {
            let registry = Arc::new(SqliteRegistry::open(&self.db).await.unwrap());
            let cache = DatasetCache::new(registry.clone(), &self.root)
                .with_wait(Duration::from_millis(20), 200);
            (cache, registry)
        }
    }

    #[tokio::test]
    async fn test_acquire_downloads_then_release_removes() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/mnist/train.csv");
            then.status(200).body("1,2,3");
        });

        let fixture = Fixture::new();
        let (cache, registry) = fixture.worker().await;

        let path = cache
            .acquire("mnist", &[server.url("/mnist/train.csv")], false)
            .await
            .unwrap();

        mock.assert_hits(1);
        assert_eq!(path, fixture.root.join("mnist"));
        assert!(path.join("train.csv").exists());
        let entry = registry.get("mnist").await.unwrap().unwrap();
        assert!(entry.ready);
        assert_eq!(entry.refcount, 1);

        cache.release("mnist").await.unwrap();
        assert!(!path.exists());
        assert!(registry.get("mnist").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_persisted_dataset_survives_release() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/imagenet/labels.txt");
            then.status(200).body("cat\ndog\n");
        });

        let fixture = Fixture::new();
        let (cache, registry) = fixture.worker().await;

        let path = cache
            .acquire("imagenet", &[server.url("/imagenet/labels.txt")], true)
            .await
            .unwrap();
        cache.release("imagenet").await.unwrap();

        assert!(path.join("labels.txt").exists());
        let entry = registry.get("imagenet").await.unwrap().unwrap();
        assert_eq!(entry.refcount, 0);
        assert!(entry.persist);
    }

    #[tokio::test]
    async fn test_concurrent_acquire_downloads_once() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/shared/data.bin");
            then.status(200)
                .delay(Duration::from_millis(200))
                .body("payload");
        });
        let url = server.url("/shared/data.bin");

        let fixture = Fixture::new();
        let mut workers = Vec::new();
        for _ in 0..4 {
            workers.push(fixture.worker().await);
        }

        let mut handles = Vec::new();
        for (cache, _) in workers {
            let url = url.clone();
            handles.push(tokio::spawn(async move {
                let result = cache.acquire("shared", &[url], false).await;
                (cache, result)
            }));
        }

        let mut caches = Vec::new();
        for handle in handles {
            let (cache, result) = handle.await.unwrap();
            assert_eq!(result.unwrap(), fixture.root.join("shared"));
            caches.push(cache);
        }

        mock.assert_hits(1);
        let (_, registry) = fixture.worker().await;
        let entry = registry.get("shared").await.unwrap().unwrap();
        assert!(entry.ready);
        assert_eq!(entry.refcount, 4);

        for (released, cache) in caches.iter().enumerate() {
            cache.release("shared").await.unwrap();
            let remaining = registry.get("shared").await.unwrap().map(|e| e.refcount);
            let expected = 4 - (released as i64 + 1);
            if expected == 0 {
                assert_eq!(remaining, None);
            } else {
                assert_eq!(remaining, Some(expected));
            }
        }
        assert!(!fixture.root.join("shared").exists());
    }

    #[tokio::test]
    async fn test_failed_download_leaves_nothing_behind() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/broken/part-1.csv");
            then.status(200).body("ok");
        });
        server.mock(|when, then| {
            when.method(GET).path("/broken/part-2.csv");
            then.status(500);
        });

        let fixture = Fixture::new();
        let (cache, registry) = fixture.worker().await;

        let urls = vec![
            server.url("/broken/part-1.csv"),
            server.url("/broken/part-2.csv"),
        ];
        assert!(cache.acquire("broken", &urls, false).await.is_err());

        assert!(!fixture.root.join("broken").exists());
        assert!(registry.get("broken").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_orphaned_directory_is_discarded() {
        let fixture = Fixture::new();
        let (cache, registry) = fixture.worker().await;
        std::fs::create_dir_all(fixture.root.join("stale")).unwrap();
        std::fs::write(fixture.root.join("stale/half.bin"), b"x").unwrap();

        assert!(cache.acquire("stale", &[], false).await.is_err());

        assert!(!fixture.root.join("stale").exists());
        assert!(registry.get("stale").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_waiter_timeout_gives_reference_back() {
        let fixture = Fixture::new();
        let (cache, registry) = fixture.worker().await;
        let cache = cache.with_wait(Duration::from_millis(5), 3);

        // Another worker is still downloading.
        registry
            .insert_if_absent("slow", &fixture.root.join("slow"), false)
            .await
            .unwrap();

        assert!(cache.acquire("slow", &[], false).await.is_err());

        let entry = registry.get("slow").await.unwrap().unwrap();
        assert_eq!(entry.refcount, 1);
        assert!(!entry.ready);
    }

    #[tokio::test]
    async fn test_waiter_fails_when_row_is_recreated() {
        let fixture = Fixture::new();
        let (cache, registry) = fixture.worker().await;
        let path = fixture.root.join("mnist");

        // First downloader is still fetching.
        registry.insert_if_absent("mnist", &path, false).await.unwrap();

        let waiter = tokio::spawn(async move { cache.acquire("mnist", &[], false).await });
        for _ in 0..200 {
            let entry = registry.get("mnist").await.unwrap().unwrap();
            if entry.refcount == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(registry.get("mnist").await.unwrap().unwrap().refcount, 2);

        // Its download fails and a second downloader completes a fresh row.
        registry.remove("mnist").await.unwrap();
        assert!(registry.insert_if_absent("mnist", &path, false).await.unwrap());
        assert!(registry.mark_ready("mnist").await.unwrap());

        assert!(waiter.await.unwrap().is_err());
        let entry = registry.get("mnist").await.unwrap().unwrap();
        assert_eq!(entry.refcount, 1);
        assert!(entry.ready);
    }

    #[tokio::test]
    async fn test_waiter_does_not_sleep_after_last_check() {
        let fixture = Fixture::new();
        let (cache, registry) = fixture.worker().await;
        let cache = cache.with_wait(Duration::from_millis(300), 1);

        registry
            .insert_if_absent("slow", &fixture.root.join("slow"), false)
            .await
            .unwrap();

        let started = std::time::Instant::now();
        assert!(cache.acquire("slow", &[], false).await.is_err());
        assert!(started.elapsed() < Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_rejects_path_like_names() {
        let fixture = Fixture::new();
        let (cache, _) = fixture.worker().await;

        assert!(cache.acquire("../etc", &[], false).await.is_err());
        assert!(cache.acquire("", &[], false).await.is_err());
    }
}
