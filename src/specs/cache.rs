//! Time-boxed local copy of the model spec catalog
//!
//! The cache is a file pair under the scratch directory:
//! ```text
//! <scratch>/cache/
//! ├── model_specs.json            # upstream document, verbatim
//! └── model_specs_timestamp.txt   # fetch time, Unix seconds
//! ```
//! A copy younger than the TTL is used as-is. Anything older triggers a
//! refetch, and when that refetch fails the stale copy is still returned.

use super::model::{ModelSpec, parse_specs};
use super::source::{CatalogError, SpecSource};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;

const PAYLOAD_FILE: &str = "model_specs.json";
const TIMESTAMP_FILE: &str = "model_specs_timestamp.txt";

// ============================================================================
// Trait Definitions
// ============================================================================

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Trait for storage backend operations
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Save content to a file path atomically
    async fn save(&self, path: &Path, content: &str) -> Result<()>;

    /// Load content from a file path
    /// Returns None if file doesn't exist
    async fn load(&self, path: &Path) -> Result<Option<String>>;
}

// ============================================================================
// Production Implementation
// ============================================================================

/// Production storage backend using tokio::fs
#[derive(Debug, Default)]
pub struct FileSystemStorage;

impl FileSystemStorage {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StorageBackend for FileSystemStorage {
    async fn save(&self, path: &Path, content: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create cache directory: {:?}", parent))?;
        }

        // Atomic write: write to temp file, then rename
        let temp_file = path.with_extension("tmp");

        let mut file = fs::File::create(&temp_file)
            .await
            .context("Failed to create temp cache file")?;
        file.write_all(content.as_bytes())
            .await
            .context("Failed to write cache file")?;
        file.sync_all().await.context("Failed to sync cache file")?;

        fs::rename(&temp_file, path)
            .await
            .context("Failed to rename temp cache file")?;

        Ok(())
    }

    async fn load(&self, path: &Path) -> Result<Option<String>> {
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read cache file: {:?}", path))?;

        Ok(Some(content))
    }
}

// ============================================================================
// Spec Cache
// ============================================================================

/// Where a catalog came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogOrigin {
    /// Fetched from upstream during this run
    Fetched,
    /// Fresh cached copy
    Cache { age: Duration },
    /// Refetch failed, stale copy used instead. Age is None when the
    /// timestamp marker was missing or unreadable.
    StaleFallback { age: Option<Duration> },
}

/// Spec records plus their provenance
#[derive(Debug, Clone)]
pub struct SpecCatalog {
    pub specs: Vec<ModelSpec>,
    pub origin: CatalogOrigin,
}

/// Cached document read back from storage
struct CachedCopy {
    specs: Vec<ModelSpec>,
    fetched_at: Option<DateTime<Utc>>,
}

/// Spec catalog cache with injected clock, storage and upstream source
pub struct SpecCache {
    dir: PathBuf,
    ttl: Duration,
    source: Arc<dyn SpecSource>,
    storage: Arc<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
}

impl SpecCache {
    /// Create a cache with custom storage backend and clock
    pub fn new_with(
        dir: PathBuf,
        ttl: Duration,
        source: Arc<dyn SpecSource>,
        storage: Arc<dyn StorageBackend>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            dir,
            ttl,
            source,
            storage,
            clock,
        }
    }

    /// Create a cache on the real filesystem and wall clock
    pub fn new(dir: PathBuf, ttl: Duration, source: Arc<dyn SpecSource>) -> Self {
        Self::new_with(
            dir,
            ttl,
            source,
            Arc::new(FileSystemStorage::new()),
            Arc::new(SystemClock),
        )
    }

    pub fn payload_path(&self) -> PathBuf {
        self.dir.join(PAYLOAD_FILE)
    }

    pub fn timestamp_path(&self) -> PathBuf {
        self.dir.join(TIMESTAMP_FILE)
    }

    /// Load the catalog, refetching when the cached copy is stale or
    /// `force_refresh` is set
    pub async fn load(&self, force_refresh: bool) -> Result<SpecCatalog, CatalogError> {
        let now = self.clock.now();
        let cached = self.read_cached().await;

        if !force_refresh
            && let Some(copy) = &cached
            && let Some(age) = copy.age(now)
            && age < self.ttl
        {
            tracing::info!(
                age_secs = age.as_secs(),
                specs = copy.specs.len(),
                "Using cached model specifications"
            );
            return Ok(SpecCatalog {
                specs: copy.specs.clone(),
                origin: CatalogOrigin::Cache { age },
            });
        }

        match self.fetch().await {
            Ok((document, specs)) => {
                if let Err(e) = self.write(&document, now).await {
                    tracing::warn!(error = %e, "Failed to cache model specifications");
                }
                tracing::info!(specs = specs.len(), "Fetched model specifications");
                Ok(SpecCatalog {
                    specs,
                    origin: CatalogOrigin::Fetched,
                })
            }
            Err(e) => match cached {
                Some(copy) => {
                    let age = copy.age(now);
                    tracing::warn!(
                        error = %e,
                        age_secs = ?age.map(|a| a.as_secs()),
                        "Spec refresh failed, falling back to stale cache"
                    );
                    Ok(SpecCatalog {
                        specs: copy.specs,
                        origin: CatalogOrigin::StaleFallback { age },
                    })
                }
                None => Err(e),
            },
        }
    }

    async fn fetch(&self) -> Result<(serde_json::Value, Vec<ModelSpec>), CatalogError> {
        let document = self.source.fetch().await?;
        let specs = parse_specs(&document).ok_or(CatalogError::Format)?;
        Ok((document, specs))
    }

    /// Payload first, marker last: an interrupted write leaves an old
    /// marker behind, which only makes the copy look stale
    async fn write(&self, document: &serde_json::Value, now: DateTime<Utc>) -> Result<()> {
        let payload = serde_json::to_string(document).context("Failed to serialize specs")?;
        self.storage.save(&self.payload_path(), &payload).await?;

        let stamp = now.timestamp_millis() as f64 / 1000.0;
        self.storage
            .save(&self.timestamp_path(), &stamp.to_string())
            .await?;

        tracing::debug!(path = ?self.payload_path(), "Model specifications cached");
        Ok(())
    }

    async fn read_cached(&self) -> Option<CachedCopy> {
        let payload = match self.storage.load(&self.payload_path()).await {
            Ok(Some(payload)) => payload,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read spec cache");
                return None;
            }
        };

        let specs = match serde_json::from_str::<serde_json::Value>(&payload)
            .ok()
            .and_then(|doc| parse_specs(&doc))
        {
            Some(specs) => specs,
            None => {
                tracing::warn!(path = ?self.payload_path(), "Ignoring unreadable spec cache");
                return None;
            }
        };

        let fetched_at = self
            .storage
            .load(&self.timestamp_path())
            .await
            .ok()
            .flatten()
            .and_then(|raw| parse_timestamp(&raw));

        Some(CachedCopy { specs, fetched_at })
    }
}

impl CachedCopy {
    /// None when there is no marker or it lies in the future
    fn age(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.fetched_at
            .and_then(|at| now.signed_duration_since(at).to_std().ok())
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let secs: f64 = raw.trim().parse().ok()?;
    if !secs.is_finite() {
        return None;
    }
    DateTime::from_timestamp_millis((secs * 1000.0) as i64)
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================
