//! The injected persistent entry store.

use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;

use crate::error::Result;

/// `get/insert/invalidate` keyed by an opaque string (the request
/// fingerprint). `httpsched` neither defines nor implements the storage
/// engine itself — `absolute_expiry` is advisory; a store is free to ignore
/// it, since [`crate::cache::entry::CacheEntry::must_revalidate`] and its
/// freshness horizon are re-derived from the serialized entry on every
/// lookup, not trusted from the store's own eviction policy.
#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    /// Returns the stored bytes for `key`, or `None` if absent. Read errors
    /// degrade to a cache miss at the call site; this trait still surfaces
    /// them so the caller can log them.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Stores `value` under `key`. `absolute_expiry` is advisory.
    async fn insert(&self, key: &str, value: Vec<u8>, absolute_expiry: Option<SystemTime>) -> Result<()>;

    /// Removes `key`, if present.
    async fn invalidate(&self, key: &str) -> Result<()>;
}

/// Default in-memory [`BlobStore`], backed by
/// [`moka`](https://github.com/moka-rs/moka) (feature `store-moka`, on by
/// default).
#[cfg(feature = "store-moka")]
#[derive(Clone)]
pub struct MokaStore {
    cache: Arc<moka::future::Cache<String, Arc<Vec<u8>>>>,
}

#[cfg(feature = "store-moka")]
impl fmt::Debug for MokaStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MokaStore").finish_non_exhaustive()
    }
}

#[cfg(feature = "store-moka")]
impl MokaStore {
    /// Creates a store backed by a cache holding up to `max_capacity` entries.
    pub fn new(max_capacity: u64) -> Self {
        Self { cache: Arc::new(moka::future::Cache::new(max_capacity)) }
    }
}

#[cfg(feature = "store-moka")]
impl Default for MokaStore {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[cfg(feature = "store-moka")]
#[async_trait]
impl BlobStore for MokaStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.cache.get(key).await.map(|v| v.as_ref().clone()))
    }

    async fn insert(&self, key: &str, value: Vec<u8>, _absolute_expiry: Option<SystemTime>) -> Result<()> {
        self.cache.insert(key.to_string(), Arc::new(value)).await;
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> Result<()> {
        self.cache.invalidate(key).await;
        Ok(())
    }
}

/// Disk-backed [`BlobStore`] using
/// [`cacache`](https://github.com/zkat/cacache-rs) (feature `store-cacache`).
#[cfg(feature = "store-cacache")]
#[derive(Debug, Clone)]
pub struct CacacheStore {
    path: String,
}

#[cfg(feature = "store-cacache")]
impl CacacheStore {
    /// Creates a store rooted at `path` on disk.
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

#[cfg(feature = "store-cacache")]
#[async_trait]
impl BlobStore for CacacheStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match cacache::read(&self.path, key).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(cacache::Error::EntryNotFound(..)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn insert(&self, key: &str, value: Vec<u8>, _absolute_expiry: Option<SystemTime>) -> Result<()> {
        cacache::write(&self.path, key, value).await?;
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> Result<()> {
        cacache::remove(&self.path, key).await?;
        Ok(())
    }
}

#[cfg(all(test, feature = "store-moka"))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn moka_store_round_trips() {
        let store = MokaStore::default();
        assert!(store.get("k").await.unwrap().is_none());
        store.insert("k", b"value".to_vec(), None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"value".to_vec()));
        store.invalidate("k").await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
    }
}
