//! Disposable cache of GET response bodies with stale-while-revalidate reads.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::models::{CacheEntry, HttpMethod, ResourceKind};
use crate::services::DatabaseService;
use crate::util::now_millis;

/// Storage backend for cached responses
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<CacheEntry>>;
    async fn store(&self, entry: &CacheEntry) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<bool>;
    /// Remove entries whose path is `path` or nested beneath it
    async fn remove_path(&self, path: &str) -> Result<u64>;
    async fn clear(&self) -> Result<u64>;
}

/// Cache entries kept in the same libSQL file as the queue
#[derive(Clone)]
pub struct LibSqlCacheStore {
    db: DatabaseService,
}

impl LibSqlCacheStore {
    pub const fn new(db: DatabaseService) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CacheStore for LibSqlCacheStore {
    async fn load(&self, key: &str) -> Result<Option<CacheEntry>> {
        self.db.cache_get(key).await
    }

    async fn store(&self, entry: &CacheEntry) -> Result<()> {
        self.db.cache_put(entry).await
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        self.db.cache_delete(key).await
    }

    async fn remove_path(&self, path: &str) -> Result<u64> {
        self.db.cache_delete_path(path).await
    }

    async fn clear(&self) -> Result<u64> {
        self.db.cache_clear().await
    }
}

/// Outcome of a stale-while-revalidate read
#[derive(Debug)]
pub enum CacheLookup {
    /// Younger than the max age
    Fresh(serde_json::Value),
    /// Served from cache; `refresh` is set when this read started the
    /// background refresh for the key
    Stale {
        body: serde_json::Value,
        refresh: Option<JoinHandle<()>>,
    },
    /// Miss; fetched inline and stored
    Fetched(serde_json::Value),
}

impl CacheLookup {
    pub fn into_body(self) -> serde_json::Value {
        match self {
            Self::Fresh(body) | Self::Stale { body, .. } | Self::Fetched(body) => body,
        }
    }
}

/// Normalized request identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    /// `GET /path?a=1&b=2`
    pub key: String,
    /// Normalized path without query
    pub path: String,
}

/// Build the cache key for a request. Only GET is cacheable.
///
/// Paths are given a leading slash and lose trailing and doubled slashes;
/// query parameters are sorted so equivalent requests share one entry.
pub fn cache_key(method: HttpMethod, path_and_query: &str) -> Result<CacheKey> {
    if method != HttpMethod::Get {
        return Err(Error::InvalidOperation(format!(
            "only GET responses are cacheable, got {method}"
        )));
    }

    let (raw_path, raw_query) = path_and_query
        .trim()
        .split_once('?')
        .unwrap_or((path_and_query.trim(), ""));
    let path = normalize_path(raw_path);

    let mut params = raw_query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .collect::<Vec<_>>();
    params.sort_unstable();

    let key = if params.is_empty() {
        format!("{method} {path}")
    } else {
        format!("{method} {path}?{}", params.join("&"))
    };
    Ok(CacheKey { key, path })
}

fn normalize_path(raw: &str) -> String {
    let segments = raw
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>();
    format!("/{}", segments.join("/"))
}

/// Removes its key from the in-flight set when the refresh ends
struct RefreshGuard {
    in_flight: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.remove(&self.key);
        }
    }
}

/// Invalidation counter per path prefix
#[derive(Debug, Default)]
struct Invalidations {
    generation: u64,
    by_prefix: HashMap<String, u64>,
}

impl Invalidations {
    fn bump(&mut self, prefix: &str) {
        self.generation += 1;
        self.by_prefix.insert(prefix.to_string(), self.generation);
    }

    /// Whether `path` was invalidated after `since` was observed.
    fn invalidated_since(&self, path: &str, since: u64) -> bool {
        self.by_prefix
            .iter()
            .any(|(prefix, generation)| *generation > since && path_within(path, prefix))
    }
}

fn path_within(path: &str, prefix: &str) -> bool {
    prefix == "/"
        || path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// GET response cache
#[derive(Clone)]
pub struct ResponseCache {
    store: Arc<dyn CacheStore>,
    max_age: Duration,
    refreshing: Arc<Mutex<HashSet<String>>>,
    invalidations: Arc<Mutex<Invalidations>>,
}

impl ResponseCache {
    pub fn new(store: Arc<dyn CacheStore>, max_age: Duration) -> Self {
        Self {
            store,
            max_age,
            refreshing: Arc::new(Mutex::new(HashSet::new())),
            invalidations: Arc::new(Mutex::new(Invalidations::default())),
        }
    }

    /// Cache backed by the database service
    pub fn with_database(db: DatabaseService, max_age: Duration) -> Self {
        Self::new(Arc::new(LibSqlCacheStore::new(db)), max_age)
    }

    fn max_age_millis(&self) -> i64 {
        i64::try_from(self.max_age.as_millis()).unwrap_or(i64::MAX)
    }

    /// Read an entry; hard-expired entries are deleted and read as a miss.
    pub async fn get(
        &self,
        method: HttpMethod,
        path_and_query: &str,
    ) -> Result<Option<CacheEntry>> {
        let key = cache_key(method, path_and_query)?;
        self.load_live(&key.key).await
    }

    async fn load_live(&self, key: &str) -> Result<Option<CacheEntry>> {
        let Some(entry) = self.store.load(key).await? else {
            return Ok(None);
        };
        if entry.is_expired(now_millis()) {
            self.store.remove(key).await?;
            return Ok(None);
        }
        Ok(Some(entry))
    }

    /// Store a body, optionally with a hard expiry.
    pub async fn set(
        &self,
        method: HttpMethod,
        path_and_query: &str,
        body: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let key = cache_key(method, path_and_query)?;
        let now = now_millis();
        let entry = CacheEntry {
            key: key.key,
            method: method.as_str().to_string(),
            path: key.path,
            body,
            timestamp: now,
            expires_at: ttl.map(|ttl| {
                now.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
            }),
        };
        self.store.store(&entry).await
    }

    pub async fn clear(&self, method: HttpMethod, path_and_query: &str) -> Result<bool> {
        let key = cache_key(method, path_and_query)?;
        self.mark_invalidated(&key.path);
        self.store.remove(&key.key).await
    }

    pub async fn clear_all(&self) -> Result<u64> {
        self.mark_invalidated("/");
        self.store.clear().await
    }

    fn mark_invalidated(&self, prefix: &str) {
        if let Ok(mut invalidations) = self.invalidations.lock() {
            invalidations.bump(prefix);
        }
    }

    fn generation(&self) -> u64 {
        self.invalidations
            .lock()
            .map_or(0, |invalidations| invalidations.generation)
    }

    /// Drop every cached response of the resource a write touched.
    pub async fn invalidate_resource(&self, path: &str) -> Result<u64> {
        let path = path.split('?').next().unwrap_or_default();
        let prefix = ResourceKind::from_path(path).map_or_else(
            || normalize_path(path),
            |(kind, _)| kind.collection_path().to_string(),
        );
        self.mark_invalidated(&prefix);
        let removed = self.store.remove_path(&prefix).await?;
        if removed > 0 {
            tracing::debug!("Invalidated {removed} cached responses under {prefix}");
        }
        Ok(removed)
    }

    /// Stale-while-revalidate read.
    ///
    /// Fresh entries are returned as-is. Stale entries are returned at once
    /// and at most one background refresh per key runs at a time; refresh
    /// failures are logged and never reach the caller. Misses are fetched
    /// inline and stored. A refresh that finishes after its path was
    /// invalidated is discarded.
    pub async fn get_or_refresh<F, Fut>(
        &self,
        path_and_query: &str,
        fetcher: F,
    ) -> Result<CacheLookup>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        let key = cache_key(HttpMethod::Get, path_and_query)?;
        let started = self.generation();

        let Some(entry) = self.load_live(&key.key).await? else {
            let body = fetcher().await?;
            self.set(HttpMethod::Get, path_and_query, body.clone(), None)
                .await?;
            return Ok(CacheLookup::Fetched(body));
        };

        let now = now_millis();
        if entry.age_ms(now) <= self.max_age_millis() {
            return Ok(CacheLookup::Fresh(entry.body));
        }

        let refresh = self.spawn_refresh(&entry, started, fetcher);
        Ok(CacheLookup::Stale {
            body: entry.body,
            refresh,
        })
    }

    fn spawn_refresh<F, Fut>(
        &self,
        entry: &CacheEntry,
        started: u64,
        fetcher: F,
    ) -> Option<JoinHandle<()>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        {
            let mut in_flight = self.refreshing.lock().ok()?;
            if !in_flight.insert(entry.key.clone()) {
                return None;
            }
        }

        let guard = RefreshGuard {
            in_flight: Arc::clone(&self.refreshing),
            key: entry.key.clone(),
        };
        let store = Arc::clone(&self.store);
        let invalidations = Arc::clone(&self.invalidations);
        let ttl = entry
            .expires_at
            .map(|expires_at| expires_at.saturating_sub(entry.timestamp));
        let stale = entry.clone();

        Some(tokio::spawn(async move {
            let _guard = guard;
            match fetcher().await {
                Ok(body) => {
                    let invalidated = match invalidations.lock() {
                        Ok(state) => state.invalidated_since(&stale.path, started),
                        Err(_) => true,
                    };
                    if invalidated {
                        tracing::debug!("Dropped refresh of {}: invalidated meanwhile", stale.key);
                        return;
                    }
                    let now = now_millis();
                    let refreshed = CacheEntry {
                        body,
                        timestamp: now,
                        expires_at: ttl.map(|ttl| now.saturating_add(ttl)),
                        ..stale
                    };
                    if let Err(error) = store.store(&refreshed).await {
                        tracing::warn!(
                            "Failed to store refreshed cache entry {}: {error}",
                            refreshed.key
                        );
                    }
                }
                Err(error) => {
                    tracing::warn!("Background refresh of {} failed: {error}", stale.key);
                }
            }
        }))
    }
}
