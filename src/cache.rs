// =============================================================================
// TTL caches: in-process map and Redis-backed variant
// =============================================================================
//
// `MemoryCache` is a lazy-evicting TTL map used both for history responses
// and inside the provider (symbol directory, trading calendar). `RedisCache`
// stores compact JSON strings via SETEX; once constructed, its failures
// degrade to cache misses rather than request errors. Constructing it
// against an unreachable server is a fatal configuration error.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::config::{CacheBackend, Settings};
use crate::types::HistoryResponse;

// =============================================================================
// MemoryCache
// =============================================================================

struct Entry<T> {
    value: T,
    expires_at: Instant,
}

/// In-process TTL cache. Expired entries are evicted lazily on read.
pub struct MemoryCache<T> {
    store: RwLock<HashMap<String, Entry<T>>>,
}

impl<T> Default for MemoryCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MemoryCache<T> {
    pub fn new() -> Self {
        Self {
            store: RwLock::new(HashMap::new()),
        }
    }
}

impl<T: Clone> MemoryCache<T> {
    pub fn get(&self, key: &str) -> Option<T> {
        {
            let store = self.store.read();
            let entry = store.get(key)?;
            if entry.expires_at > Instant::now() {
                return Some(entry.value.clone());
            }
        }
        // Expired: evict under the write lock, re-checking in case a
        // concurrent set refreshed the entry in between.
        let mut store = self.store.write();
        if let Some(entry) = store.get(key) {
            if entry.expires_at > Instant::now() {
                return Some(entry.value.clone());
            }
            store.remove(key);
        }
        None
    }

    pub fn set(&self, key: impl Into<String>, value: T, ttl: Duration) {
        self.store.write().insert(
            key.into(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }
}

// =============================================================================
// RedisCache
// =============================================================================

pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    /// Connect to the Redis server. Unreachable server or bad URL is an
    /// error the caller should treat as fatal configuration.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).with_context(|| format!("invalid redis url {url}"))?;
        let conn = ConnectionManager::new(client)
            .await
            .with_context(|| format!("failed to connect to redis at {url}"))?;
        Ok(Self { conn })
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = match conn.get(key).await {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "redis GET failed, treating as miss");
                return None;
            }
        };
        let payload = payload?;
        match serde_json::from_str(&payload) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "corrupt cache entry, treating as miss");
                None
            }
        }
    }

    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl_seconds: u64) {
        let payload = match serde_json::to_string(value) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(key, error = %e, "failed to serialize cache entry");
                return;
            }
        };
        let mut conn = self.conn.clone();
        if let Err(e) = conn.set_ex::<_, _, ()>(key, payload, ttl_seconds).await {
            warn!(key, error = %e, "redis SETEX failed, entry not cached");
        }
    }
}

// =============================================================================
// HistoryCache
// =============================================================================

/// The history endpoint's cache, selected by `CACHE_BACKEND`.
pub enum HistoryCache {
    Memory(MemoryCache<HistoryResponse>),
    Redis(RedisCache),
}

impl HistoryCache {
    pub async fn from_settings(settings: &Settings) -> Result<Self> {
        match settings.cache_backend {
            CacheBackend::Memory => Ok(HistoryCache::Memory(MemoryCache::new())),
            CacheBackend::Redis => Ok(HistoryCache::Redis(
                RedisCache::connect(&settings.redis_url)
                    .await
                    .context("redis cache backend selected but unavailable")?,
            )),
        }
    }

    pub async fn get(&self, key: &str) -> Option<HistoryResponse> {
        match self {
            HistoryCache::Memory(cache) => cache.get(key),
            HistoryCache::Redis(cache) => cache.get_json(key).await,
        }
    }

    pub async fn set(&self, key: &str, value: &HistoryResponse, ttl_seconds: u64) {
        match self {
            HistoryCache::Memory(cache) => {
                cache.set(key, value.clone(), Duration::from_secs(ttl_seconds));
            }
            HistoryCache::Redis(cache) => cache.set_json(key, value, ttl_seconds).await,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
