//! Exact-match and approximate-match response caching.
//!
//! Exact entries live under `ai_response:<digest>` for the configured TTL.
//! Every write also records a [`SimilarityRecord`] under
//! `ai_similarity:<digest>` with twice that TTL, so approximate lookups keep
//! working for a while after the exact entry has expired.
//!
//! Every operation degrades to a miss or no-op when the backing store is
//! missing or failing; store errors are counted and logged, never returned.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::fingerprint::{self, jaccard_similarity, SIMILARITY_NAMESPACE, RESPONSE_NAMESPACE};
use crate::logging::log_cache_event;
use crate::store::{KvStore, MemoryStore, RedisStore, StoreInfo};

/// Longest TTL accepted for a cached response. Similarity records live twice as long.
pub const MAX_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Redis,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub backend: StoreBackend,
    pub redis_url: String,
    /// Entry bound for the in-process backend.
    pub memory_capacity: usize,
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,
    pub similarity_threshold: f64,
    /// Most similarity records inspected by one `get_similar` call.
    pub similarity_sample: usize,
    /// Let the relay answer with the best approximate match on an exact miss.
    pub serve_similar: bool,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub op_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Redis,
            redis_url: "redis://localhost:6379".to_string(),
            memory_capacity: 10_000,
            default_ttl: Duration::from_secs(3600),
            similarity_threshold: 0.85,
            similarity_sample: 100,
            serve_similar: false,
            connect_timeout: Duration::from_secs(5),
            op_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityRecord {
    pub prompt: String,
    pub response: String,
    pub model: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarMatch {
    pub prompt: String,
    pub response: String,
    pub similarity: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub errors: u64,
    pub similar_hits: u64,
    pub hit_rate: f64,
    pub available: bool,
    pub backend: Option<StoreInfo>,
    pub cached_responses: usize,
    pub cached_similarities: usize,
    pub total_cached_items: usize,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    errors: AtomicU64,
    similar_hits: AtomicU64,
}

pub struct ResponseCache {
    config: CacheConfig,
    store: RwLock<Option<Arc<dyn KvStore>>>,
    counters: CacheCounters,
}

impl ResponseCache {
    /// Connects to the configured backend. An unreachable store leaves the
    /// cache in the degraded state instead of failing.
    pub async fn connect(config: CacheConfig) -> Self {
        let store: Option<Arc<dyn KvStore>> = match config.backend {
            StoreBackend::Memory => Some(Arc::new(MemoryStore::new(config.memory_capacity))),
            StoreBackend::Redis => {
                match RedisStore::connect(&config.redis_url, config.connect_timeout, config.op_timeout).await {
                    Ok(store) => Some(Arc::new(store)),
                    Err(e) => {
                        warn!(error = %e, "Cache store unavailable, caching disabled");
                        None
                    }
                }
            }
        };

        if let Some(store) = &store {
            info!(backend = store.name(), "Response cache initialized");
        }

        Self {
            config,
            store: RwLock::new(store),
            counters: CacheCounters::default(),
        }
    }

    pub fn with_store(config: CacheConfig, store: Arc<dyn KvStore>) -> Self {
        Self {
            config,
            store: RwLock::new(Some(store)),
            counters: CacheCounters::default(),
        }
    }

    /// A cache with no backing store; every lookup misses.
    pub fn disabled(config: CacheConfig) -> Self {
        Self {
            config,
            store: RwLock::new(None),
            counters: CacheCounters::default(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn is_available(&self) -> bool {
        self.store().is_some()
    }

    fn store(&self) -> Option<Arc<dyn KvStore>> {
        self.store.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn record_error(&self, error: &StoreError, operation: &str) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        warn!(error = %error, operation = operation, "Cache store operation failed");
    }

    /// Exact-match lookup.
    pub async fn get(&self, prompt: &str, model: &str) -> Option<String> {
        let store = self.store()?;
        let key = fingerprint::cache_key(prompt, model);

        match store.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<String>(&raw) {
                Ok(response) => {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    log_cache_event("get", &key, true);
                    Some(response)
                }
                Err(e) => {
                    self.counters.misses.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %fingerprint::short_key(&key), error = %e, "Malformed cache entry treated as miss");
                    None
                }
            },
            Ok(None) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                log_cache_event("get", &key, false);
                None
            }
            Err(e) => {
                self.record_error(&e, "get");
                None
            }
        }
    }

    /// Stores `response` for the exact key and indexes it for similarity lookups.
    ///
    /// Returns whether the exact entry was written.
    pub async fn set(&self, prompt: &str, response: &str, model: &str, ttl: Option<Duration>) -> bool {
        let Some(store) = self.store() else {
            return false;
        };
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        if ttl.is_zero() {
            warn!("Refusing to cache with a zero TTL");
            return false;
        }
        if ttl > MAX_TTL {
            debug!(requested_secs = ttl.as_secs(), "Clamping cache TTL to the maximum");
        }
        let ttl = ttl.min(MAX_TTL);

        let key = fingerprint::cache_key(prompt, model);
        let payload = match serde_json::to_string(response) {
            Ok(payload) => payload,
            Err(e) => {
                self.record_error(&StoreError::from(e), "set");
                return false;
            }
        };
        if let Err(e) = store.set_ex(&key, &payload, ttl).await {
            self.record_error(&e, "set");
            return false;
        }
        self.counters.sets.fetch_add(1, Ordering::Relaxed);

        let record = SimilarityRecord {
            prompt: prompt.to_string(),
            response: response.to_string(),
            model: model.to_string(),
            created_at: Utc::now(),
        };
        let similarity_key = fingerprint::similarity_key(prompt, model);
        let indexed = match serde_json::to_string(&record) {
            Ok(payload) => store.set_ex(&similarity_key, &payload, ttl.saturating_mul(2)).await,
            Err(e) => Err(StoreError::from(e)),
        };
        if let Err(e) = indexed {
            self.record_error(&e, "set_similarity");
        }

        debug!(
            key = %fingerprint::short_key(&key),
            ttl_secs = ttl.as_secs_f64(),
            "Cached response"
        );
        true
    }

    /// Ranked approximate matches for `prompt` among records of `model`.
    ///
    /// This is an unindexed linear scan: records are loaded until
    /// `similarity_sample` of them belong to `model`, and each of those costs
    /// a word-set comparison, so one call is O(n·m) for n scanned records of
    /// m words on average. The record population is kept small by TTL churn.
    pub async fn get_similar(&self, prompt: &str, model: &str, max_results: usize) -> Vec<SimilarMatch> {
        let Some(store) = self.store() else {
            return Vec::new();
        };
        if max_results == 0 {
            return Vec::new();
        }

        let pattern = format!("{}:*", SIMILARITY_NAMESPACE);
        let keys = match store.scan(&pattern, None).await {
            Ok(keys) => keys,
            Err(e) => {
                self.record_error(&e, "scan");
                return Vec::new();
            }
        };

        let mut matches = Vec::new();
        let mut examined = 0;
        for key in keys {
            if examined >= self.config.similarity_sample {
                break;
            }
            let raw = match store.get(&key).await {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(e) => {
                    self.record_error(&e, "get_similarity");
                    continue;
                }
            };
            let record: SimilarityRecord = match serde_json::from_str(&raw) {
                Ok(record) => record,
                Err(e) => {
                    debug!(key = %fingerprint::short_key(&key), error = %e, "Skipping malformed similarity record");
                    continue;
                }
            };
            if record.model != model {
                continue;
            }
            examined += 1;

            let similarity = jaccard_similarity(prompt, &record.prompt);
            if similarity >= self.config.similarity_threshold {
                matches.push(SimilarMatch {
                    prompt: record.prompt,
                    response: record.response,
                    similarity,
                    created_at: record.created_at,
                });
            }
        }

        matches.sort_by(|a, b| b.similarity.partial_cmp(&a.similarity).unwrap_or(CmpOrdering::Equal));
        matches.truncate(max_results);

        if !matches.is_empty() {
            self.counters.similar_hits.fetch_add(1, Ordering::Relaxed);
        }
        log_cache_event("get_similar", &fingerprint::similarity_key(prompt, model), !matches.is_empty());
        matches
    }

    /// Removes both the exact entry and the similarity record of a prompt/model pair.
    pub async fn invalidate(&self, prompt: &str, model: &str) -> bool {
        let Some(store) = self.store() else {
            return false;
        };
        let keys = [
            fingerprint::cache_key(prompt, model),
            fingerprint::similarity_key(prompt, model),
        ];

        match store.delete(&keys).await {
            Ok(removed) => {
                log_cache_event("invalidate", &keys[0], removed > 0);
                removed > 0
            }
            Err(e) => {
                self.record_error(&e, "invalidate");
                false
            }
        }
    }

    /// Deletes every entry of both namespaces, returning how many were removed.
    pub async fn clear_all(&self) -> u64 {
        let Some(store) = self.store() else {
            return 0;
        };

        let mut removed = 0;
        for namespace in [RESPONSE_NAMESPACE, SIMILARITY_NAMESPACE] {
            let keys = match store.scan(&format!("{}:*", namespace), None).await {
                Ok(keys) => keys,
                Err(e) => {
                    self.record_error(&e, "clear_all");
                    continue;
                }
            };
            match store.delete(&keys).await {
                Ok(count) => removed += count,
                Err(e) => self.record_error(&e, "clear_all"),
            }
        }

        info!(removed = removed, "Cleared response cache");
        removed
    }

    pub async fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            sets: self.counters.sets.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            similar_hits: self.counters.similar_hits.load(Ordering::Relaxed),
            ..CacheStats::default()
        };
        stats.hit_rate = stats.hit_ratio();

        let Some(store) = self.store() else {
            return stats;
        };
        stats.available = true;

        match store.info().await {
            Ok(info) => stats.backend = Some(info),
            Err(e) => self.record_error(&e, "info"),
        }
        match store.scan(&format!("{}:*", RESPONSE_NAMESPACE), None).await {
            Ok(keys) => stats.cached_responses = keys.len(),
            Err(e) => self.record_error(&e, "stats"),
        }
        match store.scan(&format!("{}:*", SIMILARITY_NAMESPACE), None).await {
            Ok(keys) => stats.cached_similarities = keys.len(),
            Err(e) => self.record_error(&e, "stats"),
        }
        stats.total_cached_items = stats.cached_responses + stats.cached_similarities;

        stats
    }

    pub fn reset_stats(&self) {
        self.counters.hits.store(0, Ordering::Relaxed);
        self.counters.misses.store(0, Ordering::Relaxed);
        self.counters.sets.store(0, Ordering::Relaxed);
        self.counters.errors.store(0, Ordering::Relaxed);
        self.counters.similar_hits.store(0, Ordering::Relaxed);
    }

    /// Detaches the backing store; the cache behaves as disabled afterwards.
    pub fn close(&self) {
        let previous = self.store.write().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(store) = previous {
            info!(backend = store.name(), "Response cache closed");
        }
    }
}
