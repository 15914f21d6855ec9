use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

pub mod cache;
pub mod config;
pub mod dedup;
pub mod error;
pub mod fingerprint;
pub mod logging;
pub mod pool;
pub mod store;

// Re-exports
pub use cache::{CacheConfig, CacheStats, ResponseCache, SimilarMatch, SimilarityRecord, StoreBackend};
pub use config::{LoggingConfig, RelayConfig, UpstreamConfig};
pub use dedup::{Coalesced, DedupConfig, DedupStats, PendingSummary, RequestDeduplicator, SweepReport};
pub use error::{ConfigError, DedupError, FailureKind, RelayError, StoreError, UpstreamFailure};
pub use fingerprint::{Fingerprint, GenerationParams};
pub use pool::{ConnectionPool, PoolConfig, PoolResponse, PoolStats, RequestOptions};
pub use reqwest::Method;
pub use store::{KvStore, MemoryStore, RedisStore, StoreInfo};

type UpstreamFuture = Pin<Box<dyn Future<Output = Result<String, UpstreamFailure>> + Send>>;

/// One generation request as received from the front end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    /// Falls back to the upstream default model.
    pub model: Option<String>,
    #[serde(default)]
    pub params: GenerationParams,
    pub system_prompt: Option<String>,
    /// Bypass cache lookups; the result is still written back.
    #[serde(default)]
    pub skip_cache: bool,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: None,
            params: GenerationParams::default(),
            system_prompt: None,
            skip_cache: false,
        }
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    pub fn system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn skip_cache(mut self) -> Self {
        self.skip_cache = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSource {
    /// Exact cache hit.
    Cache,
    /// Approximate match from the similarity index.
    Similar,
    /// This caller led the upstream call.
    Upstream,
    /// Coalesced onto another caller's upstream call.
    Joined,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub content: String,
    pub model: String,
    pub source: ResponseSource,
    /// Set for [`ResponseSource::Similar`] answers.
    pub similarity: Option<f64>,
    pub elapsed_ms: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayMetrics {
    pub requests_total: u64,
    pub cache_hits: u64,
    pub similar_hits: u64,
    pub cache_misses: u64,
    pub upstream_calls: u64,
    pub joined_calls: u64,
    pub errors_total: u64,
    pub average_response_time_ms: f64,
}

impl RelayMetrics {
    pub fn record_request(&mut self) {
        self.requests_total += 1;
    }

    pub fn record_cache_hit(&mut self) {
        self.cache_hits += 1;
    }

    pub fn record_similar_hit(&mut self) {
        self.similar_hits += 1;
    }

    pub fn record_cache_miss(&mut self) {
        self.cache_misses += 1;
    }

    pub fn record_upstream(&mut self, joined: bool) {
        if joined {
            self.joined_calls += 1;
        } else {
            self.upstream_calls += 1;
        }
    }

    pub fn record_error(&mut self) {
        self.errors_total += 1;
    }

    pub fn record_response_time(&mut self, duration_ms: f64) {
        // Running mean over all requests seen so far
        let total_requests = self.requests_total as f64;
        if total_requests > 0.0 {
            self.average_response_time_ms =
                (self.average_response_time_ms * (total_requests - 1.0) + duration_ms) / total_requests;
        } else {
            self.average_response_time_ms = duration_ms;
        }
    }

    pub fn cache_hit_ratio(&self) -> f64 {
        let total = self.cache_hits + self.similar_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            (self.cache_hits + self.similar_hits) as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayStats {
    pub relay: RelayMetrics,
    pub cache: CacheStats,
    pub dedup: DedupStats,
    pub pool: PoolStats,
}

/// Cache, coalescing and pooling in front of one upstream generation service.
///
/// Built explicitly through [`Relay::init`] and torn down with
/// [`Relay::shutdown`]; share it behind an `Arc` between request handlers.
pub struct Relay {
    config: RelayConfig,
    cache: Arc<ResponseCache>,
    dedup: RequestDeduplicator<String, UpstreamFailure>,
    pool: Arc<ConnectionPool>,
    metrics: Mutex<RelayMetrics>,
    closed: AtomicBool,
}

impl Relay {
    /// Validates `config` and connects the cache to its backing store.
    pub async fn init(config: RelayConfig) -> Result<Self, RelayError> {
        config.validate()?;
        let cache = ResponseCache::connect(config.cache.clone()).await;
        Self::with_cache(config, cache)
    }

    /// Builds a relay around an already constructed cache.
    pub fn with_cache(config: RelayConfig, cache: ResponseCache) -> Result<Self, RelayError> {
        config.validate()?;

        let pool = Arc::new(ConnectionPool::new(config.pool.clone()));
        let dedup = RequestDeduplicator::new(config.dedup.clone());

        tracing::info!(
            upstream = %config.upstream.base_url,
            cache_available = cache.is_available(),
            max_connections = config.pool.max_connections,
            max_pending = config.dedup.max_pending,
            "Relay initialized"
        );

        Ok(Self {
            config,
            cache: Arc::new(cache),
            dedup,
            pool,
            metrics: Mutex::new(RelayMetrics::default()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn dedup(&self) -> &RequestDeduplicator<String, UpstreamFailure> {
        &self.dedup
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    fn record(&self, update: impl FnOnce(&mut RelayMetrics)) {
        let mut metrics = self.metrics.lock().unwrap_or_else(PoisonError::into_inner);
        update(&mut *metrics);
    }

    fn respond(&self, content: String, model: &str, source: ResponseSource, similarity: Option<f64>, start: Instant) -> GenerationResponse {
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        self.record(|m| m.record_response_time(elapsed_ms));
        GenerationResponse {
            content,
            model: model.to_string(),
            source,
            similarity,
            elapsed_ms,
        }
    }

    pub async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse, RelayError> {
        let start = Instant::now();
        self.record(RelayMetrics::record_request);

        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.config.upstream.default_model.clone());

        if !request.skip_cache {
            if let Some(content) = self.cache.get(&request.prompt, &model).await {
                self.record(RelayMetrics::record_cache_hit);
                return Ok(self.respond(content, &model, ResponseSource::Cache, None, start));
            }

            if self.config.cache.serve_similar {
                let best = self.cache.get_similar(&request.prompt, &model, 1).await.into_iter().next();
                if let Some(best) = best {
                    self.record(RelayMetrics::record_similar_hit);
                    tracing::debug!(
                        prompt = %fingerprint::preview(&request.prompt),
                        similarity = best.similarity,
                        "Serving similar cached response"
                    );
                    return Ok(self.respond(best.response, &model, ResponseSource::Similar, Some(best.similarity), start));
                }
            }

            self.record(RelayMetrics::record_cache_miss);
        }

        let work = self.upstream_work(request, &model);
        match self
            .dedup
            .execute_or_join(&request.prompt, &model, &request.params, work)
            .await
        {
            Ok(coalesced) => {
                self.record(|m| m.record_upstream(coalesced.joined));
                let source = if coalesced.joined {
                    ResponseSource::Joined
                } else {
                    ResponseSource::Upstream
                };
                Ok(self.respond(coalesced.value, &model, source, None, start))
            }
            Err(e) => {
                self.record(RelayMetrics::record_error);
                let error = RelayError::from(e);
                crate::logging::log_error(&error, "generate");
                Err(error)
            }
        }
    }

    /// The upstream call a leader runs: POST a chat completion, extract its
    /// text and cache it. The write happens before the pending entry is
    /// released, so later callers find the result in the cache.
    fn upstream_work(
        &self,
        request: &GenerationRequest,
        model: &str,
    ) -> impl Fn() -> UpstreamFuture {
        let upstream = &self.config.upstream;
        let body = chat_body(
            &request.prompt,
            model,
            &request.params,
            request.system_prompt.as_deref().or(upstream.system_prompt.as_deref()),
        );

        let mut options = RequestOptions::default().json(body);
        if let Some(key) = &upstream.api_key {
            options = options.bearer(key.clone());
        }

        let pool = Arc::clone(&self.pool);
        let cache = Arc::clone(&self.cache);
        let url = upstream.completions_url();
        let pointer = upstream.response_pointer.clone();
        let prompt = request.prompt.clone();
        let model = model.to_string();

        move || {
            let pool = Arc::clone(&pool);
            let cache = Arc::clone(&cache);
            let url = url.clone();
            let options = options.clone();
            let pointer = pointer.clone();
            let prompt = prompt.clone();
            let model = model.clone();
            let call: UpstreamFuture = Box::pin(async move {
                let data = pool.execute(Method::POST, &url, options).await.into_result()?;
                let content = extract_content(&data, &pointer)?;
                cache.set(&prompt, &content, &model, None).await;
                Ok(content)
            });
            call
        }
    }

    pub async fn stats(&self) -> RelayStats {
        RelayStats {
            relay: self.metrics.lock().unwrap_or_else(PoisonError::into_inner).clone(),
            cache: self.cache.stats().await,
            dedup: self.dedup.stats(),
            pool: self.pool.stats(),
        }
    }

    /// Stops background work, cancels pending requests and releases
    /// connections. Later calls do nothing.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.dedup.shutdown().await;
        self.pool.close();
        self.cache.close();
        tracing::info!("Relay shut down");
    }
}

/// OpenAI-style chat completion body.
pub fn chat_body(prompt: &str, model: &str, params: &GenerationParams, system_prompt: Option<&str>) -> Value {
    let mut messages = Vec::new();
    if let Some(system) = system_prompt {
        messages.push(json!({"role": "system", "content": system}));
    }
    messages.push(json!({"role": "user", "content": prompt}));

    let mut body = json!({
        "model": model,
        "messages": messages,
        "max_tokens": params.max_tokens,
        "temperature": params.temperature,
    });
    for (name, value) in &params.extra {
        body[name.as_str()] = value.clone();
    }
    body
}

fn extract_content(data: &Value, pointer: &str) -> Result<String, UpstreamFailure> {
    match data.pointer(pointer) {
        Some(Value::String(content)) => Ok(content.clone()),
        Some(other) => Ok(other.to_string()),
        None => Err(UpstreamFailure::unexpected(format!(
            "Upstream response has no content at '{}'",
            pointer
        ))),
    }
}
