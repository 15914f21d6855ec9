//! Bounded, reusable outbound connections to the generation upstream.
//!
//! [`ConnectionPool::execute`] never returns an error: every outcome, including
//! timeouts and transport failures, is folded into a [`PoolResponse`] so the
//! caller can branch on it directly.

use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::{Client, Method, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::error::{FailureKind, UpstreamFailure};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Upper bound on concurrently open upstream requests.
    pub max_connections: usize,
    pub max_per_host: usize,
    #[serde(with = "humantime_serde")]
    pub dns_cache_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub keep_alive: Duration,
    /// Close idle connections once they have been unused for `keep_alive`.
    pub cleanup_idle: bool,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub slow_request_threshold: Duration,
    pub user_agent: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            max_per_host: 10,
            dns_cache_ttl: Duration::from_secs(300),
            keep_alive: Duration::from_secs(30),
            cleanup_idle: true,
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            slow_request_threshold: Duration::from_secs(5),
            user_agent: format!("llm-relay/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Per-request knobs layered over the pool defaults.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub json: Option<Value>,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub bearer_token: Option<String>,
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn json(mut self, body: Value) -> Self {
        self.json = Some(body);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone)]
pub struct PoolResponse {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<UpstreamFailure>,
    pub status_code: u16,
    pub elapsed: Duration,
    pub headers: HashMap<String, String>,
}

impl PoolResponse {
    fn failed(failure: UpstreamFailure, elapsed: Duration, headers: HashMap<String, String>) -> Self {
        Self {
            success: false,
            data: None,
            status_code: failure.status_code,
            error: Some(failure),
            elapsed,
            headers,
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.error.as_ref().map(|failure| failure.kind)
    }

    pub fn into_result(self) -> Result<Value, UpstreamFailure> {
        match (self.data, self.error) {
            (Some(data), None) => Ok(data),
            (_, Some(failure)) => Err(failure),
            (None, None) => Err(UpstreamFailure::unexpected("Empty response")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    pub requests_made: u64,
    pub connection_reuses: u64,
    pub connection_creates: u64,
    /// Requests that had to wait for a free connection slot.
    pub slot_waits: u64,
    pub total_response_time_ms: f64,
    pub average_response_time_ms: f64,
    pub reuse_ratio: f64,
    pub max_connections: usize,
    pub available_slots: usize,
    pub initialized: bool,
}

#[derive(Debug, Default)]
struct PoolCounters {
    requests_made: AtomicU64,
    connection_reuses: AtomicU64,
    connection_creates: AtomicU64,
    slot_waits: AtomicU64,
    total_response_time_us: AtomicU64,
}

impl PoolCounters {
    fn reset(&self) {
        self.requests_made.store(0, Ordering::Relaxed);
        self.connection_reuses.store(0, Ordering::Relaxed);
        self.connection_creates.store(0, Ordering::Relaxed);
        self.slot_waits.store(0, Ordering::Relaxed);
        self.total_response_time_us.store(0, Ordering::Relaxed);
    }
}

pub struct ConnectionPool {
    config: PoolConfig,
    client: Mutex<Option<Client>>,
    slots: Arc<Semaphore>,
    host_slots: Mutex<HashMap<String, Arc<Semaphore>>>,
    resolver: Arc<CachingResolver>,
    counters: PoolCounters,
}

impl ConnectionPool {
    /// Creates the pool. The HTTP client itself is built lazily on first use.
    pub fn new(config: PoolConfig) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_connections.max(1)));
        let resolver = Arc::new(CachingResolver::new(config.dns_cache_ttl));

        Self {
            config,
            client: Mutex::new(None),
            slots,
            host_slots: Mutex::new(HashMap::new()),
            resolver,
            counters: PoolCounters::default(),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn build_client(&self) -> reqwest::Result<Client> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let idle_timeout = self.config.cleanup_idle.then_some(self.config.keep_alive);

        Client::builder()
            .user_agent(self.config.user_agent.clone())
            .default_headers(headers)
            .pool_max_idle_per_host(self.config.max_per_host)
            .pool_idle_timeout(idle_timeout)
            .tcp_keepalive(self.config.keep_alive)
            .connect_timeout(self.config.connect_timeout)
            .timeout(self.config.request_timeout)
            .dns_resolver(Arc::clone(&self.resolver))
            .build()
    }

    /// Returns the shared client, building it if the pool is fresh or closed.
    fn session(&self) -> Result<Client, UpstreamFailure> {
        let mut guard = self.client.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(client) = guard.as_ref() {
            self.counters.connection_reuses.fetch_add(1, Ordering::Relaxed);
            return Ok(client.clone());
        }

        let client = self
            .build_client()
            .map_err(|e| UpstreamFailure::unexpected(format!("Failed to build HTTP client: {}", e)))?;
        self.counters.connection_creates.fetch_add(1, Ordering::Relaxed);
        *guard = Some(client.clone());

        info!(
            max_connections = self.config.max_connections,
            max_per_host = self.config.max_per_host,
            "Connection pool initialized"
        );
        Ok(client)
    }

    fn host_semaphore(&self, host: &str) -> Arc<Semaphore> {
        let mut slots = self.host_slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            slots
                .entry(host.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.config.max_per_host.max(1)))),
        )
    }

    async fn acquire_slots(&self, host: &str) -> Result<(OwnedSemaphorePermit, OwnedSemaphorePermit), UpstreamFailure> {
        if self.slots.available_permits() == 0 {
            self.counters.slot_waits.fetch_add(1, Ordering::Relaxed);
            debug!(host = host, "Waiting for a free connection slot");
        }

        // Host slot first, then the global slot; every caller uses this order.
        let host_permit = self
            .host_semaphore(host)
            .acquire_owned()
            .await
            .map_err(|_| UpstreamFailure::unexpected("Connection slots closed"))?;
        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| UpstreamFailure::unexpected("Connection slots closed"))?;

        Ok((host_permit, permit))
    }

    /// Executes one upstream request under the pool's concurrency bounds.
    pub async fn execute(&self, method: Method, target: &str, options: RequestOptions) -> PoolResponse {
        let start = Instant::now();
        self.counters.requests_made.fetch_add(1, Ordering::Relaxed);

        let response = self.execute_inner(method, target, options, start).await;

        self.counters
            .total_response_time_us
            .fetch_add(response.elapsed.as_micros() as u64, Ordering::Relaxed);

        if response.elapsed > self.config.slow_request_threshold {
            warn!(
                target_url = target,
                elapsed_ms = response.elapsed.as_millis() as u64,
                "Slow request detected"
            );
        }

        crate::logging::log_upstream_event(
            target,
            response.status_code,
            response.elapsed.as_secs_f64() * 1000.0,
            response.failure_kind(),
        );

        response
    }

    async fn execute_inner(
        &self,
        method: Method,
        target: &str,
        options: RequestOptions,
        start: Instant,
    ) -> PoolResponse {
        let url = match Url::parse(target) {
            Ok(url) => url,
            Err(e) => {
                return PoolResponse::failed(
                    UpstreamFailure::unexpected(format!("Invalid target '{}': {}", target, e)),
                    start.elapsed(),
                    HashMap::new(),
                )
            }
        };
        let host = url.host_str().unwrap_or_default().to_string();

        let _permits = match self.acquire_slots(&host).await {
            Ok(permits) => permits,
            Err(failure) => return PoolResponse::failed(failure, start.elapsed(), HashMap::new()),
        };

        let client = match self.session() {
            Ok(client) => client,
            Err(failure) => return PoolResponse::failed(failure, start.elapsed(), HashMap::new()),
        };

        let deadline = options.timeout.unwrap_or(self.config.request_timeout);
        let mut request = client.request(method, url).timeout(deadline);
        for (name, value) in &options.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if !options.query.is_empty() {
            request = request.query(&options.query);
        }
        if let Some(token) = &options.bearer_token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = &options.json {
            request = request.json(body);
        }

        let exchange = async {
            let response = request.send().await?;
            let status = response.status();
            let headers = collect_headers(response.headers());
            let body = response.text().await?;
            Ok::<_, reqwest::Error>((status, headers, body))
        };

        match tokio::time::timeout(deadline, exchange).await {
            Err(_) => PoolResponse::failed(UpstreamFailure::timeout(), start.elapsed(), HashMap::new()),
            Ok(Err(e)) => PoolResponse::failed(classify_error(&e), start.elapsed(), HashMap::new()),
            Ok(Ok((status, headers, body))) => {
                let elapsed = start.elapsed();
                if !status.is_success() {
                    let failure = UpstreamFailure::new(FailureKind::Upstream, status.as_u16(), body);
                    return PoolResponse::failed(failure, elapsed, headers);
                }

                match serde_json::from_str::<Value>(&body) {
                    Ok(data) => PoolResponse {
                        success: true,
                        data: Some(data),
                        error: None,
                        status_code: status.as_u16(),
                        elapsed,
                        headers,
                    },
                    Err(e) => PoolResponse::failed(
                        UpstreamFailure::unexpected(format!("Invalid JSON body: {}", e)),
                        elapsed,
                        headers,
                    ),
                }
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        let requests_made = self.counters.requests_made.load(Ordering::Relaxed);
        let connection_reuses = self.counters.connection_reuses.load(Ordering::Relaxed);
        let total_ms = self.counters.total_response_time_us.load(Ordering::Relaxed) as f64 / 1000.0;

        PoolStats {
            requests_made,
            connection_reuses,
            connection_creates: self.counters.connection_creates.load(Ordering::Relaxed),
            slot_waits: self.counters.slot_waits.load(Ordering::Relaxed),
            total_response_time_ms: total_ms,
            average_response_time_ms: if requests_made == 0 { 0.0 } else { total_ms / requests_made as f64 },
            reuse_ratio: connection_reuses as f64 / requests_made.max(1) as f64,
            max_connections: self.config.max_connections,
            available_slots: self.slots.available_permits(),
            initialized: self.is_initialized(),
        }
    }

    pub fn reset_stats(&self) {
        self.counters.reset();
    }

    pub fn is_initialized(&self) -> bool {
        self.client.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// Drops the client and its idle connections. The next request rebuilds it.
    pub fn close(&self) {
        let previous = self.client.lock().unwrap_or_else(PoisonError::into_inner).take();
        if previous.is_some() {
            self.resolver.clear();
            info!("Connection pool closed");
        }
    }
}

fn collect_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.to_string(), v.to_string())))
        .collect()
}

fn classify_error(error: &reqwest::Error) -> UpstreamFailure {
    if error.is_timeout() {
        UpstreamFailure::timeout()
    } else if error.is_builder() || error.is_decode() {
        UpstreamFailure::unexpected(error.to_string())
    } else {
        UpstreamFailure::transport(error.to_string())
    }
}

/// DNS resolver that remembers lookups for a fixed lifetime.
struct CachingResolver {
    ttl: Duration,
    entries: Arc<Mutex<HashMap<String, (Instant, Vec<SocketAddr>)>>>,
}

impl CachingResolver {
    fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn cached(entries: &Mutex<HashMap<String, (Instant, Vec<SocketAddr>)>>, host: &str, ttl: Duration) -> Option<Vec<SocketAddr>> {
        let mut entries = entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(host) {
            Some((resolved_at, addrs)) if resolved_at.elapsed() < ttl => Some(addrs.clone()),
            Some(_) => {
                entries.remove(host);
                None
            }
            None => None,
        }
    }

    async fn lookup(
        entries: Arc<Mutex<HashMap<String, (Instant, Vec<SocketAddr>)>>>,
        host: String,
        ttl: Duration,
    ) -> std::io::Result<Vec<SocketAddr>> {
        if let Some(addrs) = Self::cached(&entries, &host, ttl) {
            return Ok(addrs);
        }

        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), 0)).await?.collect();
        if !ttl.is_zero() {
            entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(host, (Instant::now(), addrs.clone()));
        }
        Ok(addrs)
    }

    fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn clear(&self) {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl Resolve for CachingResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let entries = Arc::clone(&self.entries);
        let host = name.as_str().to_string();
        let ttl = self.ttl;

        Box::pin(async move {
            let addrs = Self::lookup(entries, host, ttl).await?;
            Ok(Box::new(addrs.into_iter()) as Addrs)
        })
    }
}
