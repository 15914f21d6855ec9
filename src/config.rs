use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::cache::{CacheConfig, StoreBackend, MAX_TTL};
use crate::dedup::DedupConfig;
use crate::error::ConfigError;
use crate::pool::PoolConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub upstream: UpstreamConfig,
    pub pool: PoolConfig,
    pub cache: CacheConfig,
    pub dedup: DedupConfig,
    pub logging: LoggingConfig,
}

impl RelayConfig {
    /// Reads `path`, then layers environment overrides (`REDIS_URL`, `CACHE_TTL`, ...) on top.
    pub fn load<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates `path` alone, ignoring the environment.
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(&path)
            .map_err(|_| ConfigError::FileNotFound(path.as_ref().display().to_string()))?;

        let config: RelayConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for deployments without a config file.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = RelayConfig::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<std::path::Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Parse(e.to_string()))?;

        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("REDIS_URL") {
            self.cache.redis_url = url;
            self.cache.backend = StoreBackend::Redis;
        }
        if let Some(secs) = lookup("CACHE_TTL") {
            self.cache.default_ttl = Duration::from_secs(parse_env("CACHE_TTL", &secs)?);
        }
        if let Some(threshold) = lookup("SIMILARITY_THRESHOLD") {
            self.cache.similarity_threshold = parse_env("SIMILARITY_THRESHOLD", &threshold)?;
        }
        if let Some(max) = lookup("MAX_CONNECTIONS") {
            let max: usize = parse_env("MAX_CONNECTIONS", &max)?;
            self.pool.max_connections = max;
            self.pool.max_per_host = self.pool.max_per_host.min(max);
        }
        if let Some(secs) = lookup("REQUEST_TIMEOUT") {
            self.pool.request_timeout = Duration::from_secs(parse_env("REQUEST_TIMEOUT", &secs)?);
        }
        if let Some(secs) = lookup("PENDING_TIMEOUT") {
            self.dedup.pending_timeout = Duration::from_secs(parse_env("PENDING_TIMEOUT", &secs)?);
        }
        if let Some(max) = lookup("MAX_PENDING_REQUESTS") {
            self.dedup.max_pending = parse_env("MAX_PENDING_REQUESTS", &max)?;
        }
        if let Some(key) = lookup("OPENAI_API_KEY") {
            if !key.is_empty() {
                self.upstream.api_key = Some(key);
            }
        }
        if let Some(url) = lookup("UPSTREAM_URL") {
            self.upstream.base_url = url;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upstream.base_url.is_empty() {
            return Err(ConfigError::Validation("Upstream base_url cannot be empty".to_string()));
        }

        if !self.upstream.response_pointer.is_empty() && !self.upstream.response_pointer.starts_with('/') {
            return Err(ConfigError::Validation(format!(
                "Upstream response_pointer '{}' must start with '/'",
                self.upstream.response_pointer
            )));
        }

        // Validate pool config
        if self.pool.max_connections == 0 {
            return Err(ConfigError::Validation("Pool max_connections must be greater than 0".to_string()));
        }

        if self.pool.max_per_host == 0 || self.pool.max_per_host > self.pool.max_connections {
            return Err(ConfigError::Validation(format!(
                "Pool max_per_host must be between 1 and max_connections ({})",
                self.pool.max_connections
            )));
        }

        if self.pool.request_timeout.is_zero() {
            return Err(ConfigError::Validation("Pool request_timeout must be greater than 0".to_string()));
        }

        // Validate cache config
        if self.cache.default_ttl < Duration::from_secs(1) {
            return Err(ConfigError::Validation("Cache default_ttl must be at least 1s".to_string()));
        }

        if self.cache.default_ttl > MAX_TTL {
            return Err(ConfigError::Validation(format!(
                "Cache default_ttl must be at most {}s",
                MAX_TTL.as_secs()
            )));
        }

        if !(0.0..=1.0).contains(&self.cache.similarity_threshold) {
            return Err(ConfigError::Validation("Cache similarity_threshold must be between 0.0 and 1.0".to_string()));
        }

        if self.cache.similarity_sample == 0 {
            return Err(ConfigError::Validation("Cache similarity_sample must be greater than 0".to_string()));
        }

        if self.cache.backend == StoreBackend::Redis && self.cache.redis_url.is_empty() {
            return Err(ConfigError::Validation("Cache redis_url cannot be empty for the redis backend".to_string()));
        }

        // Validate dedup config
        if self.dedup.max_pending == 0 {
            return Err(ConfigError::Validation("Dedup max_pending must be greater than 0".to_string()));
        }

        if self.dedup.pending_timeout.is_zero() || self.dedup.janitor_interval.is_zero() {
            return Err(ConfigError::Validation(
                "Dedup pending_timeout and janitor_interval must be greater than 0".to_string(),
            ));
        }

        // Validate logging config
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::Validation(format!("Invalid logging level '{}'. Valid levels: {:?}", self.logging.level, valid_levels)));
        }

        let valid_formats = ["text", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(ConfigError::Validation(format!("Invalid logging format '{}'. Valid formats: {:?}", self.logging.format, valid_formats)));
        }

        let valid_outputs = ["stdout", "file", "both"];
        if !valid_outputs.contains(&self.logging.output.as_str()) {
            return Err(ConfigError::Validation(format!("Invalid logging output '{}'. Valid outputs: {:?}", self.logging.output, valid_outputs)));
        }

        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{} has an invalid value: '{}'", name, raw)))
}

/// The generation service sitting behind the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub completions_path: String,
    pub api_key: Option<String>,
    pub default_model: String,
    pub system_prompt: Option<String>,
    /// JSON pointer to the generated text inside a success body.
    pub response_pointer: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".to_string(),
            completions_path: "/v1/chat/completions".to_string(),
            api_key: None,
            default_model: "gpt-3.5-turbo".to_string(),
            system_prompt: None,
            response_pointer: "/choices/0/message/content".to_string(),
        }
    }
}

impl UpstreamConfig {
    pub fn completions_url(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.completions_path.trim_start_matches('/')
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub file_path: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            output: "stdout".to_string(),
            file_path: None,
        }
    }
}
