//! Canonical request fingerprints.
//!
//! A request is identified by its normalized prompt, its model and the
//! generation parameters that influence the output. Three digests are
//! derived from it:
//!
//! * the **dedup key**, covering prompt, model and parameters, used to
//!   coalesce in-flight work;
//! * the **exact cache key** (`ai_response:<digest>`), covering prompt and model;
//! * the **similarity key** (`ai_similarity:<digest>`), hashed in its own
//!   domain so the two cache namespaces never collide.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};

pub const RESPONSE_NAMESPACE: &str = "ai_response";
pub const SIMILARITY_NAMESPACE: &str = "ai_similarity";

const PREVIEW_CHARS: usize = 50;

/// Generation parameters that change what the upstream produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub temperature: f64,
    /// Any further output-affecting options (top_p, stop sequences, ...).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 1000,
            temperature: 0.7,
            extra: BTreeMap::new(),
        }
    }
}

impl GenerationParams {
    pub fn new(max_tokens: u32, temperature: f64) -> Self {
        Self {
            max_tokens,
            temperature,
            extra: BTreeMap::new(),
        }
    }

    pub fn with_extra(mut self, name: impl Into<String>, value: Value) -> Self {
        self.extra.insert(name.into(), value);
        self
    }
}

/// Digests identifying one semantic request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub dedup_key: String,
    pub cache_key: String,
    pub similarity_key: String,
}

impl Fingerprint {
    pub fn new(prompt: &str, model: &str, params: &GenerationParams) -> Self {
        let normalized = normalize_prompt(prompt);
        Self {
            dedup_key: dedup_key(&normalized, model, params),
            cache_key: cache_key(prompt, model),
            similarity_key: similarity_key(prompt, model),
        }
    }

    /// Key prefix safe to expose in logs and operational listings.
    pub fn short(&self) -> String {
        short_key(&self.dedup_key)
    }
}

pub fn normalize_prompt(prompt: &str) -> String {
    prompt.trim().to_lowercase()
}

/// Exact-match cache key for a prompt/model pair.
pub fn cache_key(prompt: &str, model: &str) -> String {
    let content = format!("{}:{}", normalize_prompt(prompt), model);
    format!("{}:{}", RESPONSE_NAMESPACE, hex_digest(content.as_bytes()))
}

/// Similarity-index key for a prompt/model pair.
pub fn similarity_key(prompt: &str, model: &str) -> String {
    let content = format!("similarity:{}:{}", normalize_prompt(prompt), model);
    format!("{}:{}", SIMILARITY_NAMESPACE, hex_digest(content.as_bytes()))
}

fn dedup_key(normalized_prompt: &str, model: &str, params: &GenerationParams) -> String {
    // BTreeMap keeps the serialized field order canonical.
    let mut fields: BTreeMap<&str, Value> = BTreeMap::new();
    fields.insert("prompt", Value::from(normalized_prompt));
    fields.insert("model", Value::from(model));
    fields.insert("max_tokens", Value::from(params.max_tokens));
    fields.insert("temperature", Value::from(params.temperature));
    // Extras live under their own key so they can never shadow a core field.
    if !params.extra.is_empty() {
        let extra = params
            .extra
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        fields.insert("extra", Value::Object(extra));
    }

    let canonical = serde_json::to_string(&fields).unwrap_or_default();
    hex_digest(canonical.as_bytes())
}

fn hex_digest(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

pub fn short_key(key: &str) -> String {
    match key.char_indices().nth(16) {
        Some((idx, _)) => format!("{}...", &key[..idx]),
        None => key.to_string(),
    }
}

/// Truncated prompt preview for logs and pending listings.
pub fn preview(text: &str) -> String {
    match text.char_indices().nth(PREVIEW_CHARS) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

fn word_set(text: &str) -> HashSet<String> {
    text.split_whitespace().map(|w| w.to_lowercase()).collect()
}

/// Jaccard similarity of the lower-cased whitespace word sets of `a` and `b`.
///
/// Returns 0.0 when both sides are empty.
pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let left = word_set(a);
    let right = word_set(b);

    let union = left.union(&right).count();
    if union == 0 {
        return 0.0;
    }
    let intersection = left.intersection(&right).count();
    intersection as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fingerprint_is_deterministic() {
        let params = GenerationParams::default();
        let a = Fingerprint::new("Explain DNS caching", "gpt-4", &params);
        let b = Fingerprint::new("Explain DNS caching", "gpt-4", &params);
        assert_eq!(a, b);
    }

    #[test]
    fn test_prompt_normalization_is_applied() {
        let params = GenerationParams::default();
        let a = Fingerprint::new("  Explain DNS caching\n", "gpt-4", &params);
        let b = Fingerprint::new("explain dns caching", "gpt-4", &params);
        assert_eq!(a, b);
    }

    #[test]
    fn test_any_differing_field_changes_dedup_key() {
        let base = GenerationParams::default();
        let key = Fingerprint::new("prompt", "gpt-4", &base).dedup_key;

        assert_ne!(key, Fingerprint::new("other prompt", "gpt-4", &base).dedup_key);
        assert_ne!(key, Fingerprint::new("prompt", "gpt-3.5-turbo", &base).dedup_key);
        assert_ne!(key, Fingerprint::new("prompt", "gpt-4", &GenerationParams::new(500, 0.7)).dedup_key);
        assert_ne!(key, Fingerprint::new("prompt", "gpt-4", &GenerationParams::new(1000, 0.2)).dedup_key);
        assert_ne!(
            key,
            Fingerprint::new("prompt", "gpt-4", &base.clone().with_extra("top_p", json!(0.9))).dedup_key
        );
    }

    #[test]
    fn test_extras_cannot_shadow_core_fields() {
        let params = GenerationParams::default()
            .with_extra("prompt", json!("x"))
            .with_extra("model", json!("y"));

        let first = Fingerprint::new("first prompt", "gpt-4", &params).dedup_key;
        let second = Fingerprint::new("totally different prompt", "gpt-4", &params).dedup_key;
        assert_ne!(first, second);

        let other_model = Fingerprint::new("first prompt", "gpt-3.5-turbo", &params).dedup_key;
        assert_ne!(first, other_model);
    }

    #[test]
    fn test_extra_params_order_independent() {
        let a = GenerationParams::default()
            .with_extra("top_p", json!(0.9))
            .with_extra("stop", json!(["\n"]));
        let b = GenerationParams::default()
            .with_extra("stop", json!(["\n"]))
            .with_extra("top_p", json!(0.9));
        assert_eq!(
            Fingerprint::new("p", "m", &a).dedup_key,
            Fingerprint::new("p", "m", &b).dedup_key
        );
    }

    #[test]
    fn test_cache_keys_ignore_params_and_use_namespaces() {
        let a = Fingerprint::new("prompt", "gpt-4", &GenerationParams::new(10, 0.0));
        let b = Fingerprint::new("prompt", "gpt-4", &GenerationParams::new(20, 1.0));
        assert_eq!(a.cache_key, b.cache_key);
        assert_eq!(a.similarity_key, b.similarity_key);

        assert!(a.cache_key.starts_with("ai_response:"));
        assert!(a.similarity_key.starts_with("ai_similarity:"));
        assert_ne!(
            a.cache_key.trim_start_matches("ai_response:"),
            a.similarity_key.trim_start_matches("ai_similarity:")
        );
    }

    #[test]
    fn test_jaccard_similarity() {
        assert_eq!(jaccard_similarity("the quick fox", "fox quick the"), 1.0);
        assert_eq!(jaccard_similarity("alpha beta", "gamma delta"), 0.0);
        assert_eq!(jaccard_similarity("a b c", "a b d"), 0.5);
        assert_eq!(jaccard_similarity("", ""), 0.0);
        assert_eq!(jaccard_similarity("Hello World", "hello world"), 1.0);
    }

    #[test]
    fn test_preview_and_short_key() {
        assert_eq!(preview("short"), "short");
        let long = "x".repeat(80);
        assert_eq!(preview(&long), format!("{}...", "x".repeat(50)));

        let multibyte = "é".repeat(60);
        assert_eq!(preview(&multibyte).chars().count(), 53);

        assert_eq!(short_key("0123456789abcdef0123"), "0123456789abcdef...");
        assert_eq!(short_key("abc"), "abc");
    }
}
