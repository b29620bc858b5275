use std::sync::Arc;

use sha2::{Digest, Sha256};

/// Caller identity attached as a request extension by the host's auth layer.
///
/// Requests without one fall back to the empty-string sentinel, so
/// unauthenticated callers sharing a key and route collide by design.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerIdentity(pub String);

impl CallerIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

/// Pluggable cache-key derivation. Arguments are, in order: the
/// client-supplied idempotency key, the route path, the request method, and
/// the caller identity.
pub type CacheKeyFn = Arc<dyn Fn(&str, &str, &str, &str) -> String + Send + Sync>;

/// Derives the cache key identifying a (key, route, method, caller) tuple.
///
/// SHA-256 over the four inputs concatenated in that fixed order, hex
/// encoded. Deterministic: identical inputs always map to the same key.
pub fn derive_cache_key(idempotency_key: &str, path: &str, method: &str, caller: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(idempotency_key.as_bytes());
    hasher.update(path.as_bytes());
    hasher.update(method.as_bytes());
    hasher.update(caller.as_bytes());
    hex::encode(hasher.finalize())
}

/// Hashes the raw request payload exactly as the client sent it, before any
/// parsing or handler-side mutation.
pub fn derive_content_hash(raw_body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw_body);
    hex::encode(hasher.finalize())
}

pub fn default_cache_key_fn() -> CacheKeyFn {
    Arc::new(|key: &str, path: &str, method: &str, caller: &str| {
        derive_cache_key(key, path, method, caller)
    })
}
