//! Exactly-once processing for non-safe HTTP requests.
//!
//! Clients attach an idempotency key to create/update/delete requests;
//! replays of the same key return the first-computed response instead of
//! re-executing the handler, and reuse of a key with a different payload is
//! rejected. The middleware serializes concurrent requests sharing a key
//! through a named lock, so a fresh key executes its handler exactly once.
//!
//! ```no_run
//! use axum::{middleware, routing::post, Router};
//! use idempotency_guard::{idempotency_middleware, IdempotencyContext, Settings};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let ctx = IdempotencyContext::new(Settings::default())?;
//! let app: Router = Router::new()
//!     .route("/orders", post(|| async { "created" }))
//!     .layer(middleware::from_fn_with_state(ctx, idempotency_middleware));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod fingerprint;
pub mod lock;
pub mod store;

pub use config::{LockBackend, LockSettings, Settings, StorageBackend, StorageSettings};
pub use coordinator::{
    bad_response, idempotency_middleware, BadResponseFn, IdempotencyContext,
    IdempotencyContextBuilder, IdempotencyMetrics, MetricsSnapshot, KEY_REUSE_MESSAGE,
    MISSING_KEY_MESSAGE,
};
pub use error::{IdempotencyError, Result};
pub use fingerprint::{
    default_cache_key_fn, derive_cache_key, derive_content_hash, CacheKeyFn, CallerIdentity,
};
pub use lock::{LocalLocker, LockGuard, Locker, RedisLocker};
pub use store::{CachedEntry, MemoryStore, RedisStore, ResponseStore, StoredResponse};
