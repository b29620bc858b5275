use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::config::{LockBackend, Settings, StorageBackend};
use crate::error::Result;
use crate::fingerprint::{self, CacheKeyFn, CallerIdentity};
use crate::lock::{LocalLocker, Locker, RedisLocker};
use crate::store::{CachedEntry, MemoryStore, RedisStore, ResponseStore, StoredResponse};

pub const MISSING_KEY_MESSAGE: &str =
    "Idempotency key is missing. Generate a unique key and specify it in the header";
pub const KEY_REUSE_MESSAGE: &str =
    "You've already used this idempotency key. Please, repeat the request with another idempotency key.";

/// Pluggable builder for missing-key and key-reuse rejections.
pub type BadResponseFn = Arc<dyn Fn(&str, StatusCode) -> Response + Send + Sync>;

/// Default rejection shape: `{"error": "<message>"}` with the configured
/// status code.
pub fn bad_response(message: &str, status: StatusCode) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

/// Counters for idempotency handling.
#[derive(Debug, Default)]
pub struct IdempotencyMetrics {
    pub total_requests: AtomicU64,
    pub passthrough_requests: AtomicU64,
    pub missing_key_rejections: AtomicU64,
    pub replayed_responses: AtomicU64,
    pub conflict_rejections: AtomicU64,
    pub executed_requests: AtomicU64,
    pub stored_responses: AtomicU64,
}

impl IdempotencyMetrics {
    fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    fn record_passthrough(&self) {
        self.passthrough_requests.fetch_add(1, Ordering::Relaxed);
    }

    fn record_missing_key(&self) {
        self.missing_key_rejections.fetch_add(1, Ordering::Relaxed);
    }

    fn record_replayed(&self) {
        self.replayed_responses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_conflict(&self) {
        self.conflict_rejections.fetch_add(1, Ordering::Relaxed);
    }

    fn record_executed(&self) {
        self.executed_requests.fetch_add(1, Ordering::Relaxed);
    }

    fn record_stored(&self) {
        self.stored_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            passthrough_requests: self.passthrough_requests.load(Ordering::Relaxed),
            missing_key_rejections: self.missing_key_rejections.load(Ordering::Relaxed),
            replayed_responses: self.replayed_responses.load(Ordering::Relaxed),
            conflict_rejections: self.conflict_rejections.load(Ordering::Relaxed),
            executed_requests: self.executed_requests.load(Ordering::Relaxed),
            stored_responses: self.stored_responses.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub passthrough_requests: u64,
    pub missing_key_rejections: u64,
    pub replayed_responses: u64,
    pub conflict_rejections: u64,
    pub executed_requests: u64,
    pub stored_responses: u64,
}

struct ContextInner {
    settings: Settings,
    bad_response_status: StatusCode,
    store: Arc<dyn ResponseStore>,
    locker: Arc<dyn Locker>,
    cache_key_fn: CacheKeyFn,
    bad_response_fn: BadResponseFn,
    metrics: IdempotencyMetrics,
}

/// Shared state of the idempotency middleware: settings plus the store, the
/// locker, and the pluggable derivation and rejection functions.
#[derive(Clone)]
pub struct IdempotencyContext {
    inner: Arc<ContextInner>,
}

impl IdempotencyContext {
    /// Builds a context with backends selected by the settings.
    pub fn new(settings: Settings) -> Result<Self> {
        Self::builder(settings).build()
    }

    pub fn builder(settings: Settings) -> IdempotencyContextBuilder {
        IdempotencyContextBuilder {
            settings,
            store: None,
            locker: None,
            cache_key_fn: None,
            bad_response_fn: None,
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Runs the full decision protocol for one request.
    async fn handle(&self, req: Request, next: Next) -> Result<Response> {
        let inner = &self.inner;
        inner.metrics.record_request();

        // Read-only methods bypass all key logic.
        if inner.settings.is_safe_method(req.method().as_str()) {
            inner.metrics.record_passthrough();
            return Ok(next.run(req).await);
        }

        let idempotency_key = req
            .headers()
            .get(&inner.settings.header)
            .and_then(|v| v.to_str().ok())
            .filter(|key| !key.is_empty())
            .map(str::to_owned);
        let Some(idempotency_key) = idempotency_key else {
            inner.metrics.record_missing_key();
            return Ok((inner.bad_response_fn)(
                MISSING_KEY_MESSAGE,
                inner.bad_response_status,
            ));
        };

        let caller = req
            .extensions()
            .get::<CallerIdentity>()
            .cloned()
            .unwrap_or_default();
        let cache_key = (inner.cache_key_fn)(
            &idempotency_key,
            req.uri().path(),
            req.method().as_str(),
            &caller.0,
        );

        // Hash the raw payload before the handler can touch it.
        let (parts, body) = req.into_parts();
        let body_bytes = to_bytes(body, usize::MAX).await?;
        let content_hash = fingerprint::derive_content_hash(&body_bytes);
        let req = Request::from_parts(parts, Body::from(body_bytes));

        // The critical section spans lookup through write; without it two
        // concurrent requests with a fresh key would both miss and both
        // execute. The guard releases on every path out, handler panics
        // included.
        let _guard = inner
            .locker
            .acquire(&format!("idempotency_{cache_key}"))
            .await?;

        if let Some(entry) = inner.store.get(&cache_key).await? {
            if entry.content_hash == content_hash {
                inner.metrics.record_replayed();
                tracing::debug!(cache_key = %cache_key, "replaying stored response");
                return Ok(restore_response(entry.response));
            }
            inner.metrics.record_conflict();
            tracing::warn!(
                cache_key = %cache_key,
                "idempotency key reused with a different request body"
            );
            return Ok((inner.bad_response_fn)(
                KEY_REUSE_MESSAGE,
                inner.bad_response_status,
            ));
        }

        inner.metrics.record_executed();
        let response = next.run(req).await;

        // Only successful outcomes are persisted; a failed handler can be
        // retried with the same key.
        if !response.status().is_success() {
            return Ok(response);
        }

        let (parts, body) = response.into_parts();
        let body_bytes = to_bytes(body, usize::MAX).await?;
        let entry = CachedEntry {
            content_hash,
            response: StoredResponse::capture(parts.status, &parts.headers, &body_bytes),
        };
        inner
            .store
            .set(&cache_key, entry, inner.settings.storage_ttl())
            .await?;
        inner.metrics.record_stored();
        tracing::debug!(cache_key = %cache_key, "stored response for replay");

        Ok(Response::from_parts(parts, Body::from(body_bytes)))
    }
}

pub struct IdempotencyContextBuilder {
    settings: Settings,
    store: Option<Arc<dyn ResponseStore>>,
    locker: Option<Arc<dyn Locker>>,
    cache_key_fn: Option<CacheKeyFn>,
    bad_response_fn: Option<BadResponseFn>,
}

impl IdempotencyContextBuilder {
    /// Overrides the store selected by the settings.
    pub fn with_store(mut self, store: Arc<dyn ResponseStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Overrides the locker selected by the settings.
    pub fn with_locker(mut self, locker: Arc<dyn Locker>) -> Self {
        self.locker = Some(locker);
        self
    }

    pub fn with_cache_key_fn(mut self, f: CacheKeyFn) -> Self {
        self.cache_key_fn = Some(f);
        self
    }

    pub fn with_bad_response_fn(mut self, f: BadResponseFn) -> Self {
        self.bad_response_fn = Some(f);
        self
    }

    pub fn build(self) -> Result<IdempotencyContext> {
        let settings = self.settings;
        let bad_response_status = StatusCode::from_u16(settings.bad_response_status)
            .map_err(|e| anyhow::anyhow!("invalid bad_response_status: {}", e))?;

        let store = match self.store {
            Some(store) => store,
            None => match settings.storage.backend {
                StorageBackend::Memory => Arc::new(MemoryStore::new()) as Arc<dyn ResponseStore>,
                StorageBackend::Redis => Arc::new(RedisStore::new(
                    redis::Client::open(settings.storage.url.as_str())?,
                    "idempotency",
                )),
            },
        };

        let locker = match self.locker {
            Some(locker) => locker,
            None => match settings.lock.backend {
                LockBackend::Local => Arc::new(LocalLocker::new()) as Arc<dyn Locker>,
                LockBackend::Redis => Arc::new(RedisLocker::new(
                    redis::Client::open(settings.lock.url.as_str())?,
                    settings.lock_ttl(),
                )),
            },
        };

        Ok(IdempotencyContext {
            inner: Arc::new(ContextInner {
                bad_response_status,
                store,
                locker,
                cache_key_fn: self
                    .cache_key_fn
                    .unwrap_or_else(fingerprint::default_cache_key_fn),
                bad_response_fn: self.bad_response_fn.unwrap_or_else(|| Arc::new(bad_response)),
                metrics: IdempotencyMetrics::default(),
                settings,
            }),
        })
    }
}

/// The wrapping operation. Apply to a router with
/// `axum::middleware::from_fn_with_state(ctx, idempotency_middleware)`; the
/// wrapped routes keep their external signature.
pub async fn idempotency_middleware(
    State(ctx): State<IdempotencyContext>,
    req: Request,
    next: Next,
) -> Response {
    match ctx.handle(req, next).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

fn restore_response(stored: StoredResponse) -> Response {
    let mut response = Response::new(Body::from(stored.body));
    *response.status_mut() = stored.status;
    *response.headers_mut() = stored.headers;
    response
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::http::HeaderMap;
    use axum::middleware::from_fn_with_state;
    use axum::routing::post;
    use axum::Router;
    use mockall::mock;
    use tower::ServiceExt;

    use super::*;
    use crate::error::IdempotencyError;

    mock! {
        pub Store {}

        #[async_trait::async_trait]
        impl ResponseStore for Store {
            async fn get(&self, cache_key: &str) -> Result<Option<CachedEntry>>;
            async fn set(&self, cache_key: &str, entry: CachedEntry, ttl: Duration) -> Result<()>;
        }
    }

    fn router_with(ctx: IdempotencyContext) -> Router {
        Router::new()
            .route("/orders", post(|| async { (StatusCode::CREATED, "ok") }))
            .layer(from_fn_with_state(ctx, idempotency_middleware))
    }

    fn post_request() -> Request {
        Request::builder()
            .method("POST")
            .uri("/orders")
            .header("Idempotency-Key", "abc123")
            .body(Body::from(r#"{"item":"x"}"#))
            .unwrap()
    }

    #[tokio::test]
    async fn store_failure_surfaces_as_internal_error() {
        let mut store = MockStore::new();
        store
            .expect_get()
            .returning(|_| Err(IdempotencyError::Internal(anyhow::anyhow!("store down"))));

        let ctx = IdempotencyContext::builder(Settings::default())
            .with_store(Arc::new(store))
            .build()
            .unwrap();

        let response = router_with(ctx).oneshot(post_request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn first_execution_writes_hash_and_response_together() {
        let mut store = MockStore::new();
        store.expect_get().returning(|_| Ok(None));
        store
            .expect_set()
            .withf(|_, entry, ttl| {
                entry.content_hash == fingerprint::derive_content_hash(br#"{"item":"x"}"#)
                    && entry.response.status == StatusCode::CREATED
                    && *ttl == Duration::from_secs(600)
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let ctx = IdempotencyContext::builder(Settings::default())
            .with_store(Arc::new(store))
            .build()
            .unwrap();

        let response = router_with(ctx).oneshot(post_request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn replay_uses_the_stored_response_without_touching_set() {
        let stored = CachedEntry {
            content_hash: fingerprint::derive_content_hash(br#"{"item":"x"}"#),
            response: StoredResponse::capture(StatusCode::CREATED, &HeaderMap::new(), b"cached"),
        };
        let mut store = MockStore::new();
        let entry = stored.clone();
        store
            .expect_get()
            .withf(|key| key == derived_key())
            .returning(move |_| Ok(Some(entry.clone())));
        store.expect_set().times(0);

        let ctx = IdempotencyContext::builder(Settings::default())
            .with_store(Arc::new(store))
            .build()
            .unwrap();

        let response = router_with(ctx.clone()).oneshot(post_request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"cached");
        assert_eq!(ctx.metrics().replayed_responses, 1);
    }

    #[tokio::test]
    async fn custom_bad_response_builder_is_used() {
        let ctx = IdempotencyContext::builder(Settings::default())
            .with_bad_response_fn(Arc::new(|message: &str, status: StatusCode| {
                (status, format!("rejected: {message}")).into_response()
            }))
            .build()
            .unwrap();

        let request = Request::builder()
            .method("POST")
            .uri("/orders")
            .body(Body::empty())
            .unwrap();
        let response = router_with(ctx).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&body).starts_with("rejected:"));
    }

    #[tokio::test]
    async fn configured_status_applies_to_rejections() {
        let settings = Settings {
            bad_response_status: 422,
            ..Settings::default()
        };
        let ctx = IdempotencyContext::new(settings).unwrap();

        let request = Request::builder()
            .method("POST")
            .uri("/orders")
            .body(Body::empty())
            .unwrap();
        let response = router_with(ctx).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn invalid_status_is_rejected_at_build_time() {
        let settings = Settings {
            bad_response_status: 99,
            ..Settings::default()
        };
        assert!(IdempotencyContext::new(settings).is_err());
    }

    fn derived_key() -> String {
        fingerprint::derive_cache_key("abc123", "/orders", "POST", "")
    }
}
