#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::middleware::from_fn_with_state;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use idempotency_guard::{idempotency_middleware, IdempotencyContext};

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .try_init()
        .ok();
}

/// Counts handler invocations so tests can assert exactly-once execution.
#[derive(Clone, Default)]
pub struct HitCounter(pub Arc<AtomicU64>);

impl HitCounter {
    pub fn count(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

async fn create_order(State(hits): State<HitCounter>) -> impl IntoResponse {
    hits.0.fetch_add(1, Ordering::SeqCst);
    (
        StatusCode::CREATED,
        [("x-order-source", "primary")],
        Json(serde_json::json!({ "id": 42 })),
    )
}

async fn list_orders(State(hits): State<HitCounter>) -> impl IntoResponse {
    hits.0.fetch_add(1, Ordering::SeqCst);
    Json(serde_json::json!({ "orders": [] }))
}

/// Fails on the first invocation, succeeds afterwards.
async fn flaky_create_order(State(hits): State<HitCounter>) -> Response {
    let calls = hits.0.fetch_add(1, Ordering::SeqCst) + 1;
    if calls == 1 {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": "downstream unavailable" })),
        )
            .into_response()
    } else {
        (StatusCode::CREATED, Json(serde_json::json!({ "id": 42 }))).into_response()
    }
}

pub fn orders_app(ctx: IdempotencyContext, hits: HitCounter) -> Router {
    Router::new()
        .route("/orders", post(create_order).get(list_orders))
        .layer(from_fn_with_state(ctx, idempotency_middleware))
        .with_state(hits)
}

pub fn flaky_orders_app(ctx: IdempotencyContext, hits: HitCounter) -> Router {
    Router::new()
        .route("/orders", post(flaky_create_order))
        .layer(from_fn_with_state(ctx, idempotency_middleware))
        .with_state(hits)
}
