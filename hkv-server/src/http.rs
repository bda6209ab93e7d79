//! # HTTP Frontend
//!
//! Purpose: A JSON mirror of the RESP cache commands plus health/stats
//! endpoints, for clients that would rather speak HTTP than RESP.
//!
//! ## Design Principles
//! 1. **Same Store Semantics as RESP**: every handler routes through the
//!    same `Coordinator`/`Store` the RESP frontend uses; a key's owner never
//!    depends on which frontend asked.
//! 2. **308 Instead of MOVED**: a non-owner redirects with `Location`
//!    pointing at the owner's HTTP address rather than proxying, mirroring
//!    the RESP frontend's `MOVED` contract at the HTTP layer.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use hkv_common::{HkvError, Value};

use crate::node::Node;

#[derive(Serialize)]
struct ApiError {
    error: String,
}

impl IntoResponse for ApiErrorResponse {
    fn into_response(self) -> Response {
        (self.status, Json(ApiError { error: self.message })).into_response()
    }
}

struct ApiErrorResponse {
    status: StatusCode,
    message: String,
}

impl ApiErrorResponse {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        ApiErrorResponse { status, message: message.into() }
    }
}

#[derive(Deserialize)]
struct PutBody {
    value: String,
    #[serde(default)]
    ttl_hours: Option<f64>,
}

#[derive(Serialize)]
struct PutResponse {
    success: bool,
}

#[derive(Serialize)]
struct GetResponse {
    value: String,
    ttl_seconds: Option<u64>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    node_id: String,
    cluster_size: usize,
}

#[derive(Serialize)]
struct StatsResponse {
    store: Option<serde_json::Value>,
    persistence: serde_json::Value,
    ring: serde_json::Value,
    requests: serde_json::Value,
}

pub fn build_router(node: Arc<Node>) -> Router {
    Router::new()
        .route("/api/cache/:key", put(put_key).get(get_key).delete(delete_key))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(node)
}

/// Redirects to the owner's HTTP address when the local node isn't it,
/// returning `None` if the caller should proceed locally.
fn redirect_if_remote(node: &Node, key: &[u8]) -> Option<Response> {
    if node.coordinator.is_local(key) {
        return None;
    }
    let owner = node.coordinator.route(key)?;
    let addr = node.coordinator.http_addr_of(&owner)?;
    let location = format!("http://{}/api/cache/{}", addr, urlencode(key));
    Some(
        (
            StatusCode::PERMANENT_REDIRECT,
            [(header::LOCATION, location)],
        )
            .into_response(),
    )
}

fn urlencode(key: &[u8]) -> String {
    percent_encode(key)
}

fn percent_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(b as char),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

async fn put_key(State(node): State<Arc<Node>>, Path(key): Path<String>, Json(body): Json<PutBody>) -> Response {
    let key_bytes = key.as_bytes();
    if let Some(redirect) = redirect_if_remote(&node, key_bytes) {
        return redirect;
    }
    let Some(store) = node.coordinator.store(&node.primary_store) else {
        return ApiErrorResponse::new(StatusCode::INTERNAL_SERVER_ERROR, "no store configured").into_response();
    };
    let ttl = body.ttl_hours.map(|hours| Duration::from_secs_f64(hours * 3600.0));
    let value = Value::String(body.value);
    match store.set(key_bytes, value.clone(), "http", ttl) {
        Ok(()) => {
            node.coordinator.publish_set(&node.primary_store, key_bytes, &value, "http", ttl);
            (StatusCode::OK, Json(PutResponse { success: true })).into_response()
        }
        Err(err) => map_error(err).into_response(),
    }
}

async fn get_key(State(node): State<Arc<Node>>, Path(key): Path<String>) -> Response {
    let key_bytes = key.as_bytes();
    if let Some(redirect) = redirect_if_remote(&node, key_bytes) {
        return redirect;
    }
    let Some(store) = node.coordinator.store(&node.primary_store) else {
        return ApiErrorResponse::new(StatusCode::INTERNAL_SERVER_ERROR, "no store configured").into_response();
    };
    match store.get(key_bytes) {
        Ok(value) => {
            let ttl_seconds = match store.ttl(key_bytes) {
                Ok(hkv_engine::TtlStatus::ExpiresIn(d)) => Some(d.as_secs()),
                _ => None,
            };
            let body = GetResponse {
                value: String::from_utf8_lossy(&value.as_bulk_bytes()).into_owned(),
                ttl_seconds,
            };
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(HkvError::NotFound) | Err(HkvError::Expired) => {
            ApiErrorResponse::new(StatusCode::NOT_FOUND, "key not found").into_response()
        }
        Err(err) => map_error(err).into_response(),
    }
}

async fn delete_key(State(node): State<Arc<Node>>, Path(key): Path<String>) -> Response {
    let key_bytes = key.as_bytes();
    if let Some(redirect) = redirect_if_remote(&node, key_bytes) {
        return redirect;
    }
    let Some(store) = node.coordinator.store(&node.primary_store) else {
        return ApiErrorResponse::new(StatusCode::INTERNAL_SERVER_ERROR, "no store configured").into_response();
    };
    match store.delete(key_bytes) {
        Ok(()) => {
            node.coordinator.publish_del(&node.primary_store, key_bytes);
            (StatusCode::OK, Json(PutResponse { success: true })).into_response()
        }
        Err(HkvError::NotFound) => ApiErrorResponse::new(StatusCode::NOT_FOUND, "key not found").into_response(),
        Err(err) => map_error(err).into_response(),
    }
}

async fn health(State(node): State<Arc<Node>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        node_id: node.config.node.id.clone(),
        cluster_size: node.coordinator.members().len(),
    })
}

async fn stats(State(node): State<Arc<Node>>) -> Json<StatsResponse> {
    let store = node.coordinator.store(&node.primary_store).map(|store| {
        let s = store.stats();
        serde_json::json!({
            "name": node.primary_store,
            "hits": s.hits,
            "misses": s.misses,
            "evictions": s.evictions,
            "expirations": s.expirations,
            "errors": s.errors,
            "entry_count": s.entry_count,
            "current_bytes": s.current_bytes,
            "max_bytes": s.max_bytes,
        })
    });

    let persistence: Vec<serde_json::Value> = node
        .persistence_stats()
        .into_iter()
        .map(|(name, stats)| {
            serde_json::json!({
                "store": name,
                "entries_written": stats.entries_written,
                "bytes_written": stats.bytes_written,
                "snapshots_created": stats.snapshots_created,
            })
        })
        .collect();

    let ring = node.coordinator.ring().distribution_stats();
    let ring_json = serde_json::json!({
        "physical_nodes": ring.physical_nodes,
        "virtual_nodes": ring.virtual_nodes,
    });

    let metrics = node.metrics.snapshot();
    let requests_json = serde_json::json!({
        "total": metrics.requests_total,
        "errors": metrics.errors_total,
        "inflight": metrics.inflight,
        "latency_samples": metrics.latency.samples,
        "latency_sum_us": metrics.latency.sum_us,
    });

    Json(StatsResponse {
        store,
        persistence: serde_json::Value::Array(persistence),
        ring: ring_json,
        requests: requests_json,
    })
}

fn map_error(err: HkvError) -> ApiErrorResponse {
    match err {
        HkvError::NoSpace => ApiErrorResponse::new(StatusCode::INSUFFICIENT_STORAGE, "store out of space"),
        HkvError::InvalidArgument(msg) => ApiErrorResponse::new(StatusCode::BAD_REQUEST, msg),
        _ => ApiErrorResponse::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error"),
    }
}
