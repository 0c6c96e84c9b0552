//! HTTP surface: WebSocket handshake, admission middleware, and the small
//! control endpoints used by the build pipeline and for observability.
//!
//! The handshake path layers its checks cheapest-first: origin, then block
//! list and flood counter, then the token bucket, then the connection cap.
//! The first failing layer short-circuits the rest.

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocket;
use axum::extract::{ConnectInfo, Path, Request, State, WebSocketUpgrade};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::error::RelayError;
use crate::message::{unix_timestamp, ReloadMessage};
use crate::pump::run_connection;
use crate::sliding_window::SlidingWindowRateLimiter;
use crate::state::AppState;
use crate::token_bucket::RateLimitDecision;

/// Build the full router: the WebSocket endpoint plus rate-limited control
/// endpoints, with request tracing and permissive CORS for the dev origins.
pub fn router(state: AppState) -> Router {
    let limited = Router::new()
        .route("/broadcast", post(broadcast_handler))
        .route("/healthz", get(healthz_handler))
        .route("/blocked", get(blocked_handler))
        .route("/blocked/:key", delete(unblock_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ));

    Router::new()
        // The handshake runs the admission stack itself, so the endpoint is
        // not behind the middleware; a denied upgrade must not also burn a
        // token on the HTTP layer.
        .route("/ws", get(ws_handshake))
        .merge(limited)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Identify the client for rate-limiting purposes: first entry of
/// X-Forwarded-For when present, otherwise the peer address.
pub fn client_key(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    match peer {
        Some(addr) => addr.ip().to_string(),
        None => "unknown".to_string(),
    }
}

/// Admission middleware for the control endpoints: consults the abuse guard
/// (block list, flood counter, adaptive token bucket) and annotates allowed
/// responses with X-RateLimit-* headers.
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let key = client_key(request.headers(), peer);

    let decision = state.abuse_guard.check_request(&key);
    if !decision.allowed {
        debug!(key, "request denied by admission stack");
        return denied_response(&state, &key, &decision);
    }

    let mut response = next.run(request).await;
    apply_rate_headers(response.headers_mut(), &decision);
    response
}

/// WebSocket handshake: origin check, admission stack, connection slot,
/// then hand the upgraded socket to its pump pair.
///
/// The upgrade itself is validated last so a client denied by admission is
/// told why instead of getting a generic upgrade error.
async fn ws_handshake(
    State(state): State<AppState>,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, RelayError> {
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok())
        .ok_or(RelayError::OriginDenied)?;
    if !state.origin_guard.is_allowed(origin) {
        debug!(origin, "handshake rejected: origin not allowed");
        return Err(RelayError::OriginDenied);
    }

    let key = client_key(&headers, peer.map(|info| info.0));
    let decision = state.abuse_guard.check_request(&key);
    if !decision.allowed {
        debug!(key, "handshake rejected by admission stack");
        return Ok(denied_response(&state, &key, &decision));
    }

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return Ok(rejection.into_response()),
    };

    let (outbound_tx, outbound_rx) = mpsc::channel(state.config.outbound_queue_depth);
    let conn_id = state.hub.try_register(outbound_tx)?;
    info!(conn_id = %conn_id, key, "websocket admitted");

    let limiter = message_limiter(&state);
    let pump_config = state.pump_config();
    let hub = state.hub.clone();
    Ok(ws.on_upgrade(move |socket: WebSocket| {
        run_connection(socket, conn_id, outbound_rx, hub, limiter, pump_config)
    }))
}

/// Body accepted by POST /broadcast. The timestamp is stamped server-side.
#[derive(Debug, Deserialize)]
struct BroadcastRequest {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    content: String,
}

/// Queue a notification for fan-out to every connected client. Returns 202:
/// delivery is asynchronous and best-effort by design of the hub.
async fn broadcast_handler(
    State(state): State<AppState>,
    Json(request): Json<BroadcastRequest>,
) -> impl IntoResponse {
    let message = ReloadMessage::new(request.kind, request.content);
    state.hub.broadcast(&message);
    (
        StatusCode::ACCEPTED,
        Json(json!({
            "queued": true,
            "connections": state.hub.connected_count(),
        })),
    )
}

async fn healthz_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "connections": state.hub.connected_count(),
        "max_connections": state.hub.max_connections(),
    }))
}

/// Currently blocked client keys, for operator inspection
async fn blocked_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "blocked": state.abuse_guard.blocked_ips() }))
}

/// Lift a block before its expiry
async fn unblock_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> StatusCode {
    if state.abuse_guard.unblock(&key) {
        info!(key, "block lifted by operator");
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

/// Build the rejection response: an active block reads differently to
/// clients than an exhausted bucket, and denials carry the same rate-limit
/// headers an allowed response would, so clients can see the limit they
/// tripped.
fn denied_response(state: &AppState, key: &str, decision: &RateLimitDecision) -> Response {
    let error = if state.abuse_guard.is_blocked(key) {
        RelayError::Blocked {
            retry_after: decision.retry_after,
        }
    } else {
        RelayError::RateLimited {
            retry_after: decision.retry_after,
        }
    };
    let mut response = error.into_response();
    apply_rate_headers(response.headers_mut(), decision);
    response
}

fn apply_rate_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    let reset_at = unix_timestamp() + ceil_secs(decision.reset_after);
    let pairs = [
        ("x-ratelimit-limit", decision.limit.to_string()),
        ("x-ratelimit-remaining", decision.remaining.to_string()),
        ("x-ratelimit-reset", reset_at.to_string()),
    ];
    for (name, value) in pairs {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}

fn message_limiter(state: &AppState) -> SlidingWindowRateLimiter {
    SlidingWindowRateLimiter::new(
        state.config.msg_max_per_window,
        Duration::from_millis(state.config.msg_window_ms),
    )
    .with_backoff(
        Duration::from_millis(state.config.msg_backoff_base_ms),
        state.config.msg_backoff_multiplier,
        Duration::from_secs(state.config.msg_backoff_max_secs),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with(name: &str, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
        headers
    }

    #[test]
    fn test_client_key_prefers_forwarded_for() {
        let headers = headers_with("x-forwarded-for", "203.0.113.7, 10.0.0.1");
        let peer: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        assert_eq!(client_key(&headers, Some(peer)), "203.0.113.7");
    }

    #[test]
    fn test_client_key_falls_back_to_peer() {
        let peer: SocketAddr = "192.0.2.3:6000".parse().unwrap();
        assert_eq!(client_key(&HeaderMap::new(), Some(peer)), "192.0.2.3");
    }

    #[test]
    fn test_client_key_without_any_source() {
        assert_eq!(client_key(&HeaderMap::new(), None), "unknown");
    }

    #[test]
    fn test_empty_forwarded_for_is_ignored() {
        let headers = headers_with("x-forwarded-for", "  ");
        let peer: SocketAddr = "192.0.2.3:6000".parse().unwrap();
        assert_eq!(client_key(&headers, Some(peer)), "192.0.2.3");
    }

    #[test]
    fn test_ceil_secs_rounds_up() {
        assert_eq!(ceil_secs(Duration::from_millis(1500)), 2);
        assert_eq!(ceil_secs(Duration::from_secs(3)), 3);
        assert_eq!(ceil_secs(Duration::ZERO), 0);
    }
}
