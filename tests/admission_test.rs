//! Integration tests driving the full router through tower's oneshot

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use tower::ServiceExt;

use reload_relay::admission;
use reload_relay::config::Config;
use reload_relay::state::AppState;

fn test_config() -> Config {
    Config {
        max_connections: 4,
        abuse_flood_threshold: 5,
        ..Config::default()
    }
}

/// Build the router with its hub loop running, keeping a state handle so
/// tests can reach behind the HTTP surface.
fn app(config: Config) -> (AppState, Router) {
    let (state, hub) = AppState::new(&config);
    tokio::spawn(hub.run());
    (state.clone(), admission::router(state))
}

fn ws_request(origin: Option<&str>, forwarded_for: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .uri("/ws")
        .header("connection", "upgrade")
        .header("upgrade", "websocket")
        .header("sec-websocket-version", "13")
        .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==");
    if let Some(origin) = origin {
        builder = builder.header("origin", origin);
    }
    if let Some(addr) = forwarded_for {
        builder = builder.header("x-forwarded-for", addr);
    }
    builder.body(Body::empty()).unwrap()
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_healthz_reports_connection_counts() {
    let (_state, app) = app(test_config());

    let response = app
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["connections"], 0);
    assert_eq!(body["max_connections"], 4);
}

#[tokio::test]
async fn test_handshake_without_origin_is_forbidden() {
    let (_state, app) = app(test_config());

    let response = app.oneshot(ws_request(None, None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_handshake_from_unknown_origin_is_forbidden() {
    let (_state, app) = app(test_config());

    let response = app
        .oneshot(ws_request(Some("http://evil.example"), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_origin_scheme_match_is_case_sensitive() {
    let (_state, app) = app(test_config());

    let response = app
        .oneshot(ws_request(Some("HTTP://LOCALHOST:3000"), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_blocked_key_gets_429_with_retry_after() {
    let (state, app) = app(test_config());

    // Flood past the threshold so the key lands on the block list
    for _ in 0..10 {
        state.abuse_guard.check_request("203.0.113.9");
    }
    assert!(state.abuse_guard.is_blocked("203.0.113.9"));

    let response = app
        .oneshot(ws_request(
            Some("http://localhost:3000"),
            Some("203.0.113.9"),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = response
        .headers()
        .get("retry-after")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after > 0);
    // Rejections carry the same rate-limit headers as allowed responses
    assert!(response.headers().contains_key("x-ratelimit-limit"));
    assert_eq!(response.headers().get("x-ratelimit-remaining").unwrap(), "0");
}

#[tokio::test]
async fn test_denied_request_carries_rate_limit_headers() {
    let (state, app) = app(test_config());

    for _ in 0..10 {
        state.abuse_guard.check_request("203.0.113.80");
    }
    assert!(state.abuse_guard.is_blocked("203.0.113.80"));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/healthz")
                .header("x-forwarded-for", "203.0.113.80")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers().get("x-ratelimit-limit").unwrap(), "60");
    assert_eq!(response.headers().get("x-ratelimit-remaining").unwrap(), "0");
    assert!(response.headers().contains_key("x-ratelimit-reset"));
    assert!(response.headers().contains_key("retry-after"));
}

#[tokio::test]
async fn test_broadcast_is_accepted_with_rate_headers() {
    let (_state, app) = app(test_config());

    let request = Request::builder()
        .method("POST")
        .uri("/broadcast")
        .header("content-type", "application/json")
        .header("x-forwarded-for", "198.51.100.2")
        .body(Body::from(r#"{"type":"css_update","content":"app.css"}"#))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(response.headers().get("x-ratelimit-limit").unwrap(), "60");
    assert!(response.headers().contains_key("x-ratelimit-remaining"));
    assert!(response.headers().contains_key("x-ratelimit-reset"));

    let body = json_body(response).await;
    assert_eq!(body["queued"], true);
}

#[tokio::test]
async fn test_control_endpoints_are_flood_limited() {
    let (_state, app) = app(test_config());

    // Threshold is 5 requests per observation window for this config
    for _ in 0..5 {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .header("x-forwarded-for", "198.51.100.7")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app
        .oneshot(
            Request::builder()
                .uri("/healthz")
                .header("x-forwarded-for", "198.51.100.7")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_blocked_listing_and_unblock() {
    let (state, app) = app(test_config());

    for _ in 0..10 {
        state.abuse_guard.check_request("203.0.113.50");
    }
    assert!(state.abuse_guard.is_blocked("203.0.113.50"));

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/blocked").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["blocked"], serde_json::json!(["203.0.113.50"]));

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/blocked/203.0.113.50")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(!state.abuse_guard.is_blocked("203.0.113.50"));

    // Lifting an absent block reports not found
    let response = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/blocked/203.0.113.50")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_invalid_broadcast_body_is_rejected() {
    let (_state, app) = app(test_config());

    let request = Request::builder()
        .method("POST")
        .uri("/broadcast")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"content":"missing type"}"#))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}
