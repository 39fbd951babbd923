//! HTTP surface: WebSocket upgrade, health, metrics, static web client.
//!
//! One `Router` carrying an `AppState`, a security-headers middleware
//! layer, `ServeDir` as the fallback service for the web client bundle.
//! Identity is resolved from the literal `session` cookie contract in
//! `auth.rs`, since it always maps to a host user rather than a token
//! issued by this process.

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use gateway_protocol::GatewayConfig;
use serde_json::json;
use tower_http::services::ServeDir;

use crate::auth::{self, Identity};
use crate::client::handle_client_ws;
use crate::session::SessionManager;
use crate::store::Store;

pub struct AppState {
    pub config: GatewayConfig,
    pub store: Store,
    pub session_manager: Arc<SessionManager>,
    pub started_at: std::time::Instant,
}

/// Middleware that adds security headers to every response.
async fn security_headers(
    request: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    headers.insert(
        "strict-transport-security",
        HeaderValue::from_static("max-age=63072000; includeSubDomains"),
    );
    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "referrer-policy",
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static(
            "default-src 'self'; script-src 'self'; style-src 'self' 'unsafe-inline'; \
             connect-src 'self' wss: ws:; img-src 'self' data:",
        ),
    );

    response
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/ws", get(client_ws_upgrade))
        .route("/healthz", get(health_check))
        .route("/metrics", get(metrics))
        .with_state(Arc::clone(&state));

    let serve_dir = ServeDir::new(&state.config.server.web_root);

    api.fallback_service(serve_dir)
        .layer(axum::middleware::from_fn(security_headers))
}

/// Find and verify the `session` cookie against the configured secret,
/// resolving it to a full local-user `Identity`.
fn authenticate(headers: &HeaderMap, secret: &str) -> Result<Identity, (StatusCode, String)> {
    let cookie_header = headers
        .get("cookie")
        .and_then(|v| v.to_str().ok())
        .ok_or((StatusCode::UNAUTHORIZED, "missing cookie header".to_string()))?;

    let session_cookie = cookie_header
        .split(';')
        .map(|kv| kv.trim())
        .find_map(|kv| kv.strip_prefix("session="))
        .ok_or((StatusCode::UNAUTHORIZED, "missing session cookie".to_string()))?;

    auth::verify_identity(session_cookie, secret.as_bytes())
        .map_err(|e| (StatusCode::UNAUTHORIZED, e.to_string()))
}

async fn client_ws_upgrade(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let secret = match state.config.server.session_secret.as_deref() {
        Some(s) => s,
        None => {
            return (StatusCode::INTERNAL_SERVER_ERROR, "session_secret not configured").into_response();
        }
    };

    let identity = match authenticate(&headers, secret) {
        Ok(identity) => identity,
        Err((status, msg)) => return (status, msg).into_response(),
    };

    let sessions = Arc::clone(&state.session_manager);
    ws.on_upgrade(move |socket| handle_client_ws(socket, identity, sessions))
}

async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

async fn metrics(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if state.config.server.metrics_require_auth {
        let secret = state.config.server.session_secret.as_deref().unwrap_or("");
        if let Err((status, msg)) = authenticate(&headers, secret) {
            return (status, msg).into_response();
        }
    }

    let uptime_secs = state.started_at.elapsed().as_secs();
    let body = format!(
        "# HELP gateway_uptime_seconds Server uptime in seconds\n\
         # TYPE gateway_uptime_seconds gauge\n\
         gateway_uptime_seconds {uptime_secs}\n"
    );

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn test_state() -> Arc<AppState> {
        let store = Store::open_in_memory().unwrap();
        let config = GatewayConfig::default();
        let terminals = crate::terminal::TerminalManager::new();
        let session_manager = SessionManager::new(store.clone(), terminals, config.clone())
            .await
            .unwrap();
        Arc::new(AppState {
            config,
            store,
            session_manager,
            started_at: std::time::Instant::now(),
        })
    }

    #[tokio::test]
    async fn health_check_returns_ok_without_auth() {
        let state = test_state().await;
        let app = build_router(state);

        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn ws_upgrade_without_cookie_is_unauthorized() {
        let mut state_inner = Arc::try_unwrap(test_state().await).unwrap_or_else(|_| unreachable!());
        state_inner.config.server.session_secret = Some("test-secret".to_string());
        let app = build_router(Arc::new(state_inner));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/ws")
                    .header("upgrade", "websocket")
                    .header("connection", "upgrade")
                    .header("sec-websocket-version", "13")
                    .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn metrics_requires_auth_when_configured() {
        let state = test_state().await;
        assert!(state.config.server.metrics_require_auth);
        let app = build_router(state);

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn metrics_accessible_without_auth_when_disabled() {
        let mut state_inner = Arc::try_unwrap(test_state().await).unwrap_or_else(|_| unreachable!());
        state_inner.config.server.metrics_require_auth = false;
        let app = build_router(Arc::new(state_inner));

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }
}
