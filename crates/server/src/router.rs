use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use http::{HeaderMap, StatusCode};
use spindle_core::{
    dispatch::error_response,
    sink::credential_digest,
    AuthGate, ConfigStore, Dispatcher, EgressPool, InboundRequest, ObservabilitySink,
    ProviderRegistry,
};
use tower_http::{catch_panic::CatchPanicLayer, limit::RequestBodyLimitLayer};

/// Largest inbound body the proxy will buffer for replay across retries.
const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

/// Shared handles threaded through every route.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ConfigStore>,
    pub registry: Arc<ProviderRegistry>,
    pub egresses: EgressPool,
    pub dispatcher: Arc<Dispatcher>,
    pub sink: Arc<ObservabilitySink>,
}

/// Builds the application router.
///
/// `/health` is public; `/admin/status` requires the admin token; everything
/// else falls through to the dispatcher, which runs its own auth gate.
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/admin/status", get(handle_admin_status))
        .fallback(forward)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(CatchPanicLayer::new())
        .with_state(state)
}

async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Forwards any unmatched route into the dispatcher.
///
/// The inbound body is buffered up front: retries need to replay it, and the
/// body-limit layer has already bounded its size.
async fn forward(State(state): State<AppState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(serde_json::json!({ "error": "request body too large" })),
            )
                .into_response();
        }
    };

    state
        .dispatcher
        .dispatch(InboundRequest {
            method: parts.method,
            path: parts.uri.path().to_string(),
            query: parts.uri.query().map(ToString::to_string),
            headers: parts.headers,
            body,
        })
        .await
}

/// Renders pool health for the external admin UI: per-provider credential
/// state (digests only, never raw keys), egress state, and recent errors.
async fn handle_admin_status(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let snapshot = state.config.snapshot();
    if let Err(err) = AuthGate::authorize_admin(&snapshot, &headers) {
        return error_response(&err);
    }

    let providers: Vec<serde_json::Value> = state
        .registry
        .list_providers()
        .iter()
        .map(|provider| {
            let credentials = provider.credentials.status();
            let disabled = credentials.iter().filter(|c| c.disabled).count();
            serde_json::json!({
                "name": provider.spec.name,
                "path": provider.spec.path,
                "base_url": provider.spec.base_url,
                "enabled": provider.spec.enabled,
                "keys": {
                    "total": credentials.len(),
                    "enabled": credentials.len() - disabled,
                    "disabled": disabled,
                },
                "credentials": credentials
                    .iter()
                    .map(|c| serde_json::json!({
                        "digest": credential_digest(&c.value),
                        "consecutive_failures": c.consecutive_failures,
                        "disabled": c.disabled,
                        "in_use": c.in_use,
                    }))
                    .collect::<Vec<_>>(),
            })
        })
        .collect();

    let egresses: Vec<serde_json::Value> = state
        .egresses
        .status()
        .iter()
        .map(|e| {
            serde_json::json!({
                "uri": e.uri.as_ref(),
                "consecutive_failures": e.consecutive_failures,
                "disabled": e.disabled,
                "bound_credentials": e.bound_credentials,
            })
        })
        .collect();

    Json(serde_json::json!({
        "default_provider": snapshot.default_provider,
        "config_version": state.config.version(),
        "providers": providers,
        "egresses": egresses,
        "recent_errors": state.sink.recent_errors(50),
    }))
    .into_response()
}
