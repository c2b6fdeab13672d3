//! The request-handling core.
//!
//! One [`Dispatcher::dispatch`] call covers the whole inbound lifecycle:
//! token check, provider resolution, target URL construction, header policy,
//! and the retry loop over the credential × egress cross-product. Responses
//! stream: the upstream body is forwarded chunk by chunk, and the first byte
//! handed to the client commits the attempt. After commit, upstream trouble
//! surfaces as a truncated stream, never as a retry.

use std::{collections::HashMap, sync::Arc, time::Instant};

use axum::{
    body::Body,
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use chrono::Utc;
use futures_util::TryStreamExt;
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};

use crate::{
    auth::AuthGate,
    client::UpstreamClient,
    config::{ConfigSnapshot, ConfigStore, ProviderSpec},
    error::ProxyError,
    pool::{CredentialLease, Egress, EgressPool, Outcome},
    registry::{ProviderRegistry, Resolved},
    sink::{credential_digest, ErrorRecord, ObservabilitySink, RequestRecord},
};

/// Longest upstream error body kept for records and terminal responses.
const ERROR_BODY_LIMIT: usize = 2048;

/// A fully parsed inbound request, decoupled from the HTTP framework so the
/// dispatcher can be driven directly in tests.
pub struct InboundRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Request routing and forwarding engine.
///
/// Holds no per-request state; every `dispatch` call pins the configuration
/// snapshot it starts with and runs against that snapshot to completion,
/// even if a reload happens mid-flight.
pub struct Dispatcher {
    config: Arc<ConfigStore>,
    registry: Arc<ProviderRegistry>,
    egresses: EgressPool,
    client: Arc<UpstreamClient>,
    sink: Arc<ObservabilitySink>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        config: Arc<ConfigStore>,
        registry: Arc<ProviderRegistry>,
        egresses: EgressPool,
        client: Arc<UpstreamClient>,
        sink: Arc<ObservabilitySink>,
    ) -> Self {
        Self { config, registry, egresses, client, sink }
    }

    /// Handles one inbound request end to end, always producing a response.
    pub async fn dispatch(&self, request: InboundRequest) -> Response {
        let snapshot = self.config.snapshot();

        if let Err(err) = AuthGate::authorize(&snapshot, &request.headers) {
            return error_response(&err);
        }

        let resolved = match self.registry.resolve(&request.path) {
            Ok(resolved) => resolved,
            Err(err) => return error_response(&err),
        };

        match self.forward(&snapshot, &resolved, &request).await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(
                    provider = %resolved.provider.spec.name,
                    error = %err,
                    "request failed"
                );
                error_response(&err)
            }
        }
    }

    /// The retry loop. Runs up to `max_retries + 1` attempts, leasing a fresh
    /// (credential, egress) pair for each one and settling both according to
    /// the classified outcome.
    async fn forward(
        &self,
        snapshot: &ConfigSnapshot,
        resolved: &Resolved,
        request: &InboundRequest,
    ) -> Result<Response, ProxyError> {
        let spec = &resolved.provider.spec;
        let pool = &resolved.provider.credentials;
        let timeout = spec.timeout(snapshot);
        let retries = spec.max_retries(snapshot);
        let url = build_target_url(spec, &resolved.remaining, request.query.as_deref());
        let is_models = request.method == Method::GET && resolved.remaining == "/v1/models";
        let model = extract_model(&request.body);

        let mut last_status: Option<u16> = None;
        let mut last_message = String::from("no upstream attempt completed");

        for attempt in 0..=retries {
            let lease = if is_models {
                pool.model_request_credential(&spec.model_request_key)
            } else {
                pool.acquire()
            }
            .ok_or_else(|| ProxyError::NoCredentials(spec.name.clone()))?;
            let egress = self.egresses.acquire();

            tracing::debug!(
                provider = %spec.name,
                surface = resolved.surface.as_str(),
                attempt,
                egress = %egress.egress(),
                "forwarding upstream attempt"
            );

            let headers = outbound_headers(&request.headers, lease.value(), &spec.custom_headers);
            let started = Instant::now();
            let sent = self
                .client
                .send(
                    egress.egress(),
                    request.method.clone(),
                    &url,
                    headers,
                    request.body.clone(),
                    timeout,
                )
                .await;

            let err = match sent {
                Ok(response) => {
                    let status = response.status().as_u16();
                    self.record_request(spec, model.as_deref(), Some(status), started);

                    if response.status().is_success() {
                        lease.complete(Outcome::Success);
                        egress.complete(Outcome::Success);
                        if is_models {
                            return self.filtered_models_response(snapshot, response).await;
                        }
                        return Ok(stream_response(response));
                    }

                    if !ProxyError::from_upstream_status(status, String::new()).is_transient() {
                        // Not the credential's fault; pass through untouched.
                        self.record_error(
                            snapshot,
                            spec,
                            &lease,
                            egress.egress(),
                            Some(status),
                            "client error forwarded verbatim",
                            request,
                        );
                        lease.complete(Outcome::Success);
                        egress.complete(Outcome::Success);
                        return Ok(stream_response(response));
                    }

                    let message = read_error_body(response).await;
                    ProxyError::from_upstream_status(status, message)
                }
                Err(err) => {
                    self.record_request(spec, model.as_deref(), None, started);
                    err
                }
            };

            let message = match &err {
                ProxyError::UpstreamAuthFailure { message, .. } |
                ProxyError::UpstreamRateLimit { message } |
                ProxyError::UpstreamServerError { message, .. } => message.clone(),
                other => other.to_string(),
            };
            self.record_error(
                snapshot,
                spec,
                &lease,
                egress.egress(),
                err.upstream_status(),
                &message,
                request,
            );
            last_status = err.upstream_status();
            last_message = message;

            match &err {
                ProxyError::UpstreamAuthFailure { .. } => {
                    // The credential is suspect, the egress did its job.
                    lease.complete(Outcome::AuthFailure);
                    egress.complete(Outcome::Success);
                }
                _ if err.penalizes_credential() => {
                    lease.complete(Outcome::TransientFailure);
                    egress.complete(Outcome::TransientFailure);
                    self.propagate_unbinds();
                }
                _ => {
                    lease.complete(Outcome::Success);
                    egress.complete(Outcome::Success);
                }
            }
        }

        Err(ProxyError::AllUpstreamsFailed { last_status, last_message })
    }

    /// Buffers a 2xx `/v1/models` response and removes filtered entries.
    /// Bodies that are not the expected shape pass through unchanged.
    async fn filtered_models_response(
        &self,
        snapshot: &ConfigSnapshot,
        response: reqwest::Response,
    ) -> Result<Response, ProxyError> {
        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ProxyError::UpstreamConnectError(e.to_string()))?;

        let Ok(mut payload) = serde_json::from_slice::<serde_json::Value>(&bytes) else {
            return Ok((StatusCode::from_u16(status).unwrap_or(StatusCode::OK), bytes).into_response());
        };
        if let Some(entries) = payload.get_mut("data").and_then(|d| d.as_array_mut()) {
            entries.retain(|entry| {
                entry
                    .get("id")
                    .and_then(|id| id.as_str())
                    .map_or(true, |id| !snapshot.filtered_models.contains(id))
            });
        }
        Ok((StatusCode::from_u16(status).unwrap_or(StatusCode::OK), Json(payload)).into_response())
    }

    fn record_request(
        &self,
        spec: &ProviderSpec,
        model: Option<&str>,
        status: Option<u16>,
        started: Instant,
    ) {
        self.sink.record_request(RequestRecord {
            provider: spec.name.clone(),
            model: model.map(ToString::to_string),
            status,
            latency_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            timestamp: Utc::now(),
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn record_error(
        &self,
        snapshot: &ConfigSnapshot,
        spec: &ProviderSpec,
        lease: &CredentialLease,
        egress: &Egress,
        status: Option<u16>,
        message: &str,
        request: &InboundRequest,
    ) {
        let request_body = snapshot
            .error_log_record_request_body
            .then(|| truncate(&String::from_utf8_lossy(&request.body)));
        self.sink.record_error(ErrorRecord {
            provider: spec.name.clone(),
            credential_digest: credential_digest(lease.value()),
            egress: egress.as_str().to_string(),
            status,
            message: truncate(message),
            request_body,
            timestamp: Utc::now(),
        });
    }

    /// Clears credential affinities for any egress quarantined during this
    /// request.
    fn propagate_unbinds(&self) {
        for uri in self.egresses.take_newly_disabled() {
            let cleared = self.registry.clear_egress_bindings(&uri);
            if cleared > 0 {
                tracing::info!(proxy = %uri, cleared, "cleared credential bindings for quarantined egress");
            }
        }
    }
}

/// Joins the provider base URL and the normalized remainder.
///
/// The remainder always starts with `/v1`; a base URL that already ends in
/// `/v1` contributes it instead, so both `https://u` and `https://u/v1`
/// produce `https://u/v1/...`. The inbound query string is carried verbatim.
fn build_target_url(spec: &ProviderSpec, remaining: &str, query: Option<&str>) -> String {
    let base = spec.trimmed_base_url();
    let path = match base.strip_suffix("/v1") {
        Some(_) => remaining.strip_prefix("/v1").unwrap_or(remaining),
        None => remaining,
    };
    match query {
        Some(query) if !query.is_empty() => format!("{base}{path}?{query}"),
        _ => format!("{base}{path}"),
    }
}

/// Outbound header policy: drop inbound auth material, inject the leased
/// credential, merge provider custom headers (override on conflict), and
/// preserve content negotiation plus `x-*` forwarding hints.
fn outbound_headers(
    inbound: &HeaderMap,
    credential: &str,
    custom: &HashMap<String, String>,
) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in inbound {
        let keep = name == header::CONTENT_TYPE ||
            name == header::ACCEPT ||
            name.as_str().starts_with("x-");
        if keep {
            headers.append(name.clone(), value.clone());
        }
    }

    if let Ok(value) = HeaderValue::from_str(&format!("Bearer {credential}")) {
        headers.insert(header::AUTHORIZATION, value);
    }

    for (name, value) in custom {
        let Ok(name) = HeaderName::try_from(name.as_str()) else {
            continue;
        };
        let Ok(value) = HeaderValue::from_str(value) else {
            continue;
        };
        headers.insert(name, value);
    }

    headers
}

/// Connection-scoped headers that must not be forwarded on either leg.
fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection" |
            "keep-alive" |
            "proxy-authenticate" |
            "proxy-authorization" |
            "te" |
            "trailer" |
            "transfer-encoding" |
            "upgrade"
    )
}

/// Bridges an upstream response into the client response without buffering.
/// Building the response is the commit point: axum flushes the status line
/// and headers, then pulls body chunks off the upstream stream as they land.
fn stream_response(upstream: reqwest::Response) -> Response {
    let status =
        StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    if let Some(headers) = builder.headers_mut() {
        for (name, value) in upstream.headers() {
            if !is_hop_by_hop(name) {
                headers.append(name.clone(), value.clone());
            }
        }
    }

    let stream = upstream.bytes_stream().map_err(std::io::Error::other);
    builder
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

/// Renders a terminal [`ProxyError`] as its JSON body and mapped status.
pub fn error_response(err: &ProxyError) -> Response {
    (err.status(), Json(err.to_body())).into_response()
}

/// Pulls the model id out of a JSON request body, for request records only.
fn extract_model(body: &Bytes) -> Option<String> {
    if body.is_empty() {
        return None;
    }
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()?
        .get("model")?
        .as_str()
        .map(ToString::to_string)
}

async fn read_error_body(response: reqwest::Response) -> String {
    match response.text().await {
        Ok(text) if !text.is_empty() => truncate(&text),
        Ok(_) => String::from("(empty body)"),
        Err(err) => format!("(unreadable body: {err})"),
    }
}

fn truncate(text: &str) -> String {
    if text.len() <= ERROR_BODY_LIMIT {
        text.to_string()
    } else {
        let mut end = ERROR_BODY_LIMIT;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text[..end].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigSnapshot;
    use std::collections::HashMap as Map;

    struct Harness {
        dispatcher: Dispatcher,
        registry: Arc<ProviderRegistry>,
        sink: Arc<ObservabilitySink>,
    }

    fn harness(extra: &[(&str, &str)]) -> Harness {
        let mut map = Map::from([
            ("ALLOWED_TOKENS".to_string(), "tk".to_string()),
        ]);
        for (key, value) in extra {
            map.insert((*key).to_string(), (*value).to_string());
        }
        let snapshot = ConfigSnapshot::from_map(&map).unwrap();
        let registry = Arc::new(ProviderRegistry::new(&snapshot));
        let egresses = EgressPool::new(&snapshot.proxies, snapshot.proxy_max_failures);
        let sink = Arc::new(ObservabilitySink::new(256));
        let config = Arc::new(ConfigStore::new(snapshot));
        let dispatcher = Dispatcher::new(
            Arc::clone(&config),
            Arc::clone(&registry),
            egresses,
            Arc::new(UpstreamClient::new().unwrap()),
            Arc::clone(&sink),
        );
        Harness { dispatcher, registry, sink }
    }

    fn chat_request(path: &str, token: Option<&str>, body: &str) -> InboundRequest {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(token) = token {
            headers.insert(
                header::AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
            );
        }
        InboundRequest {
            method: Method::POST,
            path: path.to_string(),
            query: None,
            headers,
            body: Bytes::from(body.to_string()),
        }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn failure_counts(harness: &Harness, provider: &str) -> Map<String, u32> {
        harness
            .registry
            .provider(provider)
            .unwrap()
            .credentials
            .status()
            .into_iter()
            .map(|s| (s.value.to_string(), s.consecutive_failures))
            .collect()
    }

    #[tokio::test]
    async fn single_provider_success_streams_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_header("authorization", "Bearer sk-A")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id":"r"}"#)
            .create_async()
            .await;

        let base = format!("{}/v1", server.url());
        let harness = harness(&[
            ("API_KEYS", r#"["sk-A"]"#),
            ("BASE_URL", base.as_str()),
        ]);

        let response = harness
            .dispatcher
            .dispatch(chat_request(
                "/v1/chat/completions",
                Some("tk"),
                r#"{"model":"m","messages":[]}"#,
            ))
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["id"], "r");
        mock.assert_async().await;
        assert_eq!(harness.sink.request_count(), 1);
        assert_eq!(harness.sink.error_count(), 0);
    }

    #[tokio::test]
    async fn rotation_retries_past_auth_failure() {
        let mut server = mockito::Server::new_async().await;
        let rejected = server
            .mock("POST", "/v1/chat/completions")
            .match_header("authorization", "Bearer sk-A")
            .with_status(401)
            .with_body(r#"{"error":"bad key"}"#)
            .create_async()
            .await;
        let accepted = server
            .mock("POST", "/v1/chat/completions")
            .match_header("authorization", "Bearer sk-B")
            .with_status(200)
            .with_body(r#"{"ok":true}"#)
            .create_async()
            .await;

        let harness = harness(&[
            ("API_KEYS", r#"["sk-A","sk-B"]"#),
            ("BASE_URL", server.url().as_str()),
            ("MAX_RETRIES", "1"),
            ("MAX_FAILURES", "3"),
        ]);

        let response = harness
            .dispatcher
            .dispatch(chat_request("/v1/chat/completions", Some("tk"), "{}"))
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        rejected.assert_async().await;
        accepted.assert_async().await;

        let counts = failure_counts(&harness, "default");
        assert_eq!(counts["sk-A"], 1);
        assert_eq!(counts["sk-B"], 0);
        assert_eq!(harness.sink.error_count(), 1);
    }

    #[tokio::test]
    async fn threshold_quarantine_then_fail_fast() {
        let mut server = mockito::Server::new_async().await;
        let upstream = server
            .mock("POST", "/v1/chat/completions")
            .with_status(500)
            .with_body("boom")
            .expect(2)
            .create_async()
            .await;

        let harness = harness(&[
            ("API_KEYS", r#"["sk-A"]"#),
            ("BASE_URL", server.url().as_str()),
            ("MAX_RETRIES", "0"),
            ("MAX_FAILURES", "2"),
        ]);

        for _ in 0..2 {
            let response = harness
                .dispatcher
                .dispatch(chat_request("/v1/chat/completions", Some("tk"), "{}"))
                .await;
            assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        }
        // The second failure hit the threshold and quarantined the key, so
        // the next request fails fast without touching the upstream.
        let response = harness
            .dispatcher
            .dispatch(chat_request("/v1/chat/completions", Some("tk"), "{}"))
            .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("no credentials"));

        upstream.assert_async().await;
    }

    #[tokio::test]
    async fn terminal_body_names_the_last_failure() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/chat/completions")
            .with_status(503)
            .with_body("overloaded")
            .expect(2)
            .create_async()
            .await;

        let harness = harness(&[
            ("API_KEYS", r#"["sk-A","sk-B"]"#),
            ("BASE_URL", server.url().as_str()),
            ("MAX_RETRIES", "1"),
            ("MAX_FAILURES", "9"),
        ]);

        let response = harness
            .dispatcher
            .dispatch(chat_request("/v1/chat/completions", Some("tk"), "{}"))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "all_upstreams_failed");
        assert_eq!(body["error"]["last_status"], 503);
        assert_eq!(body["error"]["last_message"], "overloaded");
    }

    #[tokio::test]
    async fn multi_provider_routing_hits_the_right_upstream() {
        let mut openai = mockito::Server::new_async().await;
        let mut deepseek = mockito::Server::new_async().await;
        let openai_mock = openai
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_body(r#"{"from":"openai"}"#)
            .create_async()
            .await;
        let deepseek_mock = deepseek
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_body(r#"{"from":"deepseek"}"#)
            .create_async()
            .await;

        let providers = format!(
            r#"[
                {{"name":"openai","path":"openai","base_url":"{}","api_keys":["sk-o"]}},
                {{"name":"deepseek","path":"deepseek","base_url":"{}","api_keys":["sk-d"]}}
            ]"#,
            openai.url(),
            deepseek.url()
        );
        let harness = harness(&[
            ("PROVIDERS_CONFIG", providers.as_str()),
            ("DEFAULT_PROVIDER", "openai"),
        ]);

        let response = harness
            .dispatcher
            .dispatch(chat_request("/deepseek/v1/chat/completions", Some("tk"), "{}"))
            .await;
        assert_eq!(body_json(response).await["from"], "deepseek");

        // "/openai" is consumed as a surface prefix; the bare /v1 remainder
        // then selects the default provider.
        let response = harness
            .dispatcher
            .dispatch(chat_request("/openai/v1/chat/completions", Some("tk"), "{}"))
            .await;
        assert_eq!(body_json(response).await["from"], "openai");

        openai_mock.assert_async().await;
        deepseek_mock.assert_async().await;
    }

    #[tokio::test]
    async fn models_response_is_filtered() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/models")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"object":"list","data":[{"id":"m-old"},{"id":"m-new"}]}"#)
            .create_async()
            .await;

        let harness = harness(&[
            ("API_KEYS", r#"["sk-A"]"#),
            ("BASE_URL", server.url().as_str()),
            ("FILTERED_MODELS", r#"["m-old"]"#),
        ]);

        let mut request = chat_request("/v1/models", Some("tk"), "");
        request.method = Method::GET;
        let response = harness.dispatcher.dispatch(request).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        let ids: Vec<_> =
            body["data"].as_array().unwrap().iter().map(|m| m["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["m-new"]);
        assert_eq!(body["object"], "list");
    }

    #[tokio::test]
    async fn models_request_uses_dedicated_key() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/models")
            .match_header("authorization", "Bearer sk-models")
            .with_status(200)
            .with_body(r#"{"data":[]}"#)
            .create_async()
            .await;

        let providers = format!(
            r#"[{{"name":"default","path":"default","base_url":"{}","api_keys":["sk-A","sk-models"],"model_request_key":"sk-models"}}]"#,
            server.url()
        );
        let harness = harness(&[("PROVIDERS_CONFIG", providers.as_str())]);

        let mut request = chat_request("/v1/models", Some("tk"), "");
        request.method = Method::GET;
        let response = harness.dispatcher.dispatch(request).await;
        assert_eq!(response.status(), StatusCode::OK);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn fatal_client_error_is_forwarded_without_retry() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(404)
            .with_body(r#"{"error":"no such model"}"#)
            .expect(1)
            .create_async()
            .await;

        let harness = harness(&[
            ("API_KEYS", r#"["sk-A"]"#),
            ("BASE_URL", server.url().as_str()),
            ("MAX_RETRIES", "3"),
        ]);

        let response = harness
            .dispatcher
            .dispatch(chat_request("/v1/chat/completions", Some("tk"), "{}"))
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["error"], "no such model");
        mock.assert_async().await;

        // The credential is fine.
        let counts = failure_counts(&harness, "default");
        assert_eq!(counts["sk-A"], 0);
    }

    #[tokio::test]
    async fn missing_or_bad_token_rejected_before_upstream() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .expect(0)
            .create_async()
            .await;

        let harness = harness(&[
            ("API_KEYS", r#"["sk-A"]"#),
            ("BASE_URL", server.url().as_str()),
        ]);

        let response = harness
            .dispatcher
            .dispatch(chat_request("/v1/chat/completions", None, "{}"))
            .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["error"], "Unauthorized");

        let response = harness
            .dispatcher
            .dispatch(chat_request("/v1/chat/completions", Some("intruder"), "{}"))
            .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn unknown_provider_is_not_found() {
        let harness = harness(&[("API_KEYS", r#"["sk-A"]"#)]);
        let response = harness
            .dispatcher
            .dispatch(chat_request("/ghost/v1/chat/completions", Some("tk"), "{}"))
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn query_string_and_custom_headers_are_forwarded() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/models")
            .match_query(mockito::Matcher::UrlEncoded("limit".into(), "5".into()))
            .match_header("x-org", "acme")
            .match_header("x-request-tag", "inbound-hint")
            .with_status(200)
            .with_body(r#"{"data":[]}"#)
            .create_async()
            .await;

        let providers = format!(
            r#"[{{"name":"default","path":"default","base_url":"{}","api_keys":["sk-A"],"custom_headers":{{"x-org":"acme"}}}}]"#,
            server.url()
        );
        let harness = harness(&[("PROVIDERS_CONFIG", providers.as_str())]);

        let mut request = chat_request("/v1/models", Some("tk"), "");
        request.method = Method::GET;
        request.query = Some("limit=5".to_string());
        request
            .headers
            .insert("x-request-tag", HeaderValue::from_static("inbound-hint"));

        let response = harness.dispatcher.dispatch(request).await;
        assert_eq!(response.status(), StatusCode::OK);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn inbound_cookie_is_not_forwarded() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_header("cookie", mockito::Matcher::Missing)
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let harness = harness(&[
            ("API_KEYS", r#"["sk-A"]"#),
            ("BASE_URL", server.url().as_str()),
        ]);

        let mut request = chat_request("/v1/chat/completions", Some("tk"), "{}");
        request.headers.insert(header::COOKIE, HeaderValue::from_static("session=abc"));
        let response = harness.dispatcher.dispatch(request).await;
        assert_eq!(response.status(), StatusCode::OK);
        mock.assert_async().await;
    }

    #[test]
    fn target_url_joins_with_and_without_v1_base() {
        let mut spec = ProviderSpec {
            name: "p".into(),
            path: "p".into(),
            base_url: "https://u/v1".into(),
            api_keys: vec![],
            model_request_key: String::new(),
            custom_headers: HashMap::new(),
            timeout: None,
            max_failures: None,
            max_retries: None,
            test_model: None,
            tools_code_execution_enabled: false,
            enabled: true,
        };
        assert_eq!(
            build_target_url(&spec, "/v1/chat/completions", None),
            "https://u/v1/chat/completions"
        );

        spec.base_url = "https://u".into();
        assert_eq!(
            build_target_url(&spec, "/v1/chat/completions", None),
            "https://u/v1/chat/completions"
        );

        spec.base_url = "https://u/v1/".into();
        assert_eq!(
            build_target_url(&spec, "/v1/models", Some("limit=5")),
            "https://u/v1/models?limit=5"
        );
    }

    #[test]
    fn model_extraction_is_best_effort() {
        assert_eq!(
            extract_model(&Bytes::from(r#"{"model":"gpt-4","messages":[]}"#)),
            Some("gpt-4".to_string())
        );
        assert_eq!(extract_model(&Bytes::from("not json")), None);
        assert_eq!(extract_model(&Bytes::new()), None);
    }
}
