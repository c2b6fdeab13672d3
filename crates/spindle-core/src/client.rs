use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use dashmap::DashMap;
use http::{HeaderMap, Method};
use reqwest::Client;

use crate::{error::ProxyError, pool::Egress};

/// Connect timeout applied to every upstream client; the per-attempt request
/// deadline comes from the provider spec.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Outbound HTTP client with one `reqwest::Client` per egress path.
///
/// `reqwest` binds proxy settings at client construction, so the pool of
/// clients is keyed by egress URI and built lazily. Clients hold their own
/// connection pools; reusing them across requests is what makes egress
/// rotation cheap.
pub struct UpstreamClient {
    direct: Client,
    proxied: DashMap<Arc<str>, Client>,
}

impl UpstreamClient {
    /// # Errors
    ///
    /// Returns [`ProxyError::ConfigInvalid`] if the TLS backend cannot be
    /// initialized.
    pub fn new() -> Result<Self, ProxyError> {
        Ok(Self { direct: Self::builder().build().map_err(build_error)?, proxied: DashMap::new() })
    }

    fn builder() -> reqwest::ClientBuilder {
        Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_idle_timeout(Duration::from_secs(90))
    }

    /// Returns the client bound to the given egress, building and caching it
    /// on first use.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::UpstreamConnectError`] when the proxy URI is
    /// rejected by the HTTP client.
    pub fn client_for(&self, egress: &Egress) -> Result<Client, ProxyError> {
        match egress {
            Egress::Direct => Ok(self.direct.clone()),
            Egress::Proxy(uri) => {
                if let Some(client) = self.proxied.get(uri) {
                    return Ok(client.clone());
                }
                let proxy = reqwest::Proxy::all(uri.as_ref())
                    .map_err(|e| ProxyError::UpstreamConnectError(format!("proxy {uri}: {e}")))?;
                let client = Self::builder()
                    .proxy(proxy)
                    .build()
                    .map_err(|e| ProxyError::UpstreamConnectError(format!("proxy {uri}: {e}")))?;
                self.proxied.insert(Arc::clone(uri), client.clone());
                Ok(client)
            }
        }
    }

    /// Issues one upstream attempt. The response is returned as soon as the
    /// status line and headers arrive; the body streams behind it.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::UpstreamTimeout`] when the deadline elapses and
    /// [`ProxyError::UpstreamConnectError`] for transport failures. Non-2xx
    /// statuses are not errors at this layer; classification happens in the
    /// dispatcher.
    pub async fn send(
        &self,
        egress: &Egress,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Bytes,
        timeout: Duration,
    ) -> Result<reqwest::Response, ProxyError> {
        let client = self.client_for(egress)?;
        let mut request = client.request(method, url).headers(headers).timeout(timeout);
        if !body.is_empty() {
            request = request.body(body);
        }
        request.send().await.map_err(|e| request_error(&e, timeout))
    }

    /// Lightweight `GET` used by the probers; only the status matters, the
    /// body is discarded.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`send`](Self::send).
    pub async fn probe(
        &self,
        egress: &Egress,
        url: &str,
        headers: HeaderMap,
        timeout: Duration,
    ) -> Result<u16, ProxyError> {
        let client = self.client_for(egress)?;
        let response = client
            .get(url)
            .headers(headers)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| request_error(&e, timeout))?;
        Ok(response.status().as_u16())
    }
}

fn build_error(err: reqwest::Error) -> ProxyError {
    ProxyError::ConfigInvalid(format!("failed to build HTTP client: {err}"))
}

fn request_error(err: &reqwest::Error, timeout: Duration) -> ProxyError {
    if err.is_timeout() {
        ProxyError::UpstreamTimeout(timeout.as_secs())
    } else {
        ProxyError::UpstreamConnectError(err.to_string())
    }
}
