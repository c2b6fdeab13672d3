//! Background health probing for quarantined credentials and egress proxies.
//!
//! One scheduler task owns two periodic jobs. The credential job revalidates
//! quarantined keys against their provider's `/models` endpoint and returns
//! the good ones to rotation; the egress job checks each configured proxy
//! against the probe URL and quarantines the dead ones. The prober talks to
//! the dispatcher only through the pools, never directly.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use http::{header, HeaderMap, HeaderValue};
use tokio::{sync::broadcast, time::interval};

use crate::{
    client::UpstreamClient,
    config::{ConfigSnapshot, ConfigStore, ProviderSpec},
    pool::{Egress, EgressPool},
    registry::ProviderRegistry,
    sink::{credential_digest, ErrorRecord, ObservabilitySink},
};

/// Upper bound on the credential probe interval.
const CREDENTIAL_INTERVAL_CAP: Duration = Duration::from_secs(60);

/// Quarantined credentials are left alone for this long before the first
/// probe, and again after every failed probe.
const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(60);

/// Probes carry their own short deadline, independent of provider timeouts.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Scheduler for the two periodic probe jobs.
#[derive(Clone)]
pub struct HealthProber {
    config: Arc<ConfigStore>,
    registry: Arc<ProviderRegistry>,
    egresses: EgressPool,
    client: Arc<UpstreamClient>,
    sink: Arc<ObservabilitySink>,
    debounce: Duration,
}

impl HealthProber {
    #[must_use]
    pub fn new(
        config: Arc<ConfigStore>,
        registry: Arc<ProviderRegistry>,
        egresses: EgressPool,
        client: Arc<UpstreamClient>,
        sink: Arc<ObservabilitySink>,
    ) -> Self {
        Self { config, registry, egresses, client, sink, debounce: DEFAULT_DEBOUNCE }
    }

    /// Overrides the quarantine debounce window.
    #[must_use]
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Spawns the scheduler. Intervals are derived from the active snapshot
    /// and rebuilt whenever a new snapshot is published; the task exits on
    /// the shutdown signal.
    #[must_use]
    pub fn start_with_shutdown(
        &self,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let prober = self.clone();
        tokio::spawn(async move {
            let mut config_rx = prober.config.subscribe();
            'rebuild: loop {
                let snapshot = prober.config.snapshot();
                let mut credential_tick = interval(credential_interval(&snapshot));
                let mut egress_tick = interval(snapshot.proxy_check_interval());
                // The first tick of a fresh interval fires immediately;
                // consume both so a config reload does not trigger a probe
                // burst.
                credential_tick.tick().await;
                egress_tick.tick().await;

                loop {
                    tokio::select! {
                        _ = credential_tick.tick() => {
                            prober.probe_credentials_once().await;
                        }
                        _ = egress_tick.tick() => {
                            prober.probe_egresses_once().await;
                        }
                        changed = config_rx.changed() => {
                            if changed.is_err() {
                                tracing::info!("config store dropped, prober exiting");
                                return;
                            }
                            continue 'rebuild;
                        }
                        _ = shutdown_rx.recv() => {
                            tracing::info!("health prober shutting down");
                            return;
                        }
                    }
                }
            }
        })
    }

    /// One pass over every provider's quarantined credentials.
    ///
    /// Probes run sequentially, so no credential ever has more than one
    /// probe in flight. A 2xx re-enables the credential with cleared
    /// counters; anything else restarts its debounce window.
    pub async fn probe_credentials_once(&self) {
        for provider in self.registry.list_providers() {
            let spec = &provider.spec;
            if !spec.enabled {
                continue;
            }
            let candidates = provider.credentials.probe_candidates(self.debounce);
            if candidates.is_empty() {
                continue;
            }
            tracing::info!(
                provider = %spec.name,
                candidates = candidates.len(),
                "probing quarantined credentials"
            );

            for value in candidates {
                let url = models_probe_url(spec);
                let mut headers = HeaderMap::new();
                if let Ok(bearer) = HeaderValue::from_str(&format!("Bearer {value}")) {
                    headers.insert(header::AUTHORIZATION, bearer);
                }

                match self.client.probe(&Egress::Direct, &url, headers, PROBE_TIMEOUT).await {
                    Ok(status) if (200..300).contains(&status) => {
                        provider.credentials.reenable(&value);
                    }
                    Ok(status) => {
                        provider.credentials.refresh_disabled(&value);
                        self.record_probe_failure(
                            spec,
                            &value,
                            Some(status),
                            &format!("credential probe returned HTTP {status}"),
                        );
                    }
                    Err(err) => {
                        provider.credentials.refresh_disabled(&value);
                        self.record_probe_failure(spec, &value, None, &err.to_string());
                    }
                }
            }
        }
    }

    /// One pass over every configured egress proxy.
    ///
    /// `Direct` is never probed. A reachable probe URL resets the proxy's
    /// strikes (re-enabling it if it was quarantined); a failure strikes it,
    /// and hitting the threshold clears credential affinities everywhere.
    pub async fn probe_egresses_once(&self) {
        let snapshot = self.config.snapshot();
        if !snapshot.proxy_auto_check_enabled {
            return;
        }

        let uris = self.egresses.proxy_uris();
        if uris.is_empty() {
            return;
        }
        tracing::debug!(proxies = uris.len(), "probing egress proxies");

        for uri in uris {
            let egress = Egress::Proxy(Arc::clone(&uri));
            let result = self
                .client
                .probe(
                    &egress,
                    &snapshot.proxy_check_url,
                    HeaderMap::new(),
                    snapshot.proxy_check_timeout(),
                )
                .await;

            match result {
                // Any non-server-error response proves the proxy forwards.
                Ok(status) if status < 500 => {
                    self.egresses.record_probe_success(&uri);
                }
                Ok(status) => {
                    tracing::warn!(proxy = %uri, status, "egress probe failed");
                    self.egresses.record_probe_failure(&uri);
                }
                Err(err) => {
                    tracing::warn!(proxy = %uri, error = %err, "egress probe failed");
                    self.egresses.record_probe_failure(&uri);
                }
            }
        }

        for uri in self.egresses.take_newly_disabled() {
            let cleared = self.registry.clear_egress_bindings(&uri);
            tracing::warn!(proxy = %uri, cleared, "egress quarantined by prober");
        }
    }

    fn record_probe_failure(
        &self,
        spec: &ProviderSpec,
        credential: &str,
        status: Option<u16>,
        message: &str,
    ) {
        self.sink.record_error(ErrorRecord {
            provider: spec.name.clone(),
            credential_digest: credential_digest(credential),
            egress: Egress::Direct.as_str().to_string(),
            status,
            message: message.to_string(),
            request_body: None,
            timestamp: Utc::now(),
        });
    }
}

fn credential_interval(snapshot: &ConfigSnapshot) -> Duration {
    Duration::from_secs(snapshot.timeout_seconds.max(1)).min(CREDENTIAL_INTERVAL_CAP)
}

fn models_probe_url(spec: &ProviderSpec) -> String {
    let base = spec.trimmed_base_url();
    if base.ends_with("/v1") {
        format!("{base}/models")
    } else {
        format!("{base}/v1/models")
    }
}
