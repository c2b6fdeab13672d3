//! Versioned, atomically-replaceable configuration.
//!
//! # Configuration surface
//!
//! The whole configuration is a flat `key -> string` mapping. Every key is
//! also an environment variable of the same name: on startup the hosting
//! binary reads an optional env file and overlays the process environment,
//! then parses the merged map into an immutable [`ConfigSnapshot`].
//!
//! Two keys deserve a note:
//!
//! - `PROVIDERS_CONFIG` is a JSON-encoded array of [`ProviderSpec`]. When
//!   present and non-empty it takes precedence for its named providers over
//!   the flat `BASE_URL`/`API_KEYS` pair, which defines the implicit
//!   `default` provider.
//! - List-valued keys (`ALLOWED_TOKENS`, `API_KEYS`, `PROXIES`,
//!   `FILTERED_MODELS`) accept either a JSON array or a comma-separated
//!   string.
//!
//! # Validation
//!
//! Snapshots are validated at parse time. An invalid map is rejected as
//! [`ProxyError::ConfigInvalid`] without touching the active snapshot, so a
//! bad reload can never take the proxy down.

use std::{
    collections::{BTreeSet, HashMap},
    sync::atomic::{AtomicU64, Ordering},
    sync::Arc,
    time::Duration,
};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use url::Url;

use crate::error::ProxyError;

/// Definition of a single upstream provider.
///
/// Deserialized from the `PROVIDERS_CONFIG` JSON array. Per-provider knobs
/// (`timeout`, `max_failures`, `max_retries`, `test_model`) are optional and
/// fall back to the snapshot-wide defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSpec {
    /// Unique provider name, e.g. `openai`, `deepseek`.
    pub name: String,

    /// URL path segment that routes to this provider. Must match `[a-z0-9-]+`.
    pub path: String,

    /// Absolute `http(s)` base URL of the upstream API.
    pub base_url: String,

    /// Credential pool for this provider.
    #[serde(default)]
    pub api_keys: Vec<String>,

    /// Dedicated key for `/v1/models` requests. Empty means "rotate".
    #[serde(default)]
    pub model_request_key: String,

    /// Extra headers merged into every outbound request (override on clash).
    #[serde(default)]
    pub custom_headers: HashMap<String, String>,

    /// Per-attempt timeout in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,

    /// Consecutive failures before a credential is quarantined.
    #[serde(default)]
    pub max_failures: Option<u32>,

    /// Additional attempts after the first one.
    #[serde(default)]
    pub max_retries: Option<u32>,

    /// Model used by the prober to validate quarantined credentials.
    #[serde(default)]
    pub test_model: Option<String>,

    /// Whether the code-execution tool is advertised for this provider.
    #[serde(default)]
    pub tools_code_execution_enabled: bool,

    /// Disabled providers stay resolvable but reject requests.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl ProviderSpec {
    /// Per-attempt timeout, falling back to the snapshot default.
    #[must_use]
    pub fn timeout(&self, snapshot: &ConfigSnapshot) -> Duration {
        Duration::from_secs(self.timeout.unwrap_or(snapshot.timeout_seconds))
    }

    /// Failure threshold, falling back to the snapshot default.
    #[must_use]
    pub fn max_failures(&self, snapshot: &ConfigSnapshot) -> u32 {
        self.max_failures.unwrap_or(snapshot.max_failures)
    }

    /// Retry budget, falling back to the snapshot default.
    #[must_use]
    pub fn max_retries(&self, snapshot: &ConfigSnapshot) -> u32 {
        self.max_retries.unwrap_or(snapshot.max_retries)
    }

    /// Base URL without a trailing slash, ready for path concatenation.
    #[must_use]
    pub fn trimmed_base_url(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }
}

/// Immutable bundle of every tunable, published as a whole.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigSnapshot {
    /// Bearer tokens permitted to call the proxy.
    pub allowed_tokens: Vec<String>,
    /// Admin token; defaults to the first allowed token.
    pub auth_token: String,
    /// Name of the provider serving bare `/v1/...` paths.
    pub default_provider: String,
    /// Ordered provider definitions.
    pub providers: Vec<ProviderSpec>,

    /// Global credential failure threshold.
    pub max_failures: u32,
    /// Global retry budget (attempts = retries + 1).
    pub max_retries: u32,
    /// Global per-attempt timeout in seconds.
    pub timeout_seconds: u64,
    /// Global probe model.
    pub test_model: String,

    /// Outbound egress proxy URIs (HTTP or SOCKS5).
    pub proxies: Vec<String>,
    pub proxy_auto_check_enabled: bool,
    /// Seconds between egress probe rounds.
    pub proxy_check_interval: u64,
    pub proxy_max_failures: u32,
    pub proxy_check_url: String,
    /// Seconds before an egress probe is abandoned.
    pub proxy_check_timeout: u64,

    /// Model ids hidden from `/v1/models` responses.
    pub filtered_models: BTreeSet<String>,
    /// Whether error records capture the request body.
    pub error_log_record_request_body: bool,
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        Self {
            allowed_tokens: Vec::new(),
            auth_token: String::new(),
            default_provider: "default".to_string(),
            providers: Vec::new(),
            max_failures: 3,
            max_retries: 3,
            timeout_seconds: 300,
            test_model: "gpt-3.5-turbo".to_string(),
            proxies: Vec::new(),
            proxy_auto_check_enabled: false,
            proxy_check_interval: 300,
            proxy_max_failures: 3,
            proxy_check_url: "https://www.gstatic.com/generate_204".to_string(),
            proxy_check_timeout: 10,
            filtered_models: BTreeSet::new(),
            error_log_record_request_body: false,
        }
    }
}

impl ConfigSnapshot {
    /// Parses a snapshot from the flat key/value surface.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::ConfigInvalid`] when a value fails to parse or
    /// the assembled snapshot fails [`validate`](Self::validate).
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self, ProxyError> {
        let mut snapshot = Self {
            allowed_tokens: parse_list(map.get("ALLOWED_TOKENS"))?,
            ..Self::default()
        };

        if let Some(raw) = nonempty(map.get("DEFAULT_PROVIDER")) {
            snapshot.default_provider = raw.to_string();
        }
        snapshot.max_failures = parse_num(map, "MAX_FAILURES", snapshot.max_failures)?;
        snapshot.max_retries = parse_num(map, "MAX_RETRIES", snapshot.max_retries)?;
        snapshot.timeout_seconds = parse_num(map, "TIMEOUT_SECONDS", snapshot.timeout_seconds)?;
        if let Some(model) = nonempty(map.get("TEST_MODEL")) {
            snapshot.test_model = model.to_string();
        }

        snapshot.proxies = parse_list(map.get("PROXIES"))?;
        snapshot.proxy_auto_check_enabled =
            parse_bool(map, "PROXY_AUTO_CHECK_ENABLED", snapshot.proxy_auto_check_enabled)?;
        snapshot.proxy_check_interval =
            parse_num(map, "PROXY_CHECK_INTERVAL", snapshot.proxy_check_interval)?;
        snapshot.proxy_max_failures =
            parse_num(map, "PROXY_MAX_FAILURES", snapshot.proxy_max_failures)?;
        if let Some(url) = nonempty(map.get("PROXY_CHECK_URL")) {
            snapshot.proxy_check_url = url.to_string();
        }
        snapshot.proxy_check_timeout =
            parse_num(map, "PROXY_CHECK_TIMEOUT", snapshot.proxy_check_timeout)?;

        snapshot.filtered_models = parse_list(map.get("FILTERED_MODELS"))?.into_iter().collect();
        snapshot.error_log_record_request_body = parse_bool(
            map,
            "ERROR_LOG_RECORD_REQUEST_BODY",
            snapshot.error_log_record_request_body,
        )?;

        snapshot.providers = assemble_providers(map)?;

        snapshot.auth_token = match nonempty(map.get("AUTH_TOKEN")) {
            Some(token) => token.to_string(),
            None => snapshot.allowed_tokens.first().cloned().unwrap_or_default(),
        };

        snapshot.validate()?;
        Ok(snapshot)
    }

    /// Parses a snapshot straight from the process environment.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`from_map`](Self::from_map).
    pub fn from_env() -> Result<Self, ProxyError> {
        let map: HashMap<String, String> = std::env::vars().collect();
        Self::from_map(&map)
    }

    /// Looks up a provider definition by name.
    #[must_use]
    pub fn provider(&self, name: &str) -> Option<&ProviderSpec> {
        self.providers.iter().find(|p| p.name == name)
    }

    /// Structural validation, applied before a snapshot may be published.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::ConfigInvalid`] naming the first violated rule.
    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.allowed_tokens.is_empty() {
            return Err(invalid("ALLOWED_TOKENS must contain at least one token"));
        }
        if self.providers.is_empty() {
            return Err(invalid(
                "no providers configured; set PROVIDERS_CONFIG or BASE_URL/API_KEYS",
            ));
        }

        let mut names = BTreeSet::new();
        for provider in &self.providers {
            if !names.insert(provider.name.as_str()) {
                return Err(invalid(format!("duplicate provider name '{}'", provider.name)));
            }
            if provider.path.is_empty() ||
                !provider
                    .path
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            {
                return Err(invalid(format!(
                    "provider '{}' path '{}' must match [a-z0-9-]+",
                    provider.name, provider.path
                )));
            }
            let url = Url::parse(&provider.base_url).map_err(|e| {
                invalid(format!("provider '{}' base_url: {e}", provider.name))
            })?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(invalid(format!(
                    "provider '{}' base_url must be http(s), got '{}'",
                    provider.name,
                    url.scheme()
                )));
            }
        }

        if self.provider(&self.default_provider).is_none() {
            return Err(invalid(format!(
                "default provider '{}' is not defined",
                self.default_provider
            )));
        }

        for proxy in &self.proxies {
            let url = Url::parse(proxy).map_err(|e| invalid(format!("proxy '{proxy}': {e}")))?;
            if !matches!(url.scheme(), "http" | "https" | "socks5" | "socks5h") {
                return Err(invalid(format!(
                    "proxy '{proxy}' must be http(s) or socks5, got '{}'",
                    url.scheme()
                )));
            }
        }

        Ok(())
    }

    /// Egress probe round interval.
    #[must_use]
    pub fn proxy_check_interval(&self) -> Duration {
        Duration::from_secs(self.proxy_check_interval.max(1))
    }

    /// Egress probe per-attempt timeout.
    #[must_use]
    pub fn proxy_check_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy_check_timeout.max(1))
    }
}

/// Builds the provider list: implicit `default` from the flat pair, then
/// `PROVIDERS_CONFIG` entries replacing same-named providers and appending
/// the rest in their declared order.
fn assemble_providers(map: &HashMap<String, String>) -> Result<Vec<ProviderSpec>, ProxyError> {
    let flat_keys = parse_list(map.get("API_KEYS"))?;
    let mut providers: Vec<ProviderSpec> = Vec::new();

    if !flat_keys.is_empty() {
        providers.push(ProviderSpec {
            name: "default".to_string(),
            path: "default".to_string(),
            base_url: nonempty(map.get("BASE_URL"))
                .unwrap_or("https://api.openai.com/v1")
                .to_string(),
            api_keys: flat_keys,
            model_request_key: map.get("MODEL_REQUEST_KEY").cloned().unwrap_or_default(),
            custom_headers: parse_object(map.get("CUSTOM_HEADERS"))?,
            timeout: None,
            max_failures: None,
            max_retries: None,
            test_model: None,
            tools_code_execution_enabled: false,
            enabled: true,
        });
    }

    if let Some(raw) = nonempty(map.get("PROVIDERS_CONFIG")) {
        let configured: Vec<ProviderSpec> = serde_json::from_str(raw)
            .map_err(|e| invalid(format!("PROVIDERS_CONFIG: {e}")))?;
        for spec in configured {
            if let Some(existing) = providers.iter_mut().find(|p| p.name == spec.name) {
                *existing = spec;
            } else {
                providers.push(spec);
            }
        }
    }

    Ok(providers)
}

fn invalid(msg: impl Into<String>) -> ProxyError {
    ProxyError::ConfigInvalid(msg.into())
}

fn nonempty(value: Option<&String>) -> Option<&str> {
    value.map(String::as_str).filter(|v| !v.trim().is_empty())
}

/// JSON array or comma-separated string into a list; empty entries dropped.
fn parse_list(value: Option<&String>) -> Result<Vec<String>, ProxyError> {
    let Some(raw) = nonempty(value) else {
        return Ok(Vec::new());
    };
    if raw.trim_start().starts_with('[') {
        serde_json::from_str(raw).map_err(|e| invalid(format!("expected JSON array: {e}")))
    } else {
        Ok(raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect())
    }
}

/// JSON object into a string map; absent or empty means no entries.
fn parse_object(value: Option<&String>) -> Result<HashMap<String, String>, ProxyError> {
    match nonempty(value) {
        Some(raw) => {
            serde_json::from_str(raw).map_err(|e| invalid(format!("expected JSON object: {e}")))
        }
        None => Ok(HashMap::new()),
    }
}

fn parse_bool(
    map: &HashMap<String, String>,
    key: &str,
    default: bool,
) -> Result<bool, ProxyError> {
    match nonempty(map.get(key)) {
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            other => Err(invalid(format!("{key}: expected a boolean, got '{other}'"))),
        },
        None => Ok(default),
    }
}

fn parse_num<T: std::str::FromStr>(
    map: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ProxyError> {
    match nonempty(map.get(key)) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| invalid(format!("{key}: expected a number, got '{raw}'"))),
        None => Ok(default),
    }
}

/// Process-wide configuration handle.
///
/// Readers load the current snapshot lock-free via `ArcSwap`; writers build a
/// new snapshot off-line and publish it with a single pointer swap. Each
/// successful publish bumps a version counter observable through a watch
/// channel, which is how the prober learns about interval changes without
/// polling the snapshot itself.
pub struct ConfigStore {
    current: ArcSwap<ConfigSnapshot>,
    version: AtomicU64,
    changes: watch::Sender<u64>,
}

impl ConfigStore {
    #[must_use]
    pub fn new(initial: ConfigSnapshot) -> Self {
        let (changes, _) = watch::channel(0);
        Self { current: ArcSwap::from_pointee(initial), version: AtomicU64::new(0), changes }
    }

    /// Current snapshot. Requests hold the returned `Arc` for their whole
    /// lifetime, so a concurrent publish never changes what they see.
    #[must_use]
    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.current.load_full()
    }

    /// Atomically replaces the active snapshot.
    ///
    /// Publishing a snapshot equal to the active one is a no-op and returns
    /// the current version unchanged.
    pub fn publish(&self, snapshot: ConfigSnapshot) -> u64 {
        if *self.current.load().as_ref() == snapshot {
            return self.version.load(Ordering::Acquire);
        }
        self.current.store(Arc::new(snapshot));
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        let _ = self.changes.send(version);
        tracing::info!(version, "configuration snapshot published");
        version
    }

    /// Subscribes to publish notifications; the value is the new version.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }
}
