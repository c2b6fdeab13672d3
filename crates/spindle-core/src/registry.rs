//! Provider lookup and inbound path normalization.
//!
//! The registry maps provider names and URL path prefixes onto provider
//! records, each bundling its spec with its credential pool. The whole
//! mapping is swapped atomically on reconfiguration; requests that resolved
//! against the previous mapping keep their `Arc`ed provider (and its pool)
//! alive until they finish, so a reload never yanks state out from under an
//! in-flight request.

use std::{collections::HashMap, sync::Arc};

use arc_swap::ArcSwap;

use crate::{
    config::{ConfigSnapshot, ProviderSpec},
    error::ProxyError,
    pool::CredentialPool,
};

/// Inbound path style. `/hf` and `/openai` prefixes exist for client
/// compatibility; all three surfaces accept identical OpenAI-shaped bodies
/// and differ only in header passthrough.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Surface {
    Native,
    Hf,
    OpenAi,
}

impl Surface {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::Hf => "hf",
            Self::OpenAi => "openai",
        }
    }
}

/// A configured provider together with its credential pool.
pub struct Provider {
    pub spec: ProviderSpec,
    pub credentials: CredentialPool,
}

/// Outcome of path resolution.
pub struct Resolved {
    pub provider: Arc<Provider>,
    /// The upstream-facing remainder, always starting with `/v1`.
    pub remaining: String,
    pub surface: Surface,
}

struct Inner {
    default_name: String,
    order: Vec<Arc<Provider>>,
    by_name: HashMap<String, Arc<Provider>>,
    by_path: HashMap<String, Arc<Provider>>,
}

/// Name/path to provider mapping behind an atomic pointer swap.
pub struct ProviderRegistry {
    inner: ArcSwap<Inner>,
}

impl ProviderRegistry {
    #[must_use]
    pub fn new(snapshot: &ConfigSnapshot) -> Self {
        let registry = Self {
            inner: ArcSwap::from_pointee(Inner {
                default_name: snapshot.default_provider.clone(),
                order: Vec::new(),
                by_name: HashMap::new(),
                by_path: HashMap::new(),
            }),
        };
        registry.reload(snapshot);
        registry
    }

    /// Rebuilds the mapping from a new snapshot and swaps it in atomically.
    ///
    /// Credential pools carry their failure counters, quarantine state, and
    /// cursor forward for providers that survive the reconfiguration, so a
    /// reload never resurrects known-bad keys.
    pub fn reload(&self, snapshot: &ConfigSnapshot) {
        let prev = self.inner.load();
        let mut order = Vec::with_capacity(snapshot.providers.len());
        let mut by_name = HashMap::new();
        let mut by_path = HashMap::new();

        for spec in &snapshot.providers {
            let max_failures = spec.max_failures(snapshot);
            let pool = match prev.by_name.get(&spec.name) {
                Some(old) => CredentialPool::with_state(
                    &spec.name,
                    &spec.api_keys,
                    max_failures,
                    &old.credentials,
                ),
                None => CredentialPool::new(&spec.name, &spec.api_keys, max_failures),
            };
            let provider = Arc::new(Provider { spec: spec.clone(), credentials: pool });
            by_name.insert(spec.name.clone(), Arc::clone(&provider));
            by_path.insert(spec.path.clone(), Arc::clone(&provider));
            order.push(provider);
        }

        self.inner.store(Arc::new(Inner {
            default_name: snapshot.default_provider.clone(),
            order,
            by_name,
            by_path,
        }));
        tracing::info!(providers = snapshot.providers.len(), "provider registry reloaded");
    }

    /// Resolves an inbound URL path to a provider.
    ///
    /// Normalization, in order:
    ///
    /// 1. Strip one leading `/hf` or `/openai` prefix and remember it as the
    ///    surface.
    /// 2. A remainder starting with `/v1` selects the default provider.
    /// 3. Otherwise the first segment is a provider `path`; the rest (which
    ///    must itself start with `/v1`) is the upstream remainder.
    ///
    /// # Errors
    ///
    /// [`ProxyError::ProviderNotFound`] when no provider matches,
    /// [`ProxyError::ProviderDisabled`] when the match is switched off.
    pub fn resolve(&self, path: &str) -> Result<Resolved, ProxyError> {
        let inner = self.inner.load();

        let (surface, rest) = strip_surface(path);

        let (provider, remaining) = if is_v1(rest) {
            let provider = inner
                .by_name
                .get(&inner.default_name)
                .ok_or_else(|| ProxyError::ProviderNotFound(inner.default_name.clone()))?;
            (provider, rest.to_string())
        } else {
            let segment = rest.trim_start_matches('/');
            let (head, tail) = match segment.find('/') {
                Some(pos) => (&segment[..pos], &segment[pos..]),
                None => (segment, ""),
            };
            let provider = inner
                .by_path
                .get(head)
                .filter(|_| is_v1(tail))
                .ok_or_else(|| ProxyError::ProviderNotFound(head.to_string()))?;
            (provider, tail.to_string())
        };

        if !provider.spec.enabled {
            return Err(ProxyError::ProviderDisabled(provider.spec.name.clone()));
        }

        Ok(Resolved { provider: Arc::clone(provider), remaining, surface })
    }

    /// Looks a provider up by name.
    #[must_use]
    pub fn provider(&self, name: &str) -> Option<Arc<Provider>> {
        self.inner.load().by_name.get(name).cloned()
    }

    /// All providers in configuration order.
    #[must_use]
    pub fn list_providers(&self) -> Vec<Arc<Provider>> {
        self.inner.load().order.clone()
    }

    /// Clears `bound_egress` affinities referencing a quarantined egress in
    /// every provider pool. Returns the number of bindings cleared.
    pub fn clear_egress_bindings(&self, egress_uri: &str) -> usize {
        let inner = self.inner.load();
        inner
            .order
            .iter()
            .map(|p| p.credentials.clear_egress_bindings(egress_uri))
            .sum()
    }
}

/// Splits one optional surface prefix off the path.
fn strip_surface(path: &str) -> (Surface, &str) {
    for (prefix, surface) in [("/hf", Surface::Hf), ("/openai", Surface::OpenAi)] {
        if let Some(rest) = path.strip_prefix(prefix) {
            if rest.is_empty() || rest.starts_with('/') {
                return (surface, rest);
            }
        }
    }
    (Surface::Native, path)
}

/// Whether a remainder addresses the versioned API root.
fn is_v1(path: &str) -> bool {
    path == "/v1" || path.starts_with("/v1/")
}
