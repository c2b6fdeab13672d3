use std::{collections::HashSet, fmt, sync::Arc, time::Instant};

use parking_lot::Mutex;

use super::Outcome;

/// An outbound network path: a configured forward proxy, or the host's own
/// connectivity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Egress {
    Direct,
    Proxy(Arc<str>),
}

impl Egress {
    #[must_use]
    pub fn is_direct(&self) -> bool {
        matches!(self, Self::Direct)
    }

    /// Stable label used in logs and records.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Direct => "direct",
            Self::Proxy(uri) => uri,
        }
    }
}

impl fmt::Display for Egress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pool of outbound proxies with the same strike discipline as the
/// credential pool, plus two differences: the `Direct` sentinel is always
/// available and never quarantined, and quarantining a proxy clears every
/// credential affinity bound to it (the pool queues the cleared URIs so the
/// registry can propagate the unbind across provider pools).
///
/// Like [`super::CredentialPool`], this is a cheap-clone handle over shared
/// state.
#[derive(Clone)]
pub struct EgressPool {
    shared: Arc<Mutex<Inner>>,
}

struct Inner {
    entries: Vec<Entry>,
    cursor: usize,
    max_failures: u32,
    newly_disabled: Vec<Arc<str>>,
}

struct Entry {
    uri: Arc<str>,
    consecutive_failures: u32,
    disabled_since: Option<Instant>,
    bound_credentials: HashSet<Arc<str>>,
}

impl Entry {
    fn new(uri: &str) -> Self {
        Self {
            uri: Arc::from(uri),
            consecutive_failures: 0,
            disabled_since: None,
            bound_credentials: HashSet::new(),
        }
    }

    fn enabled(&self) -> bool {
        self.disabled_since.is_none()
    }
}

/// Point-in-time view of one proxy, for the admin status surface.
#[derive(Debug, Clone)]
pub struct EgressStatus {
    pub uri: Arc<str>,
    pub consecutive_failures: u32,
    pub disabled: bool,
    pub bound_credentials: usize,
}

impl EgressPool {
    #[must_use]
    pub fn new(proxies: &[String], max_failures: u32) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Inner {
                entries: proxies.iter().map(|p| Entry::new(p)).collect(),
                cursor: 0,
                max_failures: max_failures.max(1),
                newly_disabled: Vec::new(),
            })),
        }
    }

    /// Applies a new proxy list in place, keeping strike state for URIs that
    /// survive and dropping state (and bindings) for URIs that were removed.
    pub fn reload(&self, proxies: &[String], max_failures: u32) {
        let mut inner = self.shared.lock();
        let mut entries = Vec::with_capacity(proxies.len());
        for uri in proxies {
            match inner.entries.iter().position(|e| e.uri.as_ref() == uri.as_str()) {
                Some(idx) => entries.push(inner.entries.swap_remove(idx)),
                None => entries.push(Entry::new(uri)),
            }
        }
        inner.entries = entries;
        inner.cursor = 0;
        inner.max_failures = max_failures.max(1);
        tracing::info!(proxies = inner.entries.len(), "egress pool reloaded");
    }

    /// Leases the next enabled proxy in rotation; with no proxies configured
    /// or every proxy quarantined, leases `Direct`, which is always
    /// available.
    #[must_use]
    pub fn acquire(&self) -> EgressLease {
        let mut inner = self.shared.lock();
        let len = inner.entries.len();
        for offset in 0..len {
            let idx = (inner.cursor + offset) % len;
            if inner.entries[idx].enabled() {
                inner.cursor = (idx + 1) % len;
                let uri = Arc::clone(&inner.entries[idx].uri);
                return EgressLease { pool: self.clone(), egress: Egress::Proxy(uri), done: false };
            }
        }
        EgressLease { pool: self.clone(), egress: Egress::Direct, done: false }
    }

    fn release(&self, egress: &Egress, outcome: Outcome) {
        let Egress::Proxy(uri) = egress else {
            // Direct carries no strike state.
            return;
        };
        let mut inner = self.shared.lock();
        match outcome {
            Outcome::Success => {
                if let Some(entry) = inner.entries.iter_mut().find(|e| e.uri == *uri) {
                    entry.consecutive_failures = 0;
                }
            }
            Outcome::TransientFailure | Outcome::AuthFailure | Outcome::FatalFailure => {
                strike(&mut inner, uri);
            }
        }
    }

    /// Records a successful probe: counter cleared and, if the proxy was
    /// quarantined, it rejoins the rotation.
    pub fn record_probe_success(&self, uri: &str) {
        let mut inner = self.shared.lock();
        if let Some(entry) = inner.entries.iter_mut().find(|e| e.uri.as_ref() == uri) {
            if entry.disabled_since.is_some() {
                tracing::info!(proxy = uri, "egress proxy re-enabled after successful probe");
            }
            entry.consecutive_failures = 0;
            entry.disabled_since = None;
        }
    }

    /// Records a failed probe. Returns `true` when this strike quarantined
    /// the proxy.
    pub fn record_probe_failure(&self, uri: &str) -> bool {
        let mut inner = self.shared.lock();
        let Some(uri) =
            inner.entries.iter().find(|e| e.uri.as_ref() == uri).map(|e| Arc::clone(&e.uri))
        else {
            return false;
        };
        strike(&mut inner, &uri)
    }

    /// Drains the queue of proxies quarantined since the last call. The
    /// caller clears matching `bound_egress` affinities in every credential
    /// pool.
    #[must_use]
    pub fn take_newly_disabled(&self) -> Vec<Arc<str>> {
        std::mem::take(&mut self.shared.lock().newly_disabled)
    }

    /// Records a credential affinity on the proxy side.
    pub fn bind_credential(&self, uri: &str, credential: &str) {
        let mut inner = self.shared.lock();
        if let Some(entry) = inner.entries.iter_mut().find(|e| e.uri.as_ref() == uri) {
            entry.bound_credentials.insert(Arc::from(credential));
        }
    }

    /// All configured proxy URIs, quarantined or not. `Direct` is not listed
    /// and is never probed.
    #[must_use]
    pub fn proxy_uris(&self) -> Vec<Arc<str>> {
        self.shared.lock().entries.iter().map(|e| Arc::clone(&e.uri)).collect()
    }

    #[must_use]
    pub fn enabled_count(&self) -> usize {
        self.shared.lock().entries.iter().filter(|e| e.enabled()).count()
    }

    #[must_use]
    pub fn status(&self) -> Vec<EgressStatus> {
        let inner = self.shared.lock();
        inner
            .entries
            .iter()
            .map(|e| EgressStatus {
                uri: Arc::clone(&e.uri),
                consecutive_failures: e.consecutive_failures,
                disabled: !e.enabled(),
                bound_credentials: e.bound_credentials.len(),
            })
            .collect()
    }

    #[cfg(test)]
    fn is_disabled(&self, uri: &str) -> bool {
        let inner = self.shared.lock();
        inner.entries.iter().find(|e| e.uri.as_ref() == uri).is_some_and(|e| !e.enabled())
    }
}

/// Strikes a proxy; on reaching the threshold it is quarantined, its
/// credential bindings are dropped, and the URI is queued for cross-pool
/// unbinding. Returns `true` when the proxy was newly quarantined.
fn strike(inner: &mut Inner, uri: &Arc<str>) -> bool {
    let max_failures = inner.max_failures;
    let Some(entry) = inner.entries.iter_mut().find(|e| e.uri == *uri) else {
        return false;
    };
    entry.consecutive_failures = (entry.consecutive_failures + 1).min(max_failures);
    if entry.consecutive_failures >= max_failures && entry.disabled_since.is_none() {
        entry.disabled_since = Some(Instant::now());
        let unbound = entry.bound_credentials.len();
        entry.bound_credentials.clear();
        tracing::warn!(
            proxy = %entry.uri,
            unbound,
            "egress proxy quarantined, credential bindings cleared"
        );
        let uri = Arc::clone(&entry.uri);
        inner.newly_disabled.push(uri);
        return true;
    }
    false
}

/// RAII lease over one egress path. Same settlement rules as the credential
/// lease: dropped without completion counts as a transient failure (a no-op
/// for `Direct`).
pub struct EgressLease {
    pool: EgressPool,
    egress: Egress,
    done: bool,
}

impl EgressLease {
    #[must_use]
    pub fn egress(&self) -> &Egress {
        &self.egress
    }

    pub fn complete(mut self, outcome: Outcome) {
        self.done = true;
        self.pool.release(&self.egress, outcome);
    }
}

impl Drop for EgressLease {
    fn drop(&mut self) {
        if !self.done {
            self.pool.release(&self.egress, Outcome::TransientFailure);
        }
    }
}
