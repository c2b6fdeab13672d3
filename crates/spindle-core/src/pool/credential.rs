use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use super::Outcome;

/// Per-provider rotating pool of API credentials.
///
/// Entries keep their insertion order; a cursor walks them round-robin,
/// skipping quarantined entries. All state lives behind one mutex that is
/// held only for pointer-chasing work, never across I/O. The pool is a
/// cheap-clone handle: clones share the same state, which is how leases keep
/// their pool alive across `await` points.
///
/// A pool is created for one configuration snapshot and never resized in
/// place. Reconfiguration builds a replacement with
/// [`with_state`](Self::with_state), which carries failure counters and the
/// cursor forward by credential value so known-bad keys stay quarantined
/// until a prober clears them.
#[derive(Clone)]
pub struct CredentialPool {
    shared: Arc<Shared>,
}

struct Shared {
    provider: Arc<str>,
    max_failures: u32,
    inner: Mutex<Inner>,
}

struct Inner {
    entries: Vec<Entry>,
    cursor: usize,
}

struct Entry {
    value: Arc<str>,
    consecutive_failures: u32,
    disabled_since: Option<Instant>,
    bound_egress: Option<Arc<str>>,
    in_use: u32,
}

impl Entry {
    fn new(value: &str) -> Self {
        Self {
            value: Arc::from(value),
            consecutive_failures: 0,
            disabled_since: None,
            bound_egress: None,
            in_use: 0,
        }
    }

    fn enabled(&self) -> bool {
        self.disabled_since.is_none()
    }
}

/// Point-in-time view of one credential, for the admin status surface.
#[derive(Debug, Clone)]
pub struct CredentialStatus {
    pub value: Arc<str>,
    pub consecutive_failures: u32,
    pub disabled: bool,
    pub in_use: u32,
}

impl CredentialPool {
    #[must_use]
    pub fn new(provider: &str, keys: &[String], max_failures: u32) -> Self {
        Self {
            shared: Arc::new(Shared {
                provider: Arc::from(provider),
                max_failures: max_failures.max(1),
                inner: Mutex::new(Inner {
                    entries: keys.iter().map(|k| Entry::new(k)).collect(),
                    cursor: 0,
                }),
            }),
        }
    }

    /// Builds a replacement pool for a new snapshot, inheriting failure
    /// counters, quarantine timestamps, and egress bindings from `prev` for
    /// credentials whose value is unchanged. The cursor carries over by
    /// value identity when that value survives the reconfiguration.
    #[must_use]
    pub fn with_state(
        provider: &str,
        keys: &[String],
        max_failures: u32,
        prev: &CredentialPool,
    ) -> Self {
        let pool = Self::new(provider, keys, max_failures);
        {
            let prev_inner = prev.shared.inner.lock();
            let mut inner = pool.shared.inner.lock();

            for entry in &mut inner.entries {
                if let Some(old) = prev_inner.entries.iter().find(|e| e.value == entry.value) {
                    entry.consecutive_failures = old.consecutive_failures.min(max_failures);
                    entry.disabled_since = old.disabled_since;
                    entry.bound_egress = old.bound_egress.clone();
                }
            }

            if let Some(at_cursor) = prev_inner.entries.get(prev_inner.cursor) {
                if let Some(idx) = inner.entries.iter().position(|e| e.value == at_cursor.value) {
                    inner.cursor = idx;
                }
            }
            normalize_cursor(&mut inner);
        }
        pool
    }

    #[must_use]
    pub fn provider(&self) -> &str {
        &self.shared.provider
    }

    /// Leases the next enabled credential after the cursor and advances past
    /// it. Two consecutive calls return distinct credentials whenever at
    /// least two are enabled; with a single enabled entry the same one is
    /// handed out again.
    #[must_use]
    pub fn acquire(&self) -> Option<CredentialLease> {
        let mut inner = self.shared.inner.lock();
        let len = inner.entries.len();
        for offset in 0..len {
            let idx = (inner.cursor + offset) % len;
            if inner.entries[idx].enabled() {
                inner.cursor = (idx + 1) % len;
                normalize_cursor(&mut inner);
                inner.entries[idx].in_use += 1;
                let value = Arc::clone(&inner.entries[idx].value);
                return Some(CredentialLease { pool: self.clone(), value, done: false });
            }
        }
        None
    }

    /// Leases the dedicated `/v1/models` credential when one is configured
    /// and currently enabled; otherwise behaves like [`acquire`](Self::acquire).
    ///
    /// The dedicated lease does not advance the rotation cursor.
    #[must_use]
    pub fn model_request_credential(&self, preferred: &str) -> Option<CredentialLease> {
        if !preferred.is_empty() {
            let mut inner = self.shared.inner.lock();
            if let Some(entry) =
                inner.entries.iter_mut().find(|e| e.value.as_ref() == preferred && e.enabled())
            {
                entry.in_use += 1;
                let value = Arc::clone(&entry.value);
                return Some(CredentialLease { pool: self.clone(), value, done: false });
            }
        }
        self.acquire()
    }

    fn release(&self, value: &str, outcome: Outcome) {
        let mut inner = self.shared.inner.lock();
        let max_failures = self.shared.max_failures;
        let Some(entry) = inner.entries.iter_mut().find(|e| e.value.as_ref() == value) else {
            // Lease outlived a reconfiguration that dropped the key.
            return;
        };
        entry.in_use = entry.in_use.saturating_sub(1);

        match outcome {
            Outcome::Success => entry.consecutive_failures = 0,
            Outcome::TransientFailure | Outcome::AuthFailure => {
                entry.consecutive_failures = (entry.consecutive_failures + 1).min(max_failures);
            }
            Outcome::FatalFailure => entry.consecutive_failures = max_failures,
        }

        if entry.consecutive_failures >= max_failures && entry.disabled_since.is_none() {
            entry.disabled_since = Some(Instant::now());
            tracing::warn!(
                provider = %self.shared.provider,
                failures = entry.consecutive_failures,
                "credential quarantined after reaching failure threshold"
            );
        }
        normalize_cursor(&mut inner);
    }

    /// Prober entry point: clears counters and returns the credential to the
    /// rotation.
    pub fn reenable(&self, value: &str) -> bool {
        let mut inner = self.shared.inner.lock();
        let Some(entry) = inner.entries.iter_mut().find(|e| e.value.as_ref() == value) else {
            return false;
        };
        entry.consecutive_failures = 0;
        entry.disabled_since = None;
        tracing::info!(provider = %self.shared.provider, "credential re-enabled by prober");
        true
    }

    /// Pushes a quarantined credential's timestamp forward after a failed
    /// probe, restarting its debounce window.
    pub fn refresh_disabled(&self, value: &str) {
        let mut inner = self.shared.inner.lock();
        if let Some(entry) = inner
            .entries
            .iter_mut()
            .find(|e| e.value.as_ref() == value && e.disabled_since.is_some())
        {
            entry.disabled_since = Some(Instant::now());
        }
    }

    /// Quarantined credentials whose debounce window has elapsed.
    #[must_use]
    pub fn probe_candidates(&self, debounce: Duration) -> Vec<Arc<str>> {
        let inner = self.shared.inner.lock();
        inner
            .entries
            .iter()
            .filter(|e| e.disabled_since.is_some_and(|since| since.elapsed() >= debounce))
            .map(|e| Arc::clone(&e.value))
            .collect()
    }

    /// Records an egress affinity for a credential.
    pub fn bind_egress(&self, value: &str, egress_uri: &str) {
        let mut inner = self.shared.inner.lock();
        if let Some(entry) = inner.entries.iter_mut().find(|e| e.value.as_ref() == value) {
            entry.bound_egress = Some(Arc::from(egress_uri));
        }
    }

    /// Clears every affinity pointing at a disabled egress.
    pub fn clear_egress_bindings(&self, egress_uri: &str) -> usize {
        let mut inner = self.shared.inner.lock();
        let mut cleared = 0;
        for entry in &mut inner.entries {
            if entry.bound_egress.as_deref() == Some(egress_uri) {
                entry.bound_egress = None;
                cleared += 1;
            }
        }
        cleared
    }

    #[must_use]
    pub fn bound_egress(&self, value: &str) -> Option<Arc<str>> {
        let inner = self.shared.inner.lock();
        inner
            .entries
            .iter()
            .find(|e| e.value.as_ref() == value)
            .and_then(|e| e.bound_egress.clone())
    }

    #[must_use]
    pub fn enabled_count(&self) -> usize {
        self.shared.inner.lock().entries.iter().filter(|e| e.enabled()).count()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.inner.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn status(&self) -> Vec<CredentialStatus> {
        let inner = self.shared.inner.lock();
        inner
            .entries
            .iter()
            .map(|e| CredentialStatus {
                value: Arc::clone(&e.value),
                consecutive_failures: e.consecutive_failures,
                disabled: !e.enabled(),
                in_use: e.in_use,
            })
            .collect()
    }

    #[cfg(test)]
    fn failure_count(&self, value: &str) -> Option<u32> {
        let inner = self.shared.inner.lock();
        inner
            .entries
            .iter()
            .find(|e| e.value.as_ref() == value)
            .map(|e| e.consecutive_failures)
    }

    #[cfg(test)]
    fn is_disabled(&self, value: &str) -> bool {
        let inner = self.shared.inner.lock();
        inner
            .entries
            .iter()
            .find(|e| e.value.as_ref() == value)
            .is_some_and(|e| !e.enabled())
    }
}

/// Moves the cursor forward to the next enabled entry so it never rests on a
/// quarantined one (unless the whole pool is quarantined).
fn normalize_cursor(inner: &mut Inner) {
    let len = inner.entries.len();
    if len == 0 {
        inner.cursor = 0;
        return;
    }
    inner.cursor %= len;
    for offset in 0..len {
        let idx = (inner.cursor + offset) % len;
        if inner.entries[idx].enabled() {
            inner.cursor = idx;
            return;
        }
    }
}

/// RAII lease over one credential.
///
/// The holder must settle the lease with [`complete`](Self::complete). A
/// lease dropped without completion (client disconnect before commit, or a
/// panic inside the dispatcher) releases as a transient failure so the
/// in-use count drains and the credential takes one strike.
pub struct CredentialLease {
    pool: CredentialPool,
    value: Arc<str>,
    done: bool,
}

impl CredentialLease {
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Shared handle to the credential value, e.g. for error records.
    #[must_use]
    pub fn value_arc(&self) -> Arc<str> {
        Arc::clone(&self.value)
    }

    /// Settles the lease with the observed outcome.
    pub fn complete(mut self, outcome: Outcome) {
        self.done = true;
        self.pool.release(&self.value, outcome);
    }
}

impl Drop for CredentialLease {
    fn drop(&mut self) {
        if !self.done {
            self.pool.release(&self.value, Outcome::TransientFailure);
        }
    }
}
