//! Non-blocking collection of request and error records.
//!
//! The sink is a pair of fixed-size ring buffers. Producers (the dispatcher
//! and the probers) enqueue under a short lock and never wait; when a buffer
//! is full the oldest record is evicted. An external persistence collaborator
//! drains the buffers on its own schedule.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// One failed upstream interaction.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub provider: String,
    /// Short hash of the credential; raw values never leave the pools.
    pub credential_digest: String,
    pub egress: String,
    pub status: Option<u16>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// One completed (or abandoned) inbound request attempt.
#[derive(Debug, Clone, Serialize)]
pub struct RequestRecord {
    pub provider: String,
    pub model: Option<String>,
    pub status: Option<u16>,
    pub latency_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Bounded, drop-oldest record buffers.
pub struct ObservabilitySink {
    errors: RwLock<VecDeque<ErrorRecord>>,
    requests: RwLock<VecDeque<RequestRecord>>,
    capacity: usize,
}

impl ObservabilitySink {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            errors: RwLock::new(VecDeque::with_capacity(capacity)),
            requests: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn record_error(&self, record: ErrorRecord) {
        let mut errors = self.errors.write();
        if errors.len() == self.capacity {
            errors.pop_front();
        }
        errors.push_back(record);
    }

    pub fn record_request(&self, record: RequestRecord) {
        let mut requests = self.requests.write();
        if requests.len() == self.capacity {
            requests.pop_front();
        }
        requests.push_back(record);
    }

    /// Removes and returns every buffered error record, oldest first.
    #[must_use]
    pub fn drain_errors(&self) -> Vec<ErrorRecord> {
        self.errors.write().drain(..).collect()
    }

    /// Removes and returns every buffered request record, oldest first.
    #[must_use]
    pub fn drain_requests(&self) -> Vec<RequestRecord> {
        self.requests.write().drain(..).collect()
    }

    /// Most recent error records, newest first, for the admin status view.
    #[must_use]
    pub fn recent_errors(&self, limit: usize) -> Vec<ErrorRecord> {
        self.errors.read().iter().rev().take(limit).cloned().collect()
    }

    #[must_use]
    pub fn error_count(&self) -> usize {
        self.errors.read().len()
    }

    #[must_use]
    pub fn request_count(&self) -> usize {
        self.requests.read().len()
    }
}

/// Stable, non-reversible identifier for a credential in logs and records.
#[must_use]
pub fn credential_digest(value: &str) -> String {
    let hash = Sha256::digest(value.as_bytes());
    let mut out = String::with_capacity(16);
    for byte in &hash[..8] {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
