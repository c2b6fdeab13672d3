//! # Spindle Core
//!
//! Core library for the spindle reverse proxy: an OpenAI-compatible gateway
//! that rotates per-provider credential pools, retries across credentials and
//! egress proxies, and quarantines resources that keep failing.
//!
//! - **[`config`]**: flat-surface configuration parsed into immutable,
//!   atomically-swapped snapshots with change notifications.
//! - **[`registry`]**: provider name/path resolution and per-provider
//!   credential pools that survive reconfiguration.
//! - **[`pool`]**: round-robin pools with failure accounting for credentials
//!   and egress proxies.
//! - **[`dispatch`]**: the request core: auth, routing, header policy, the
//!   retry loop, and streaming with commit-on-first-byte semantics.
//! - **[`prober`]**: background revalidation of quarantined credentials and
//!   egress proxies.
//! - **[`auth`]**: bearer/cookie token gate with constant-time comparison.
//! - **[`sink`]**: drop-oldest buffers for request and error records.
//!
//! ## Request flow
//!
//! ```text
//! inbound ──► AuthGate ──► ProviderRegistry ──► Dispatcher
//!                                                  │ lease credential + egress
//!                                                  ▼
//!                                           UpstreamClient ──► provider API
//!                                                  │
//!                             2xx: stream back (commit on first byte)
//!                             401/403/5xx/408/429: settle leases, retry
//!                             other 4xx: forward verbatim, no retry
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod pool;
pub mod prober;
pub mod registry;
pub mod sink;

pub use auth::AuthGate;
pub use client::UpstreamClient;
pub use config::{ConfigSnapshot, ConfigStore, ProviderSpec};
pub use dispatch::{Dispatcher, InboundRequest};
pub use error::ProxyError;
pub use pool::{CredentialPool, Egress, EgressPool, Outcome};
pub use prober::HealthProber;
pub use registry::{Provider, ProviderRegistry, Surface};
pub use sink::{ErrorRecord, ObservabilitySink, RequestRecord};
