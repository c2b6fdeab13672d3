//! Rotating resource pools with failure accounting.
//!
//! Two pools share the same discipline: a round-robin cursor over enabled
//! entries, per-entry consecutive-failure counters, and a quarantine set for
//! entries past their threshold. [`credential`] rotates per-provider API
//! keys; [`egress`] rotates outbound proxies with a `Direct` sentinel that
//! can never be quarantined.

pub mod credential;
pub mod egress;

pub use credential::{CredentialLease, CredentialPool, CredentialStatus};
pub use egress::{Egress, EgressLease, EgressPool, EgressStatus};

/// How a leased resource performed.
///
/// `Success` clears the failure counter. `TransientFailure` and `AuthFailure`
/// each count one strike. `FatalFailure` jumps straight to the threshold:
/// the resource is structurally unusable and further attempts are wasted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    TransientFailure,
    AuthFailure,
    FatalFailure,
}
