use http::StatusCode;
use thiserror::Error;

/// Errors surfaced by the proxy core.
///
/// Every variant maps onto a stable error kind: auth failures from the gate,
/// resolution failures from the registry, pool exhaustion, classified upstream
/// outcomes, and terminal retry exhaustion. Variants carry only what the
/// client response or the error log needs.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProxyError {
    /// Inbound token missing or not in the allowed set.
    #[error("Unauthorized")]
    Unauthorized,

    /// Token is allowed but lacks admin rights for this route.
    #[error("Forbidden")]
    Forbidden,

    /// No provider matches the requested path.
    #[error("provider not found: {0}")]
    ProviderNotFound(String),

    /// The resolved provider exists but is switched off.
    #[error("provider disabled: {0}")]
    ProviderDisabled(String),

    /// The provider's credential pool is empty or fully quarantined.
    #[error("no credentials available for provider '{0}'")]
    NoCredentials(String),

    /// Upstream rejected the credential (HTTP 401/403).
    #[error("upstream auth failure (HTTP {status})")]
    UpstreamAuthFailure { status: u16, message: String },

    /// Upstream throttled the request (HTTP 429).
    #[error("upstream rate limit: {message}")]
    UpstreamRateLimit { message: String },

    /// Upstream returned a server-side error (HTTP 5xx or 408).
    #[error("upstream server error (HTTP {status})")]
    UpstreamServerError { status: u16, message: String },

    /// Connection to the upstream could not be established.
    #[error("upstream connect error: {0}")]
    UpstreamConnectError(String),

    /// The per-attempt deadline elapsed.
    #[error("upstream timeout after {0}s")]
    UpstreamTimeout(u64),

    /// Upstream returned a non-retryable client error; forwarded verbatim.
    #[error("upstream client error (HTTP {status})")]
    UpstreamClientError { status: u16 },

    /// Every retry attempt failed without a committed response.
    #[error("all upstreams failed")]
    AllUpstreamsFailed { last_status: Option<u16>, last_message: String },

    /// Snapshot validation failed; the previous configuration stays active.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
}

impl ProxyError {
    /// Classifies a non-success upstream status into its error kind.
    ///
    /// 401/403 indict the credential, 429 is throttling, 408 and 5xx are
    /// server-side trouble. Everything else is the client's own error and is
    /// forwarded verbatim rather than retried. This is the single
    /// classification point the dispatcher's retry loop branches on, via
    /// [`is_transient`](Self::is_transient) and
    /// [`penalizes_credential`](Self::penalizes_credential).
    #[must_use]
    pub fn from_upstream_status(status: u16, message: String) -> Self {
        match status {
            401 | 403 => Self::UpstreamAuthFailure { status, message },
            429 => Self::UpstreamRateLimit { message },
            408 | 500..=599 => Self::UpstreamServerError { status, message },
            _ => Self::UpstreamClientError { status },
        }
    }

    /// HTTP status the client receives for this error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::ProviderNotFound(_) => StatusCode::NOT_FOUND,
            Self::ProviderDisabled(_) | Self::NoCredentials(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::AllUpstreamsFailed { .. } |
            Self::UpstreamAuthFailure { .. } |
            Self::UpstreamRateLimit { .. } |
            Self::UpstreamServerError { .. } |
            Self::UpstreamConnectError(_) |
            Self::UpstreamTimeout(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamClientError { status } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_REQUEST)
            }
            Self::ConfigInvalid(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether another attempt against a different credential or egress may
    /// succeed. Only these kinds keep the retry loop going.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::UpstreamAuthFailure { .. } |
                Self::UpstreamRateLimit { .. } |
                Self::UpstreamServerError { .. } |
                Self::UpstreamConnectError(_) |
                Self::UpstreamTimeout(_)
        )
    }

    /// Whether this outcome counts against the credential that carried it.
    ///
    /// Client errors and resolution failures never penalize a credential.
    #[must_use]
    pub fn penalizes_credential(&self) -> bool {
        matches!(
            self,
            Self::UpstreamAuthFailure { .. } |
                Self::UpstreamRateLimit { .. } |
                Self::UpstreamServerError { .. } |
                Self::UpstreamConnectError(_) |
                Self::UpstreamTimeout(_)
        )
    }

    /// The upstream status associated with this error, when one was observed.
    #[must_use]
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            Self::UpstreamAuthFailure { status, .. } |
            Self::UpstreamServerError { status, .. } |
            Self::UpstreamClientError { status } => Some(*status),
            Self::UpstreamRateLimit { .. } => Some(429),
            Self::AllUpstreamsFailed { last_status, .. } => *last_status,
            _ => None,
        }
    }

    /// JSON body rendered to the client for terminal errors.
    ///
    /// `AllUpstreamsFailed` uses the structured shape the admin UI expects;
    /// everything else is a flat `{"error": "..."}` object.
    #[must_use]
    pub fn to_body(&self) -> serde_json::Value {
        match self {
            Self::AllUpstreamsFailed { last_status, last_message } => serde_json::json!({
                "error": {
                    "code": "all_upstreams_failed",
                    "last_status": last_status,
                    "last_message": last_message,
                }
            }),
            other => serde_json::json!({ "error": other.to_string() }),
        }
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            // reqwest does not expose the configured deadline on the error
            Self::UpstreamTimeout(0)
        } else {
            Self::UpstreamConnectError(err.to_string())
        }
    }
}
