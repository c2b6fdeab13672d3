use http::{header, HeaderMap};
use subtle::ConstantTimeEq;

use crate::{config::ConfigSnapshot, error::ProxyError};

/// Cookie carrying the admin UI's session token.
const AUTH_COOKIE: &str = "auth_token";

/// Inbound token validation.
///
/// Tokens arrive either as `Authorization: Bearer <t>` or, for the admin UI,
/// as an `auth_token` cookie. Proxy routes require membership in
/// `allowed_tokens`; admin routes additionally require equality with the
/// snapshot's `auth_token`. Comparisons are constant-time.
pub struct AuthGate;

impl AuthGate {
    /// Validates a proxy-route request.
    ///
    /// # Errors
    ///
    /// [`ProxyError::Unauthorized`] when no token is presented or the token
    /// is not in the allowed set.
    pub fn authorize(snapshot: &ConfigSnapshot, headers: &HeaderMap) -> Result<(), ProxyError> {
        let token = Self::token_from(headers).ok_or(ProxyError::Unauthorized)?;
        if snapshot.allowed_tokens.iter().any(|allowed| constant_time_eq(allowed, &token)) {
            Ok(())
        } else {
            Err(ProxyError::Unauthorized)
        }
    }

    /// Validates an admin-route request.
    ///
    /// # Errors
    ///
    /// [`ProxyError::Unauthorized`] without a token,
    /// [`ProxyError::Forbidden`] when the token is not the admin token.
    pub fn authorize_admin(
        snapshot: &ConfigSnapshot,
        headers: &HeaderMap,
    ) -> Result<(), ProxyError> {
        let token = Self::token_from(headers).ok_or(ProxyError::Unauthorized)?;
        if !snapshot.auth_token.is_empty() && constant_time_eq(&snapshot.auth_token, &token) {
            Ok(())
        } else {
            Err(ProxyError::Forbidden)
        }
    }

    /// Extracts the presented token: bearer header first, cookie second.
    #[must_use]
    pub fn token_from(headers: &HeaderMap) -> Option<String> {
        if let Some(value) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
            if let Some(token) = value.strip_prefix("Bearer ").or_else(|| {
                value.strip_prefix("bearer ")
            }) {
                let token = token.trim();
                if !token.is_empty() {
                    return Some(token.to_string());
                }
            }
        }

        headers
            .get(header::COOKIE)
            .and_then(|v| v.to_str().ok())
            .and_then(|cookies| {
                cookies.split(';').find_map(|pair| {
                    let (name, value) = pair.trim().split_once('=')?;
                    (name == AUTH_COOKIE && !value.is_empty()).then(|| value.to_string())
                })
            })
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use std::collections::HashMap;

    fn snapshot() -> ConfigSnapshot {
        let map = HashMap::from([
            ("ALLOWED_TOKENS".to_string(), r#"["tk-user","tk-admin"]"#.to_string()),
            ("AUTH_TOKEN".to_string(), "tk-admin".to_string()),
            ("API_KEYS".to_string(), r#"["sk"]"#.to_string()),
        ]);
        ConfigSnapshot::from_map(&map).unwrap()
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers
    }

    #[test]
    fn allowed_bearer_token_passes() {
        let snapshot = snapshot();
        assert!(AuthGate::authorize(&snapshot, &bearer("tk-user")).is_ok());
        assert!(AuthGate::authorize(&snapshot, &bearer("tk-admin")).is_ok());
    }

    #[test]
    fn unknown_or_missing_token_is_unauthorized() {
        let snapshot = snapshot();
        assert!(matches!(
            AuthGate::authorize(&snapshot, &bearer("tk-wrong")),
            Err(ProxyError::Unauthorized)
        ));
        assert!(matches!(
            AuthGate::authorize(&snapshot, &HeaderMap::new()),
            Err(ProxyError::Unauthorized)
        ));
    }

    #[test]
    fn cookie_token_is_accepted() {
        let snapshot = snapshot();
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; auth_token=tk-user; lang=en"),
        );
        assert!(AuthGate::authorize(&snapshot, &headers).is_ok());
    }

    #[test]
    fn bearer_takes_precedence_over_cookie() {
        let snapshot = snapshot();
        let mut headers = bearer("tk-wrong");
        headers.insert(header::COOKIE, HeaderValue::from_static("auth_token=tk-user"));
        // The bad bearer token is the one evaluated.
        assert!(AuthGate::authorize(&snapshot, &headers).is_err());
    }

    #[test]
    fn admin_requires_the_admin_token() {
        let snapshot = snapshot();
        assert!(AuthGate::authorize_admin(&snapshot, &bearer("tk-admin")).is_ok());
        assert!(matches!(
            AuthGate::authorize_admin(&snapshot, &bearer("tk-user")),
            Err(ProxyError::Forbidden)
        ));
        assert!(matches!(
            AuthGate::authorize_admin(&snapshot, &HeaderMap::new()),
            Err(ProxyError::Unauthorized)
        ));
    }

    #[test]
    fn malformed_authorization_header_is_ignored() {
        let snapshot = snapshot();
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic dXNlcg=="));
        assert!(AuthGate::authorize(&snapshot, &headers).is_err());

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert!(AuthGate::authorize(&snapshot, &headers).is_err());
    }
}
