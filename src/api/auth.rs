// =============================================================================
// Bearer Token Authentication — Axum Middleware
// =============================================================================
//
// Extracts and validates a Bearer token from the `Authorization` header.
// The expected admin token is read from the `OTC_ADMIN_TOKEN` environment
// variable at startup. Comparison is performed in constant time to prevent
// timing side-channel attacks.
//
// Usage as an Axum extractor:
//
//   async fn handler(AuthBearer(token): AuthBearer, ...) { ... }
//
// If the token is missing or invalid, the extractor short-circuits the request
// with a 403 Forbidden response before the handler body executes.
//
// Per-user identity (for `place_trade` and the live-tick channel) is
// resolved by `resolve_identity` below rather than a second credential
// scheme: KYC/account auth is explicitly out of scope (spec.md §1), so any
// non-empty bearer token that isn't the admin token names a `User` identity
// equal to the token itself.
// =============================================================================

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

// =============================================================================
// Constant-time comparison
// =============================================================================

/// Compare two byte slices in constant time. Returns `true` if they are
/// identical. The comparison always examines every byte of both slices even
/// when a mismatch is found early, preventing timing side-channels.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Who a validated token identifies as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Admin,
    User(String),
}

impl Identity {
    pub fn user_id(&self) -> &str {
        match self {
            Identity::Admin => "admin",
            Identity::User(id) => id,
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Identity::Admin)
    }
}

/// Resolve a bearer token presented on the live-tick channel or a trading
/// request to an `Identity`. The admin token (from `OTC_ADMIN_TOKEN`) maps to
/// `Identity::Admin`; any other non-empty token is a user id.
pub fn resolve_identity(token: &str) -> Option<Identity> {
    if token.is_empty() {
        return None;
    }
    let admin_token = std::env::var("OTC_ADMIN_TOKEN").unwrap_or_default();
    if !admin_token.is_empty() && constant_time_eq(token.as_bytes(), admin_token.as_bytes()) {
        return Some(Identity::Admin);
    }
    Some(Identity::User(token.to_string()))
}

// =============================================================================
// Extractor
// =============================================================================

/// Axum extractor that validates the `Authorization: Bearer <token>` header
/// against the `OTC_ADMIN_TOKEN` environment variable. Only admins pass this
/// extractor; regular user identity goes through `resolve_identity` instead.
pub struct AuthBearer(pub String);

/// Rejection type returned when authentication fails.
pub struct AuthRejection {
    status: StatusCode,
    message: &'static str,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, axum::Json(body)).into_response()
    }
}

impl<S> FromRequestParts<S> for AuthBearer
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let expected = std::env::var("OTC_ADMIN_TOKEN").unwrap_or_default();

        if expected.is_empty() {
            warn!("OTC_ADMIN_TOKEN is not set — all admin requests will be rejected");
            return Err(AuthRejection {
                status: StatusCode::FORBIDDEN,
                message: "Server authentication not configured",
            });
        }

        let auth_header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());

        let token = match auth_header {
            Some(value) if value.starts_with("Bearer ") => &value[7..],
            _ => {
                warn!("Missing or malformed Authorization header");
                return Err(AuthRejection {
                    status: StatusCode::FORBIDDEN,
                    message: "Missing or invalid authorization token",
                });
            }
        };

        if !constant_time_eq(token.as_bytes(), expected.as_bytes()) {
            warn!("Invalid admin token presented");
            return Err(AuthRejection {
                status: StatusCode::FORBIDDEN,
                message: "Invalid authorization token",
            });
        }

        Ok(AuthBearer(token.to_string()))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_identical() {
        assert!(constant_time_eq(b"hello", b"hello"));
    }

    #[test]
    fn constant_time_eq_different() {
        assert!(!constant_time_eq(b"hello", b"world"));
    }

    #[test]
    fn constant_time_eq_different_lengths() {
        assert!(!constant_time_eq(b"short", b"longer_string"));
    }

    #[test]
    fn constant_time_eq_empty() {
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn constant_time_eq_single_bit_diff() {
        assert!(!constant_time_eq(b"\x00", b"\x01"));
    }

    #[test]
    fn resolve_identity_rejects_empty_token() {
        assert!(resolve_identity("").is_none());
    }

    #[test]
    fn resolve_identity_names_a_user_for_any_other_token() {
        // SAFETY-equivalent: tests run single-threaded per process in this
        // module's scope; no other test here touches OTC_ADMIN_TOKEN.
        std::env::remove_var("OTC_ADMIN_TOKEN");
        let identity = resolve_identity("alice-token").unwrap();
        assert_eq!(identity, Identity::User("alice-token".to_string()));
        assert!(!identity.is_admin());
    }
}
