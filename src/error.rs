// =============================================================================
// Error taxonomy — spec.md §7
// =============================================================================
//
// A closed set of error classes every caller-facing operation can return.
// `Display` messages are safe to surface to API callers directly; internal
// detail (e.g. the underlying sqlite error) is carried via `#[source]` for
// logging but not rendered into the message shown to callers.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Stake out of bounds, unknown symbol, disabled symbol, malformed
    /// request. No state change has occurred.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Missing or invalid authentication credential.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The persistence gateway could not complete a mutation after retrying.
    /// Any in-memory mutation attempted alongside it must already have been
    /// rolled back by the caller before this error is returned.
    #[error("persistence unavailable: {0}")]
    Persistence(String),

    /// The real-price feed for a base symbol has been stale or unreachable.
    #[error("feed outage for {symbol}: {reason}")]
    FeedOutage { symbol: String, reason: String },

    /// Settlement could not obtain a usable exit price; the position was
    /// voided and the stake refunded.
    #[error("settlement failed for position {position_id}: {reason}")]
    Settlement {
        position_id: String,
        reason: String,
    },

    /// An internal invariant was violated (e.g. negative exposure, double
    /// settlement). The offending operation was clamped/ignored and a
    /// high-severity event was emitted; the caller should treat this as a
    /// bug report, not routine control flow.
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl CoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    /// HTTP status code this error class maps to on the REST surface.
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Auth(_) => StatusCode::FORBIDDEN,
            Self::Persistence(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::FeedOutage { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Settlement { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Invariant(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
