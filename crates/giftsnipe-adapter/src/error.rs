/*
[INPUT]:  Failure modes of any marketplace client (transport, venue, auth, decoding)
[OUTPUT]: MarketError with retry and authorization classification
[POS]:    Error handling layer - shared by every MarketClient implementation
[UPDATE]: When a client surfaces a new failure mode
*/

use std::time::Duration;

use thiserror::Error;

/// Error returned by every `MarketClient` call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MarketError {
    /// Call did not complete within the request timeout
    #[error("request timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    /// Venue asked us to slow down
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Connection level failure
    #[error("network error: {0}")]
    Network(String),

    /// Venue returned a server-side failure
    #[error("market unavailable (status {status}): {message}")]
    Unavailable { status: u16, message: String },

    /// Credentials missing, expired or revoked
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Credentials valid but account is not allowed to act
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Venue refused the request for a business reason
    #[error("rejected: {0}")]
    Rejected(String),

    /// Response could not be understood
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl MarketError {
    /// Transient failures are retried by the caller with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MarketError::Timeout { .. }
                | MarketError::RateLimited { .. }
                | MarketError::Network(_)
                | MarketError::Unavailable { .. }
        )
    }

    pub fn is_auth_error(&self) -> bool {
        matches!(self, MarketError::Unauthorized(_) | MarketError::Forbidden(_))
    }

    /// Minimum wait the venue asked for, if any.
    pub fn retry_delay(&self) -> Option<Duration> {
        match self {
            MarketError::RateLimited { retry_after_ms } => {
                Some(Duration::from_millis(*retry_after_ms))
            }
            _ => None,
        }
    }
}

/// Result type alias for marketplace operations
pub type Result<T> = std::result::Result<T, MarketError>;
