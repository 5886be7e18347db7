/*
[INPUT]:  Error sources (venue rejections, throttling, timeouts, serialization)
[OUTPUT]: Structured error types with retry hints
[POS]:    Error handling layer - unified error types for the executor contract
[UPDATE]: When adding new error sources or improving error messages
*/

use thiserror::Error;

/// Main error type for exchange operations
#[derive(Error, Debug)]
pub enum ExchangeError {
    /// Venue refused the request outright
    #[error("Order rejected: {reason}")]
    Rejected { reason: String },

    /// Order id is not known to the venue
    #[error("Unknown order: {order_id}")]
    UnknownOrder { order_id: String },

    /// Quantity or price is not representable on the venue
    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Venue temporarily unavailable
    #[error("Exchange unavailable: {0}")]
    Unavailable(String),

    /// Rate limit exceeded
    #[error("Rate limit exceeded, retry after {retry_after}s")]
    RateLimit { retry_after: u64 },

    /// Call did not complete in time; outcome unknown
    #[error("Request timeout after {duration}s")]
    Timeout { duration: u64 },
}

impl ExchangeError {
    /// Check if the error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExchangeError::RateLimit { .. }
                | ExchangeError::Timeout { .. }
                | ExchangeError::Unavailable(_)
        )
    }

    /// Get retry delay in seconds (if retryable)
    pub fn retry_delay(&self) -> Option<u64> {
        match self {
            ExchangeError::RateLimit { retry_after } => Some(*retry_after),
            ExchangeError::Timeout { .. } | ExchangeError::Unavailable(_) => Some(1),
            _ => None,
        }
    }

    /// A timed out call may or may not have reached the venue.
    pub fn is_unknown_outcome(&self) -> bool {
        matches!(self, ExchangeError::Timeout { .. })
    }
}

/// Result type alias for exchange operations
pub type Result<T> = std::result::Result<T, ExchangeError>;
