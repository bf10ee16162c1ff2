//! Gateway error taxonomy.
//!
//! Every exchange implementation folds its wire-level failures into
//! [`GatewayError`] so the remediation engine can make retry decisions
//! without knowing which exchange it is talking to. Duplicate client order
//! ids get a first-class variant: a retried placement that the exchange
//! deduplicates is a *success* for reconciliation purposes.

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by an exchange gateway.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// Credentials rejected or expired.
    #[error("authentication error: {0}")]
    Authentication(String),

    /// API request failed with an error envelope.
    #[error("API error: {status} {code} - {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Exchange business error code.
        code: String,
        /// Error message from the exchange.
        message: String,
    },

    /// Exchange rate limit exceeded.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited {
        /// Server-suggested wait, when provided.
        retry_after: Option<Duration>,
    },

    /// Connection-level failure.
    #[error("network error: {0}")]
    Network(String),

    /// Request deadline elapsed before a response arrived.
    #[error("request timeout: {0}")]
    Timeout(String),

    /// The client order id was already used; the original order stands.
    #[error("duplicate client order id: {client_oid}")]
    DuplicateClientOid {
        /// The deduplicated client order id.
        client_oid: String,
    },

    /// The exchange rejected the order parameters (price bounds, minimum
    /// size, precision). Retrying the identical request is futile.
    #[error("invalid order: {0}")]
    InvalidOrder(String),

    /// Order id unknown to the exchange (already filled or cancelled).
    #[error("order not found: {order_id}")]
    OrderNotFound {
        /// The order id that was not found.
        order_id: String,
    },

    /// Response body could not be decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Client-side configuration problem (bad URL, missing credentials).
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl GatewayError {
    /// Creates an API error from an envelope.
    pub fn api(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Creates a rate-limit error.
    #[must_use]
    pub fn rate_limited(retry_after: Option<Duration>) -> Self {
        Self::RateLimited { retry_after }
    }

    /// Creates a duplicate client oid error.
    pub fn duplicate(client_oid: impl Into<String>) -> Self {
        Self::DuplicateClientOid {
            client_oid: client_oid.into(),
        }
    }

    /// Creates an order-not-found error.
    pub fn order_not_found(order_id: impl Into<String>) -> Self {
        Self::OrderNotFound {
            order_id: order_id.into(),
        }
    }

    /// Returns true if retrying the same request may succeed.
    ///
    /// Covers network failures, timeouts, rate limits, and server-side 5xx
    /// envelopes. Validation and auth failures are excluded: retrying those
    /// without operator intervention cannot help.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout(_) | Self::RateLimited { .. } => true,
            Self::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Returns true if the failure means credentials are bad.
    #[must_use]
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Authentication(_))
    }

    /// Returns true if the exchange deduplicated the client order id.
    #[must_use]
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::DuplicateClientOid { .. })
    }

    /// Returns true for rejections that need an operator or strategy fix.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::InvalidOrder(_))
    }

    /// Suggested wait before a retry, if the error carries one.
    #[must_use]
    pub fn retry_delay(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            Self::Network(_) | Self::Timeout(_) => Some(Duration::from_secs(1)),
            Self::Api { status, .. } if *status >= 500 => Some(Duration::from_secs(2)),
            _ => None,
        }
    }
}

/// Result type alias for gateway operations.
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;
