//! Error taxonomy for the post office.
//!
//! Every failure a queue consumer can observe maps onto one of these variants,
//! and [`OfficeError::is_retryable`] decides whether the consumer abandons the
//! delivery (broker redelivers) or settles it for good.

use thiserror::Error;

/// Transport-level failures reported by a [`crate::broker::Broker`].
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("Broker connection failed: {0}")]
    Connect(String),

    #[error("Publish to '{queue}' failed: {reason}")]
    Publish { queue: String, reason: String },

    #[error("Receive from '{queue}' failed: {reason}")]
    Receive { queue: String, reason: String },

    #[error("Acknowledgement failed: {0}")]
    Ack(String),

    #[error("Queue '{0}' is closed")]
    Closed(String),
}

/// Errors raised while admitting, routing or processing messages.
#[derive(Debug, Error)]
pub enum OfficeError {
    /// A message failed field validation before it was published.
    #[error("Admission rejected: {0}")]
    Admission(String),

    /// The caller supplied the wrong shared secret.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// No letterbox is registered for the message's util.
    #[error("Unknown util: {0}")]
    UnknownUtil(String),

    #[error("Unknown queue: {0}")]
    UnknownQueue(String),

    /// A letterbox or job handler failed; the message should be retried.
    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Handler timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0} has not been initialized")]
    NotInitialized(String),
}

impl OfficeError {
    /// Build a handler error from anything printable.
    pub fn handler(err: impl std::fmt::Display) -> Self {
        OfficeError::Handler(err.to_string())
    }

    /// Whether a consumer should hand the message back to the broker.
    ///
    /// Routing errors are deployment mismatches and admission/security errors
    /// cannot succeed on a second attempt, so only those are settled for good.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            OfficeError::UnknownUtil(_)
                | OfficeError::Admission(_)
                | OfficeError::Unauthorized(_)
                | OfficeError::Config(_)
        )
    }
}

impl From<reqwest::Error> for OfficeError {
    fn from(e: reqwest::Error) -> Self {
        OfficeError::Handler(e.to_string())
    }
}

pub type Result<T, E = OfficeError> = std::result::Result<T, E>;
