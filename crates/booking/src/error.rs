//! Error types for the booking engine
//!
//! Variants map onto the caller-facing taxonomy: validation and
//! authorization failures reject before any mutation, conflicts signal
//! "already done / wrong state" distinctly, and external-dependency
//! failures stay separate from internal ones so the api layer can map
//! them to gateway-class status codes.

use thiserror::Error;
use uuid::Uuid;

pub type BookingResult<T> = Result<T, BookingError>;

#[derive(Debug, Error)]
pub enum BookingError {
    /// Bad input shape (malformed payment reference, empty reason, ...)
    #[error("validation failed: {0}")]
    Validation(String),

    /// Requester lacks the role or relationship for this operation
    #[error("not authorized: {0}")]
    Unauthorized(String),

    /// Operation conflicts with current state (duplicate reference,
    /// transition from the wrong status)
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("booking {0} not found")]
    BookingNotFound(Uuid),

    #[error("profile {0} not found")]
    ProfileNotFound(Uuid),

    /// Payment gateway call failed; retryable unless the gateway said otherwise
    #[error("payment gateway error: {0}")]
    Gateway(String),

    /// The gateway declined the charge outright (card declined, no method)
    #[error("payment declined: {0}")]
    PaymentDeclined(String),

    #[error("refund failed: {0}")]
    RefundFailed(String),

    /// Meeting provider call failed after retries were exhausted
    #[error("meeting provider error: {0}")]
    MeetingProvider(String),

    #[error("webhook signature invalid")]
    WebhookSignatureInvalid,

    #[error("database error: {0}")]
    Database(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for BookingError {
    fn from(err: sqlx::Error) -> Self {
        BookingError::Database(err.to_string())
    }
}

impl From<stripe::StripeError> for BookingError {
    fn from(err: stripe::StripeError) -> Self {
        BookingError::Gateway(err.to_string())
    }
}

