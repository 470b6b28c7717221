//! HTTP error mapping
//!
//! Translates booking engine errors into status codes. The webhook
//! endpoint deliberately reports external-dependency failures as 5xx so
//! the payment provider redelivers the event.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tutorhub_booking::BookingError;

#[derive(Debug)]
pub struct ApiError(pub BookingError);

impl From<BookingError> for ApiError {
    fn from(err: BookingError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: String,
        }

        let status = match &self.0 {
            BookingError::Validation(_) => StatusCode::BAD_REQUEST,
            BookingError::Unauthorized(_) => StatusCode::FORBIDDEN,
            BookingError::Conflict(_) => StatusCode::CONFLICT,
            BookingError::BookingNotFound(_) | BookingError::ProfileNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            BookingError::PaymentDeclined(_) => StatusCode::PAYMENT_REQUIRED,
            BookingError::WebhookSignatureInvalid => StatusCode::BAD_REQUEST,
            BookingError::Gateway(_)
            | BookingError::RefundFailed(_)
            | BookingError::MeetingProvider(_) => StatusCode::BAD_GATEWAY,
            BookingError::Database(_) | BookingError::Config(_) | BookingError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }

        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
