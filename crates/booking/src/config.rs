//! Explicit configuration objects
//!
//! All credentials and endpoints are read once at process start and
//! injected into the clients; business logic never reaches into the
//! environment.

use crate::error::{BookingError, BookingResult};

fn required(var: &str) -> BookingResult<String> {
    std::env::var(var).map_err(|_| BookingError::Config(format!("{} must be set", var)))
}

/// Payment gateway credentials.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub secret_key: String,
    /// Secret for verifying inbound webhook signatures
    pub webhook_secret: String,
    /// ISO currency code used for all charges (e.g. "usd")
    pub currency: String,
}

impl GatewayConfig {
    pub fn from_env() -> BookingResult<Self> {
        Ok(Self {
            secret_key: required("STRIPE_SECRET_KEY")?,
            webhook_secret: required("STRIPE_WEBHOOK_SECRET")?,
            currency: std::env::var("PAYMENT_CURRENCY").unwrap_or_else(|_| "usd".to_string()),
        })
    }
}

/// Video-meeting provider endpoint and credentials.
#[derive(Debug, Clone)]
pub struct MeetingProviderConfig {
    pub base_url: String,
    pub api_key: String,
}

impl MeetingProviderConfig {
    pub fn from_env() -> BookingResult<Self> {
        Ok(Self {
            base_url: required("MEETING_API_URL")?,
            api_key: required("MEETING_API_KEY")?,
        })
    }
}

/// Outbound email notification settings. Notifications are optional:
/// an empty API key disables sending without failing any caller.
#[derive(Debug, Clone)]
pub struct NotifierConfig {
    pub api_key: String,
    pub from_address: String,
}

impl NotifierConfig {
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var("RESEND_API_KEY").unwrap_or_default(),
            from_address: std::env::var("NOTIFY_FROM_ADDRESS")
                .unwrap_or_else(|_| "bookings@tutorhub.app".to_string()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.api_key.is_empty()
    }
}
