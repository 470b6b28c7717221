//! Payer notifications
//!
//! Fire-and-forget by contract: a notification failure is logged and
//! swallowed, never propagated to the payment or cancellation path that
//! triggered it.

use async_trait::async_trait;
use serde_json::json;

use crate::config::NotifierConfig;
use crate::model::{Booking, Profile};

#[async_trait]
pub trait Notifier: Send + Sync {
    /// A scheduled or retried charge failed; the payer needs to act.
    async fn notify_payment_failure(&self, booking: &Booking, payer: &Profile, reason: &str);

    /// A charge needs a strong-auth challenge completed by the payer.
    async fn notify_action_required(&self, booking: &Booking, payer: &Profile);
}

/// Email notifier backed by the Resend HTTP API.
#[derive(Clone)]
pub struct EmailNotifier {
    config: NotifierConfig,
    client: reqwest::Client,
}

impl EmailNotifier {
    pub fn new(config: NotifierConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(NotifierConfig::from_env())
    }

    async fn send(&self, to: &str, subject: &str, body: &str) {
        if !self.config.is_enabled() {
            tracing::debug!(to = %to, subject = %subject, "Email notifications disabled, skipping");
            return;
        }

        let payload = json!({
            "from": self.config.from_address,
            "to": [to],
            "subject": subject,
            "text": body,
        });

        let result = self
            .client
            .post("https://api.resend.com/emails")
            .bearer_auth(&self.config.api_key)
            .json(&payload)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(to = %to, subject = %subject, "Notification email sent");
            }
            Ok(response) => {
                tracing::error!(
                    to = %to,
                    status = %response.status(),
                    "Notification email rejected by provider"
                );
            }
            Err(e) => {
                tracing::error!(to = %to, error = %e, "Failed to send notification email");
            }
        }
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    async fn notify_payment_failure(&self, booking: &Booking, payer: &Profile, reason: &str) {
        let subject = format!("Payment failed for your {} lesson", booking.subject);
        let body = format!(
            "Hi {},\n\nWe could not take payment for the {} lesson scheduled at {}.\n\
             Reason: {}\n\nPlease update your payment method so the lesson can go ahead.",
            payer.full_name, booking.subject, booking.scheduled_at, reason
        );
        self.send(&payer.email, &subject, &body).await;
    }

    async fn notify_action_required(&self, booking: &Booking, payer: &Profile) {
        let subject = format!("Action needed to pay for your {} lesson", booking.subject);
        let body = format!(
            "Hi {},\n\nYour bank needs you to confirm the payment for the {} lesson \
             scheduled at {}. Please open the app and complete the verification.",
            payer.full_name, booking.subject, booking.scheduled_at
        );
        self.send(&payer.email, &subject, &body).await;
    }
}

/// No-op notifier for deployments without email configured.
#[derive(Clone, Default)]
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify_payment_failure(&self, booking: &Booking, _payer: &Profile, reason: &str) {
        tracing::info!(booking_id = %booking.id, reason = %reason, "Payment failure (notifications disabled)");
    }

    async fn notify_action_required(&self, booking: &Booking, _payer: &Profile) {
        tracing::info!(booking_id = %booking.id, "Payment action required (notifications disabled)");
    }
}
