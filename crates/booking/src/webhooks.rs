//! Gateway webhook reconciliation
//!
//! Turns provider-pushed payment events into exactly one domain effect
//! each. Signatures are verified manually (HMAC-SHA256 over
//! `"{timestamp}.{payload}"` with a `t=<ts>,v1=<sig>` header) before any
//! parsing, and "payment succeeded" deliveries are deduplicated through
//! an atomically claimed marker row: only the delivery that inserts the
//! marker runs confirmation. A confirmation failure after the marker is
//! committed propagates so the provider retries, and the retried
//! delivery short-circuits at the marker; the invariant sweep surfaces
//! any booking left in that gap.

use std::collections::HashMap;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BookingError, BookingResult};
use crate::orchestrator::PaymentOrchestrator;
use crate::store::BookingStore;

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed event before it is rejected as stale.
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Inbound event, already stripped of any transport framing.
#[derive(Debug, Clone, Deserialize)]
pub struct EventEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: EventObject,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventObject {
    /// Gateway reference of the payment/setup intent the event is about
    pub id: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Saved payment method, present on setup-intent events
    #[serde(default)]
    pub payment_method: Option<String>,
    /// Decline message, present on failure events
    #[serde(default)]
    pub failure_message: Option<String>,
}

impl EventEnvelope {
    fn booking_id(&self) -> BookingResult<Uuid> {
        let raw = self.data.object.metadata.get("booking_id").ok_or_else(|| {
            BookingError::Validation(format!("event {} carries no booking_id metadata", self.id))
        })?;
        raw.parse().map_err(|_| {
            BookingError::Validation(format!("event {} has malformed booking_id '{}'", self.id, raw))
        })
    }
}

/// Verify a `t=<ts>,v1=<hex>` signature header against the raw payload.
pub fn verify_signature(
    payload: &[u8],
    signature_header: &str,
    secret: &str,
    now: OffsetDateTime,
) -> BookingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<&str> = None;

    for part in signature_header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => v1_signature = Some(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(BookingError::WebhookSignatureInvalid)?;
    let v1_signature = v1_signature.ok_or(BookingError::WebhookSignatureInvalid)?;

    if (now.unix_timestamp() - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(timestamp = timestamp, "Webhook timestamp outside tolerance");
        return Err(BookingError::WebhookSignatureInvalid);
    }

    let secret_key = secret.strip_prefix("whsec_").unwrap_or(secret);
    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .map_err(|_| BookingError::WebhookSignatureInvalid)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);

    let expected = hex::decode(v1_signature).map_err(|_| BookingError::WebhookSignatureInvalid)?;
    mac.verify_slice(&expected)
        .map_err(|_| BookingError::WebhookSignatureInvalid)
}

#[derive(Clone)]
pub struct WebhookReconciler {
    store: Arc<dyn BookingStore>,
    orchestrator: PaymentOrchestrator,
    secret: String,
}

impl WebhookReconciler {
    pub fn new(
        store: Arc<dyn BookingStore>,
        orchestrator: PaymentOrchestrator,
        secret: String,
    ) -> Self {
        Self {
            store,
            orchestrator,
            secret,
        }
    }

    /// Verify, parse, and dispatch a raw inbound delivery.
    pub async fn process(
        &self,
        payload: &[u8],
        signature_header: &str,
        now: OffsetDateTime,
    ) -> BookingResult<()> {
        verify_signature(payload, signature_header, &self.secret, now)?;

        let event: EventEnvelope = serde_json::from_slice(payload)
            .map_err(|e| BookingError::Validation(format!("malformed event payload: {}", e)))?;

        self.handle_event(&event, now).await
    }

    /// Dispatch a verified event to its domain effect.
    pub async fn handle_event(
        &self,
        event: &EventEnvelope,
        now: OffsetDateTime,
    ) -> BookingResult<()> {
        match event.kind.as_str() {
            "payment_intent.succeeded" => self.on_payment_succeeded(event, now).await,
            "payment_intent.payment_failed" => {
                let booking_id = event.booking_id()?;
                let reason = event
                    .data
                    .object
                    .failure_message
                    .as_deref()
                    .unwrap_or("payment failed");
                self.orchestrator
                    .record_payment_failure(booking_id, reason, now)
                    .await
            }
            "payment_intent.amount_capturable_updated" => {
                let booking_id = event.booking_id()?;
                self.orchestrator
                    .record_capturable_hold(booking_id, &event.data.object.id)
                    .await
            }
            "setup_intent.succeeded" => {
                let booking_id = event.booking_id()?;
                let method = event.data.object.payment_method.as_deref().ok_or_else(|| {
                    BookingError::Validation(format!(
                        "setup event {} carries no payment method",
                        event.id
                    ))
                })?;
                self.orchestrator
                    .record_saved_method(booking_id, method)
                    .await
            }
            other => {
                // Acknowledge so the provider stops retrying events we
                // deliberately do not consume
                tracing::debug!(event_id = %event.id, kind = %other, "Ignoring unhandled event kind");
                Ok(())
            }
        }
    }

    async fn on_payment_succeeded(
        &self,
        event: &EventEnvelope,
        now: OffsetDateTime,
    ) -> BookingResult<()> {
        let booking_id = event.booking_id()?;

        let claimed = self
            .store
            .mark_event_processed(&event.id, booking_id)
            .await?;
        if !claimed {
            tracing::info!(
                event_id = %event.id,
                booking_id = %booking_id,
                "Duplicate event delivery, already processed"
            );
            return Ok(());
        }

        // Confirmation runs after the marker is committed, outside any
        // transaction. A failure here propagates so the provider
        // redelivers; the marker then short-circuits above.
        self.orchestrator
            .confirm_payment(booking_id, &event.data.object.id, now)
            .await?;

        tracing::info!(
            event_id = %event.id,
            booking_id = %booking_id,
            "Payment success event reconciled"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::MemoryIdentityDirectory;
    use crate::meetings::MeetingGenerator;
    use crate::model::{Booking, BookingStatus, Role};
    use crate::notify::NullNotifier;
    use crate::store::MemoryBookingStore;
    use crate::testkit::{profile, FakeGateway, FakeMeetingProvider};
    use time::Duration;

    const SECRET: &str = "whsec_test_secret";

    fn sign(payload: &str, timestamp: i64) -> String {
        let key = SECRET.strip_prefix("whsec_").unwrap_or(SECRET);
        let mut mac = HmacSha256::new_from_slice(key.as_bytes()).unwrap();
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
    }

    struct Fixture {
        reconciler: WebhookReconciler,
        store: Arc<MemoryBookingStore>,
        provider: FakeMeetingProvider,
        booking: Booking,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryBookingStore::new());
        let identity = Arc::new(MemoryIdentityDirectory::new());
        let provider = FakeMeetingProvider::new();
        let meetings =
            MeetingGenerator::new(store.clone(), identity.clone(), Arc::new(provider.clone()));
        let orchestrator = PaymentOrchestrator::new(
            store.clone(),
            Arc::new(FakeGateway::new()),
            identity.clone(),
            meetings,
            Arc::new(NullNotifier),
        );
        let reconciler =
            WebhookReconciler::new(store.clone(), orchestrator, SECRET.to_string());

        let now = OffsetDateTime::now_utc();
        let student = profile(Role::Student, Some(25));
        let tutor = profile(Role::Tutor, Some(40));
        let mut booking = Booking::new(
            student.id,
            tutor.id,
            "maths".into(),
            "gcse".into(),
            now + Duration::hours(48),
            60,
            5000,
            now,
        );
        booking.status = BookingStatus::Accepted;
        identity.upsert(student).await;
        identity.upsert(tutor).await;
        store.insert(&booking).await.unwrap();

        Fixture {
            reconciler,
            store,
            provider,
            booking,
        }
    }

    fn success_payload(event_id: &str, booking_id: Uuid, reference: &str) -> String {
        serde_json::json!({
            "id": event_id,
            "type": "payment_intent.succeeded",
            "data": {
                "object": {
                    "id": reference,
                    "metadata": { "booking_id": booking_id.to_string() }
                }
            }
        })
        .to_string()
    }

    #[tokio::test]
    async fn valid_signature_is_accepted() {
        let fx = fixture().await;
        let now = OffsetDateTime::now_utc();
        let payload = success_payload("evt_1", fx.booking.id, "pi_1");
        let header = sign(&payload, now.unix_timestamp());

        fx.reconciler
            .process(payload.as_bytes(), &header, now)
            .await
            .unwrap();

        let stored = fx.store.get(fx.booking.id).await.unwrap();
        assert!(stored.is_paid);
        assert_eq!(stored.status, BookingStatus::Confirmed);
    }

    #[tokio::test]
    async fn tampered_payload_is_rejected() {
        let fx = fixture().await;
        let now = OffsetDateTime::now_utc();
        let payload = success_payload("evt_1", fx.booking.id, "pi_1");
        let header = sign(&payload, now.unix_timestamp());
        let tampered = payload.replace("pi_1", "pi_2");

        let err = fx.reconciler.process(tampered.as_bytes(), &header, now).await;
        assert!(matches!(err, Err(BookingError::WebhookSignatureInvalid)));

        let stored = fx.store.get(fx.booking.id).await.unwrap();
        assert!(!stored.is_paid);
    }

    #[tokio::test]
    async fn stale_timestamp_is_rejected() {
        let fx = fixture().await;
        let now = OffsetDateTime::now_utc();
        let payload = success_payload("evt_1", fx.booking.id, "pi_1");
        let header = sign(&payload, (now - Duration::minutes(10)).unix_timestamp());

        let err = fx.reconciler.process(payload.as_bytes(), &header, now).await;
        assert!(matches!(err, Err(BookingError::WebhookSignatureInvalid)));
    }

    #[tokio::test]
    async fn garbage_header_is_rejected() {
        let fx = fixture().await;
        let now = OffsetDateTime::now_utc();
        let payload = success_payload("evt_1", fx.booking.id, "pi_1");

        for header in ["", "t=abc,v1=zzz", "v1=deadbeef", "t=123"] {
            let err = fx.reconciler.process(payload.as_bytes(), header, now).await;
            assert!(matches!(err, Err(BookingError::WebhookSignatureInvalid)));
        }
    }

    #[tokio::test]
    async fn duplicate_delivery_confirms_exactly_once() {
        let fx = fixture().await;
        let now = OffsetDateTime::now_utc();
        let payload = success_payload("evt_1", fx.booking.id, "pi_1");
        let header = sign(&payload, now.unix_timestamp());

        fx.reconciler
            .process(payload.as_bytes(), &header, now)
            .await
            .unwrap();
        // same event id delivered again: reported as success, no re-run
        fx.reconciler
            .process(payload.as_bytes(), &header, now)
            .await
            .unwrap();

        let stored = fx.store.get(fx.booking.id).await.unwrap();
        assert!(stored.is_paid);
        assert_eq!(fx.provider.create_calls(), 1);
    }

    #[tokio::test]
    async fn capturable_hold_updates_reference_only() {
        let fx = fixture().await;
        let now = OffsetDateTime::now_utc();
        let payload = serde_json::json!({
            "id": "evt_hold",
            "type": "payment_intent.amount_capturable_updated",
            "data": {
                "object": {
                    "id": "pi_hold",
                    "metadata": { "booking_id": fx.booking.id.to_string() }
                }
            }
        })
        .to_string();
        let header = sign(&payload, now.unix_timestamp());

        fx.reconciler
            .process(payload.as_bytes(), &header, now)
            .await
            .unwrap();

        let stored = fx.store.get(fx.booking.id).await.unwrap();
        assert_eq!(stored.payment_intent_id.as_deref(), Some("pi_hold"));
        assert!(!stored.is_paid);
        assert_eq!(stored.status, BookingStatus::Accepted);
    }

    #[tokio::test]
    async fn saved_method_event_records_the_method() {
        let fx = fixture().await;
        let now = OffsetDateTime::now_utc();
        let payload = serde_json::json!({
            "id": "evt_setup",
            "type": "setup_intent.succeeded",
            "data": {
                "object": {
                    "id": "seti_1",
                    "payment_method": "pm_42",
                    "metadata": { "booking_id": fx.booking.id.to_string() }
                }
            }
        })
        .to_string();
        let header = sign(&payload, now.unix_timestamp());

        fx.reconciler
            .process(payload.as_bytes(), &header, now)
            .await
            .unwrap();

        let stored = fx.store.get(fx.booking.id).await.unwrap();
        assert_eq!(stored.saved_payment_method_id.as_deref(), Some("pm_42"));
        assert!(!stored.is_paid);
    }

    #[tokio::test]
    async fn unknown_event_kind_is_acknowledged() {
        let fx = fixture().await;
        let now = OffsetDateTime::now_utc();
        let payload = serde_json::json!({
            "id": "evt_other",
            "type": "customer.updated",
            "data": { "object": { "id": "cus_1" } }
        })
        .to_string();
        let header = sign(&payload, now.unix_timestamp());

        fx.reconciler
            .process(payload.as_bytes(), &header, now)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn missing_booking_metadata_is_a_validation_error() {
        let fx = fixture().await;
        let now = OffsetDateTime::now_utc();
        let payload = serde_json::json!({
            "id": "evt_bad",
            "type": "payment_intent.succeeded",
            "data": { "object": { "id": "pi_1" } }
        })
        .to_string();
        let header = sign(&payload, now.unix_timestamp());

        let err = fx.reconciler.process(payload.as_bytes(), &header, now).await;
        assert!(matches!(err, Err(BookingError::Validation(_))));
    }
}
