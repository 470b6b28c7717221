//! Payment orchestration
//!
//! Chooses the authorization strategy for a booking from the time left
//! until the lesson, drives the charge/hold/setup sequence, and owns
//! `confirm_payment`, the single funnel both the webhook reconciler and
//! manual confirmation go through. A successful charge is never rolled
//! back because meeting generation failed afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use time::{Date, Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BookingError, BookingResult};
use crate::gateway::{PaymentAuthorization, PaymentGateway};
use crate::identity::IdentityDirectory;
use crate::meetings::MeetingGenerator;
use crate::model::{Booking, BookingStatus, PaymentAuthType, Profile, Role};
use crate::notify::Notifier;
use crate::store::BookingStore;

/// Holds and setup intents expire 7 days after creation.
pub const HOLD_EXPIRY_DAYS: i64 = 7;

/// Deferred charges run 24 hours before the lesson.
pub const CHARGE_LEAD_HOURS: i64 = 24;

/// Reference stored before the real gateway reference is known.
pub const PLACEHOLDER_REFERENCE: &str = "pending";

/// Pick the authorization strategy from the time remaining until the
/// lesson: under 24h charge now, under 7 days hold now, otherwise save
/// a method and charge later.
pub fn select_strategy(scheduled_at: OffsetDateTime, now: OffsetDateTime) -> PaymentAuthType {
    let until = scheduled_at - now;
    if until < Duration::hours(24) {
        PaymentAuthType::ImmediateCharge
    } else if until < Duration::days(7) {
        PaymentAuthType::ImmediateAuth
    } else {
        PaymentAuthType::DeferredAuth
    }
}

/// When the scheduled processor should charge a deferred booking.
pub fn payment_schedule_for(scheduled_at: OffsetDateTime) -> OffsetDateTime {
    scheduled_at - Duration::hours(CHARGE_LEAD_HOURS)
}

/// Placeholders and setup-intent references never represent moved money,
/// so they are exempt from duplicate-reference conflict detection.
pub fn is_placeholder_reference(reference: &str) -> bool {
    reference == PLACEHOLDER_REFERENCE || reference.starts_with("seti_")
}

pub(crate) fn booking_metadata(booking_id: Uuid) -> HashMap<String, String> {
    let mut metadata = HashMap::new();
    metadata.insert("booking_id".to_string(), booking_id.to_string());
    metadata
}

#[derive(Clone)]
pub struct PaymentOrchestrator {
    store: Arc<dyn BookingStore>,
    gateway: Arc<dyn PaymentGateway>,
    identity: Arc<dyn IdentityDirectory>,
    meetings: MeetingGenerator,
    notifier: Arc<dyn Notifier>,
}

impl PaymentOrchestrator {
    pub fn new(
        store: Arc<dyn BookingStore>,
        gateway: Arc<dyn PaymentGateway>,
        identity: Arc<dyn IdentityDirectory>,
        meetings: MeetingGenerator,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            gateway,
            identity,
            meetings,
            notifier,
        }
    }

    /// Who pays for this booking: the student when they are an adult,
    /// otherwise their guardian.
    pub(crate) async fn resolve_payer(
        &self,
        booking: &Booking,
        today: Date,
    ) -> BookingResult<Profile> {
        let student = self.identity.profile(booking.student_id).await?;
        if student.is_adult_at(today) {
            return Ok(student);
        }
        self.identity
            .guardian_of(booking.student_id)
            .await?
            .ok_or_else(|| {
                BookingError::Validation(format!(
                    "student {} is a minor with no guardian on record",
                    booking.student_id
                ))
            })
    }

    async fn authorize_payer(
        &self,
        booking: &Booking,
        requester_id: Uuid,
        today: Date,
    ) -> BookingResult<Profile> {
        let payer = self.resolve_payer(booking, today).await?;
        if requester_id == payer.id {
            return Ok(payer);
        }
        let requester = self.identity.profile(requester_id).await?;
        if requester.role == Role::Admin {
            return Ok(payer);
        }
        Err(BookingError::Unauthorized(
            "only the payer of record can authorize payment".to_string(),
        ))
    }

    /// Resolve-or-create the payer's billing identity at the gateway.
    /// Re-checks the directory right before creating so a concurrent
    /// first-time payment does not mint a second identity; the directory
    /// keeps the first write, and the winner is read back.
    async fn ensure_billing_ref(&self, payer: &Profile) -> BookingResult<String> {
        if let Some(existing) = &payer.billing_ref {
            return Ok(existing.clone());
        }

        let fresh = self.identity.profile(payer.id).await?;
        if let Some(existing) = fresh.billing_ref {
            return Ok(existing);
        }

        let created = self
            .gateway
            .ensure_customer(&fresh.full_name, &fresh.email, &fresh.id.to_string())
            .await?;
        self.identity.set_billing_ref(fresh.id, &created).await?;

        let winner = self.identity.profile(payer.id).await?;
        Ok(winner.billing_ref.unwrap_or(created))
    }

    /// Create the gateway authorization for an accepted booking and
    /// persist its reference and expiry before handing the client-facing
    /// secret back to the caller.
    pub async fn create_payment_authorization(
        &self,
        booking_id: Uuid,
        requester_id: Uuid,
        now: OffsetDateTime,
    ) -> BookingResult<PaymentAuthorization> {
        let mut booking = self.store.get(booking_id).await?;

        if booking.status != BookingStatus::Accepted {
            return Err(BookingError::Conflict(format!(
                "payment can only be authorized for an accepted booking, {} is '{}'",
                booking_id, booking.status
            )));
        }
        if booking.is_paid {
            return Err(BookingError::Conflict(format!(
                "booking {} is already paid",
                booking_id
            )));
        }

        let payer = self
            .authorize_payer(&booking, requester_id, now.date())
            .await?;
        let customer_ref = self.ensure_billing_ref(&payer).await?;
        let metadata = booking_metadata(booking_id);

        let strategy = booking
            .payment_auth_type
            .unwrap_or_else(|| select_strategy(booking.scheduled_at, now));

        let authorization = match strategy {
            PaymentAuthType::ImmediateCharge => {
                self.gateway
                    .create_charge(booking.price_cents, &customer_ref, metadata)
                    .await?
            }
            PaymentAuthType::ImmediateAuth => {
                self.gateway
                    .create_hold(booking.price_cents, &customer_ref, metadata)
                    .await?
            }
            PaymentAuthType::DeferredAuth => {
                self.gateway
                    .create_setup_intent(&customer_ref, metadata)
                    .await?
            }
        };

        booking.payment_auth_type = Some(strategy);
        booking.payment_intent_id = Some(authorization.reference.clone());
        booking.payment_expires_at = Some(now + Duration::days(HOLD_EXPIRY_DAYS));
        if strategy == PaymentAuthType::DeferredAuth {
            booking.payment_scheduled_for = Some(payment_schedule_for(booking.scheduled_at));
        }
        self.store.update(&booking, BookingStatus::Accepted).await?;

        tracing::info!(
            booking_id = %booking_id,
            strategy = %strategy,
            reference = %authorization.reference,
            "Payment authorization created"
        );

        Ok(authorization)
    }

    /// The single confirmation funnel: every path that learns a payment
    /// succeeded (webhook, scheduled charge, manual confirm) goes through
    /// here. Idempotent when repeated with the same reference; a second,
    /// different non-placeholder reference is a conflict.
    pub async fn confirm_payment(
        &self,
        booking_id: Uuid,
        reference: &str,
        now: OffsetDateTime,
    ) -> BookingResult<Booking> {
        if !reference.starts_with("pi_") {
            return Err(BookingError::Validation(format!(
                "malformed payment reference '{}'",
                reference
            )));
        }

        let booking = self.store.get(booking_id).await?;

        if booking.is_paid {
            return match booking.payment_intent_id.as_deref() {
                Some(existing) if existing == reference => {
                    tracing::debug!(
                        booking_id = %booking_id,
                        reference = %reference,
                        "Payment already confirmed with this reference"
                    );
                    Ok(booking)
                }
                _ => Err(BookingError::Conflict(format!(
                    "booking {} is already paid under a different reference",
                    booking_id
                ))),
            };
        }

        if let Some(existing) = booking.payment_intent_id.as_deref() {
            if existing != reference && !is_placeholder_reference(existing) {
                return Err(BookingError::Conflict(format!(
                    "booking {} already carries payment reference '{}'",
                    booking_id, existing
                )));
            }
        }

        self.store.confirm_paid(booking_id, reference, now).await?;
        tracing::info!(
            booking_id = %booking_id,
            reference = %reference,
            "Payment confirmed, booking moved to confirmed"
        );

        // Payment success and meeting availability are decoupled: a
        // failure here is logged and recovered through the manual
        // generation path, never by rolling back the charge.
        if let Err(e) = self.meetings.generate_for_booking(booking_id).await {
            tracing::error!(
                booking_id = %booking_id,
                error = %e,
                "Meeting generation failed after payment confirmation"
            );
        }

        self.store.get(booking_id).await
    }

    /// Intermediate webhook state: a hold became capturable. Records the
    /// real gateway reference without touching paid state or status.
    pub async fn record_capturable_hold(
        &self,
        booking_id: Uuid,
        reference: &str,
    ) -> BookingResult<()> {
        let mut booking = self.store.get(booking_id).await?;
        if booking.is_paid {
            return Ok(());
        }
        let expected = booking.status;
        booking.payment_intent_id = Some(reference.to_string());
        self.store.update(&booking, expected).await?;
        tracing::debug!(booking_id = %booking_id, reference = %reference, "Hold is capturable");
        Ok(())
    }

    /// Intermediate webhook state: a reusable payment method was saved
    /// for a deferred booking.
    pub async fn record_saved_method(
        &self,
        booking_id: Uuid,
        method_ref: &str,
    ) -> BookingResult<()> {
        let mut booking = self.store.get(booking_id).await?;
        if booking.is_paid {
            return Ok(());
        }
        let expected = booking.status;
        booking.saved_payment_method_id = Some(method_ref.to_string());
        self.store.update(&booking, expected).await?;
        tracing::debug!(booking_id = %booking_id, method = %method_ref, "Payment method saved");
        Ok(())
    }

    /// Webhook-reported payment failure: record the error and tell the
    /// payer, without moving status.
    pub async fn record_payment_failure(
        &self,
        booking_id: Uuid,
        reason: &str,
        now: OffsetDateTime,
    ) -> BookingResult<()> {
        let mut booking = self.store.get(booking_id).await?;
        if booking.is_paid {
            return Ok(());
        }
        let expected = booking.status;
        booking.payment_error = Some(reason.to_string());
        self.store.update(&booking, expected).await?;

        if let Ok(payer) = self.resolve_payer(&booking, now.date()).await {
            self.notifier
                .notify_payment_failure(&booking, &payer, reason)
                .await;
        }
        tracing::warn!(booking_id = %booking_id, reason = %reason, "Payment failed");
        Ok(())
    }

    /// Sweep for uncaptured holds past their 7-day expiry: clear the
    /// stale reference back to the placeholder so the payer can
    /// re-authorize, and tell them. Returns the number of bookings reset.
    pub async fn release_expired_holds(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> BookingResult<u64> {
        let expired = self.store.expired_holds(now, limit).await?;
        let mut released = 0u64;

        for mut booking in expired {
            let expected = booking.status;
            booking.payment_intent_id = Some(PLACEHOLDER_REFERENCE.to_string());
            booking.payment_expires_at = None;
            booking.payment_error = Some("authorization hold expired before capture".to_string());

            // A week has passed since the hold was taken, so the lesson may
            // have crossed into a different band
            let strategy = select_strategy(booking.scheduled_at, now);
            booking.payment_auth_type = Some(strategy);
            booking.payment_scheduled_for = match strategy {
                PaymentAuthType::DeferredAuth => Some(payment_schedule_for(booking.scheduled_at)),
                _ => None,
            };

            if let Err(e) = self.store.update(&booking, expected).await {
                tracing::warn!(booking_id = %booking.id, error = %e, "Failed to reset expired hold");
                continue;
            }

            if let Ok(payer) = self.resolve_payer(&booking, now.date()).await {
                self.notifier
                    .notify_payment_failure(
                        &booking,
                        &payer,
                        "the payment authorization expired, please authorize again",
                    )
                    .await;
            }
            tracing::info!(booking_id = %booking.id, "Expired hold released for re-authorization");
            released += 1;
        }

        Ok(released)
    }
}
