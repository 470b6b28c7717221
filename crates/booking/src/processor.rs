//! Scheduled payment batch processor
//!
//! Periodically charges deferred bookings whose payment window has
//! arrived. Runs may overlap: correctness comes from the store's
//! claim-before-attempt flag, not from single-instance locking. One
//! failed candidate never aborts the run; every outcome lands in the
//! run summary.

use std::sync::Arc;

use serde::Serialize;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BookingError, BookingResult};
use crate::gateway::{OffSessionOutcome, PaymentGateway};
use crate::identity::IdentityDirectory;
use crate::model::Booking;
use crate::notify::Notifier;
use crate::orchestrator::{booking_metadata, PaymentOrchestrator};
use crate::store::BookingStore;

/// Per-run candidate cap; bounds run time instead of a wall clock.
pub const BATCH_SIZE: i64 = 50;

/// Failed charges are retried at most this many times before the
/// booking is left for manual intervention.
pub const MAX_PAYMENT_RETRIES: i32 = 3;

/// Minimum wait between retries of the same booking.
pub const RETRY_COOLDOWN: Duration = Duration::hours(1);

/// Aggregate counters for one processor run.
#[derive(Debug, Default, Serialize)]
pub struct ProcessorRunSummary {
    pub processed: u32,
    pub succeeded: u32,
    pub requires_action: u32,
    pub failed: u32,
    pub failures: Vec<(Uuid, String)>,
}

enum ChargeOutcome {
    Confirmed,
    ActionRequired,
}

#[derive(Clone)]
pub struct ScheduledPaymentProcessor {
    store: Arc<dyn BookingStore>,
    gateway: Arc<dyn PaymentGateway>,
    identity: Arc<dyn IdentityDirectory>,
    orchestrator: PaymentOrchestrator,
    notifier: Arc<dyn Notifier>,
}

impl ScheduledPaymentProcessor {
    pub fn new(
        store: Arc<dyn BookingStore>,
        gateway: Arc<dyn PaymentGateway>,
        identity: Arc<dyn IdentityDirectory>,
        orchestrator: PaymentOrchestrator,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            gateway,
            identity,
            orchestrator,
            notifier,
        }
    }

    /// One batch run over due deferred bookings.
    pub async fn run(&self, now: OffsetDateTime) -> BookingResult<ProcessorRunSummary> {
        let due = self.store.due_deferred(now, BATCH_SIZE).await?;
        let mut summary = ProcessorRunSummary::default();

        for booking in due {
            // Claim first, attempt second: an overlapping run that loses
            // this flip skips the booking entirely
            if !self.store.claim_payment_attempt(booking.id).await? {
                tracing::debug!(booking_id = %booking.id, "Already claimed by another run");
                continue;
            }
            summary.processed += 1;

            match self.charge_one(&booking, now).await {
                Ok(ChargeOutcome::Confirmed) => summary.succeeded += 1,
                Ok(ChargeOutcome::ActionRequired) => summary.requires_action += 1,
                Err(e) => {
                    summary.failed += 1;
                    summary.failures.push((booking.id, e.to_string()));
                    if let Err(persist_err) = self.record_failure(booking.id, &e, now).await {
                        tracing::error!(
                            booking_id = %booking.id,
                            error = %persist_err,
                            "Failed to record charge failure"
                        );
                    }
                }
            }
        }

        tracing::info!(
            processed = summary.processed,
            succeeded = summary.succeeded,
            requires_action = summary.requires_action,
            failed = summary.failed,
            "Scheduled payment run complete"
        );
        Ok(summary)
    }

    async fn charge_one(
        &self,
        booking: &Booking,
        now: OffsetDateTime,
    ) -> BookingResult<ChargeOutcome> {
        let payer = self.orchestrator.resolve_payer(booking, now.date()).await?;
        let customer_ref = payer.billing_ref.clone().ok_or_else(|| {
            BookingError::PaymentDeclined(format!("payer {} has no billing identity", payer.id))
        })?;

        let method_ref = match &booking.saved_payment_method_id {
            Some(method) => method.clone(),
            None => self
                .gateway
                .list_saved_methods(&customer_ref)
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| {
                    BookingError::PaymentDeclined("no saved payment method".to_string())
                })?,
        };

        let outcome = self
            .gateway
            .charge_off_session(
                booking.price_cents,
                &customer_ref,
                &method_ref,
                booking_metadata(booking.id),
            )
            .await?;

        match outcome {
            OffSessionOutcome::Succeeded { reference } => {
                self.orchestrator
                    .confirm_payment(booking.id, &reference, now)
                    .await?;
                Ok(ChargeOutcome::Confirmed)
            }
            OffSessionOutcome::RequiresAction { reference } => {
                // Not a hard failure: the payer has to finish a
                // strong-auth challenge out-of-band
                let mut pending = self.store.get(booking.id).await?;
                let expected = pending.status;
                pending.payment_intent_id = Some(reference);
                pending.payment_error =
                    Some("payment needs additional authentication".to_string());
                self.store.update(&pending, expected).await?;

                self.notifier.notify_action_required(&pending, &payer).await;
                tracing::info!(
                    booking_id = %booking.id,
                    "Off-session charge needs payer action"
                );
                Ok(ChargeOutcome::ActionRequired)
            }
        }
    }

    async fn record_failure(
        &self,
        booking_id: Uuid,
        error: &BookingError,
        now: OffsetDateTime,
    ) -> BookingResult<()> {
        let mut booking = self.store.get(booking_id).await?;
        let expected = booking.status;
        booking.payment_retry_count += 1;
        booking.last_payment_retry_at = Some(now);
        booking.payment_error = Some(error.to_string());
        self.store.update(&booking, expected).await?;

        tracing::warn!(
            booking_id = %booking_id,
            retry_count = booking.payment_retry_count,
            error = %error,
            "Scheduled charge failed"
        );

        if let Ok(payer) = self.orchestrator.resolve_payer(&booking, now.date()).await {
            self.notifier
                .notify_payment_failure(&booking, &payer, &error.to_string())
                .await;
        }
        Ok(())
    }

    /// Independent retry pass: release the claim flag on failed attempts
    /// that have cooled down for an hour and are under the retry cap, so
    /// the next main run reconsiders them. Bookings at or over the cap
    /// stay claimed for manual intervention.
    pub async fn retry_pass(&self, now: OffsetDateTime) -> BookingResult<u64> {
        let released = self
            .store
            .release_payment_claims(now - RETRY_COOLDOWN, MAX_PAYMENT_RETRIES)
            .await?;
        if released > 0 {
            tracing::info!(released = released, "Released failed payments for retry");
        }
        Ok(released)
    }
}
