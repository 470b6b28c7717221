//! End-to-end scenarios across the lifecycle, orchestrator, reconciler,
//! and processor, wired over the in-memory store and counting fakes.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::BookingError;
use crate::identity::{IdentityDirectory, MemoryIdentityDirectory};
use crate::lifecycle::{BookingLifecycle, BookingRequest};
use crate::meetings::MeetingGenerator;
use crate::model::{Booking, BookingStatus, LessonReport, PaymentAuthType, Profile, Role};
use crate::orchestrator::PaymentOrchestrator;
use crate::processor::ScheduledPaymentProcessor;
use crate::store::{BookingStore, MemoryBookingStore};
use crate::testkit::{profile, CountingNotifier, FakeGateway, FakeMeetingProvider};
use crate::webhooks::WebhookReconciler;

const SECRET: &str = "whsec_scenario_secret";

struct Engine {
    store: Arc<MemoryBookingStore>,
    identity: Arc<MemoryIdentityDirectory>,
    gateway: FakeGateway,
    provider: FakeMeetingProvider,
    notifier: CountingNotifier,
    lifecycle: BookingLifecycle,
    orchestrator: PaymentOrchestrator,
    processor: ScheduledPaymentProcessor,
    reconciler: WebhookReconciler,
    student: Profile,
    tutor: Profile,
}

async fn engine() -> Engine {
    let store = Arc::new(MemoryBookingStore::new());
    let identity = Arc::new(MemoryIdentityDirectory::new());
    let gateway = FakeGateway::new();
    let provider = FakeMeetingProvider::new();
    let notifier = CountingNotifier::new();
    let meetings =
        MeetingGenerator::new(store.clone(), identity.clone(), Arc::new(provider.clone()));
    let orchestrator = PaymentOrchestrator::new(
        store.clone(),
        Arc::new(gateway.clone()),
        identity.clone(),
        meetings.clone(),
        Arc::new(notifier.clone()),
    );
    let lifecycle = BookingLifecycle::new(
        store.clone(),
        identity.clone(),
        Arc::new(gateway.clone()),
        meetings,
    );
    let processor = ScheduledPaymentProcessor::new(
        store.clone(),
        Arc::new(gateway.clone()),
        identity.clone(),
        orchestrator.clone(),
        Arc::new(notifier.clone()),
    );
    let reconciler =
        WebhookReconciler::new(store.clone(), orchestrator.clone(), SECRET.to_string());

    let student = profile(Role::Student, Some(25));
    let tutor = profile(Role::Tutor, Some(40));
    identity.upsert(student.clone()).await;
    identity.upsert(tutor.clone()).await;

    Engine {
        store,
        identity,
        gateway,
        provider,
        notifier,
        lifecycle,
        orchestrator,
        processor,
        reconciler,
        student,
        tutor,
    }
}

fn sign(payload: &str, now: OffsetDateTime) -> String {
    let key = SECRET.strip_prefix("whsec_").unwrap_or(SECRET);
    let mut mac = Hmac::<Sha256>::new_from_slice(key.as_bytes()).unwrap();
    mac.update(format!("{}.{}", now.unix_timestamp(), payload).as_bytes());
    format!(
        "t={},v1={}",
        now.unix_timestamp(),
        hex::encode(mac.finalize().into_bytes())
    )
}

fn success_event(event_id: &str, booking_id: Uuid, reference: &str) -> String {
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

fn request(eng: &Engine, hours_out: i64, now: OffsetDateTime) -> BookingRequest {
    BookingRequest {
        student_id: eng.student.id,
        tutor_id: eng.tutor.id,
        subject: "physics".into(),
        level: "a-level".into(),
        scheduled_at: now + Duration::hours(hours_out),
        duration_minutes: 60,
        price_cents: 6500,
    }
}

/// Scenario A: booking 10 days out takes the deferred path end to end.
#[tokio::test]
async fn deferred_booking_is_charged_by_the_batch_run() {
    let eng = engine().await;
    let now = OffsetDateTime::now_utc();

    let booking = eng
        .lifecycle
        .request(eng.student.id, request(&eng, 24 * 10, now), now)
        .await
        .unwrap();
    let accepted = eng.lifecycle.accept(booking.id, eng.tutor.id, now).await.unwrap();
    assert_eq!(accepted.payment_auth_type, Some(PaymentAuthType::DeferredAuth));
    assert_eq!(
        accepted.payment_scheduled_for,
        Some(accepted.scheduled_at - Duration::hours(24))
    );

    let auth = eng
        .orchestrator
        .create_payment_authorization(booking.id, eng.student.id, now)
        .await
        .unwrap();
    assert!(auth.reference.starts_with("seti_"));

    // the gateway tells us the method was saved
    let setup_event = serde_json::json!({
        "id": "evt_setup",
        "type": "setup_intent.succeeded",
        "data": {
            "object": {
                "id": auth.reference,
                "payment_method": "pm_saved_1",
                "metadata": { "booking_id": booking.id.to_string() }
            }
        }
    })
    .to_string();
    eng.reconciler
        .process(setup_event.as_bytes(), &sign(&setup_event, now), now)
        .await
        .unwrap();

    // nothing is due before the scheduled time
    let early = eng.processor.run(now).await.unwrap();
    assert_eq!(early.processed, 0);

    let charge_time = accepted.scheduled_at - Duration::hours(24);
    let summary = eng.processor.run(charge_time).await.unwrap();
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.succeeded, 1);

    let stored = eng.store.get(booking.id).await.unwrap();
    assert!(stored.is_paid);
    assert_eq!(stored.status, BookingStatus::Confirmed);
    assert!(stored.payment_intent_id.as_deref().unwrap().starts_with("pi_"));
    assert!(stored.meeting_link.is_some());
    assert_eq!(eng.gateway.off_session_calls(), 1);
}

/// Scenario B: booking 3 hours out, charged synchronously, webhook
/// delivered twice.
#[tokio::test]
async fn immediate_charge_with_duplicate_webhook_delivery() {
    let eng = engine().await;
    let now = OffsetDateTime::now_utc();

    let booking = eng
        .lifecycle
        .request(eng.student.id, request(&eng, 3, now), now)
        .await
        .unwrap();
    let accepted = eng.lifecycle.accept(booking.id, eng.tutor.id, now).await.unwrap();
    assert_eq!(
        accepted.payment_auth_type,
        Some(PaymentAuthType::ImmediateCharge)
    );
    assert!(accepted.payment_scheduled_for.is_none());

    let auth = eng
        .orchestrator
        .create_payment_authorization(booking.id, eng.student.id, now)
        .await
        .unwrap();
    assert!(auth.reference.starts_with("pi_"));
    assert_eq!(eng.gateway.charge_calls(), 1);

    let payload = success_event("evt_pay", booking.id, &auth.reference);
    let header = sign(&payload, now);
    eng.reconciler.process(payload.as_bytes(), &header, now).await.unwrap();
    eng.reconciler.process(payload.as_bytes(), &header, now).await.unwrap();

    let stored = eng.store.get(booking.id).await.unwrap();
    assert!(stored.is_paid);
    assert_eq!(stored.status, BookingStatus::Confirmed);
    assert_eq!(stored.payment_intent_id, Some(auth.reference));
    assert_eq!(eng.provider.create_calls(), 1);
}

/// Scenario C: tutor cancels a confirmed, paid booking two hours before
/// the lesson with a twelve-character reason.
#[tokio::test]
async fn tutor_cancels_a_paid_booking_inside_the_window() {
    let eng = engine().await;
    let now = OffsetDateTime::now_utc();

    let booking = eng
        .lifecycle
        .request(eng.student.id, request(&eng, 2, now), now)
        .await
        .unwrap();
    eng.lifecycle.accept(booking.id, eng.tutor.id, now).await.unwrap();
    let auth = eng
        .orchestrator
        .create_payment_authorization(booking.id, eng.student.id, now)
        .await
        .unwrap();
    eng.orchestrator
        .confirm_payment(booking.id, &auth.reference, now)
        .await
        .unwrap();

    let reason = "family issue"; // 12 characters
    let cancelled = eng
        .lifecycle
        .cancel(booking.id, eng.tutor.id, reason, now)
        .await
        .unwrap();

    assert_eq!(cancelled.status, BookingStatus::Cancelled);
    assert!(cancelled.refund_id.is_some());
    assert_eq!(cancelled.cancellation_reason.as_deref(), Some(reason));
    assert_eq!(eng.gateway.refund_calls(), 1);
}

/// A confirmation failure after the marker commit leaves the booking
/// unpaid; redelivery short-circuits at the marker instead of retrying
/// confirmation. This is exactly what the marker invariant check hunts.
#[tokio::test]
async fn marker_gap_when_confirmation_fails_after_commit() {
    let eng = engine().await;
    let now = OffsetDateTime::now_utc();

    // still pending: confirm_paid will refuse the transition
    let booking = eng
        .lifecycle
        .request(eng.student.id, request(&eng, 48, now), now)
        .await
        .unwrap();

    let payload = success_event("evt_gap", booking.id, "pi_gap");
    let header = sign(&payload, now);

    let err = eng.reconciler.process(payload.as_bytes(), &header, now).await;
    assert!(matches!(err, Err(BookingError::Conflict(_))));

    // the provider retries, and the marker swallows the redelivery
    eng.reconciler.process(payload.as_bytes(), &header, now).await.unwrap();
    let stored = eng.store.get(booking.id).await.unwrap();
    assert!(!stored.is_paid);
}

/// Random walks over the operation set never break the money invariant:
/// a paid booking is always confirmed or completed and carries its
/// payment reference.
#[tokio::test]
async fn paid_bookings_stay_confirmed_under_random_transitions() {
    let eng = engine().await;
    let now = OffsetDateTime::now_utc();
    let mut rng = rand::thread_rng();

    let mut ids: Vec<Uuid> = Vec::new();
    for hours_out in [3i64, 30, 26 * 10, 48, 24 * 9] {
        let booking = eng
            .lifecycle
            .request(eng.student.id, request(&eng, hours_out, now), now)
            .await
            .unwrap();
        ids.push(booking.id);
    }

    let report = LessonReport {
        summary: "worked through practice papers".into(),
        topics_covered: vec!["mechanics".into()],
        homework: None,
        progress_note: None,
    };

    for step in 0..200 {
        let id = ids[rng.gen_range(0..ids.len())];
        let op = rng.gen_range(0..7u8);
        let at = now + Duration::minutes(step);

        // outcomes are irrelevant; only the invariant matters
        let _ = match op {
            0 => eng.lifecycle.accept(id, eng.tutor.id, at).await.map(|_| ()),
            1 => eng
                .orchestrator
                .confirm_payment(id, &format!("pi_rand_{}", rng.gen_range(0..3)), at)
                .await
                .map(|_| ()),
            2 => eng
                .lifecycle
                .cancel(id, eng.student.id, "", at)
                .await
                .map(|_| ()),
            3 => eng
                .lifecycle
                .cancel(id, eng.tutor.id, "cannot make this one", at)
                .await
                .map(|_| ()),
            4 => eng
                .lifecycle
                .complete(id, eng.tutor.id, report.clone(), at)
                .await
                .map(|_| ()),
            5 => eng
                .lifecycle
                .reschedule(id, eng.student.id, at + Duration::hours(50), None, at)
                .await
                .map(|_| ()),
            _ => eng
                .lifecycle
                .decline(id, eng.tutor.id, "student level mismatch", at)
                .await
                .map(|_| ()),
        };

        for id in &ids {
            let b = eng.store.get(*id).await.unwrap();
            if b.is_paid {
                assert!(
                    matches!(b.status, BookingStatus::Confirmed | BookingStatus::Completed),
                    "paid booking {} drifted to {}",
                    b.id,
                    b.status
                );
                assert!(b.payment_intent_id.is_some());
            }
        }
    }
}

/// Payment failure webhooks record the error and notify without moving
/// the booking.
#[tokio::test]
async fn failure_event_notifies_the_payer() {
    let eng = engine().await;
    let now = OffsetDateTime::now_utc();

    let booking = eng
        .lifecycle
        .request(eng.student.id, request(&eng, 48, now), now)
        .await
        .unwrap();
    eng.lifecycle.accept(booking.id, eng.tutor.id, now).await.unwrap();

    let payload = serde_json::json!({
        "id": "evt_fail",
        "type": "payment_intent.payment_failed",
        "data": {
            "object": {
                "id": "pi_failed",
                "failure_message": "insufficient funds",
                "metadata": { "booking_id": booking.id.to_string() }
            }
        }
    })
    .to_string();
    eng.reconciler
        .process(payload.as_bytes(), &sign(&payload, now), now)
        .await
        .unwrap();

    let stored = eng.store.get(booking.id).await.unwrap();
    assert_eq!(stored.status, BookingStatus::Accepted);
    assert!(!stored.is_paid);
    assert_eq!(stored.payment_error.as_deref(), Some("insufficient funds"));
    assert_eq!(eng.notifier.failure_count(), 1);
    assert_eq!(
        eng.notifier.last_failure_reason().as_deref(),
        Some("insufficient funds")
    );
}

/// Manual confirmation and the webhook path converge on the same state.
#[tokio::test]
async fn manual_and_webhook_confirmation_share_the_funnel() {
    let eng = engine().await;
    let now = OffsetDateTime::now_utc();

    let booking = eng
        .lifecycle
        .request(eng.student.id, request(&eng, 3, now), now)
        .await
        .unwrap();
    eng.lifecycle.accept(booking.id, eng.tutor.id, now).await.unwrap();
    let auth = eng
        .orchestrator
        .create_payment_authorization(booking.id, eng.student.id, now)
        .await
        .unwrap();

    // frontend confirms first, then the webhook lands for the same reference
    eng.orchestrator
        .confirm_payment(booking.id, &auth.reference, now)
        .await
        .unwrap();
    let payload = success_event("evt_late", booking.id, &auth.reference);
    eng.reconciler
        .process(payload.as_bytes(), &sign(&payload, now), now)
        .await
        .unwrap();

    let stored = eng.store.get(booking.id).await.unwrap();
    assert!(stored.is_paid);
    assert_eq!(eng.provider.create_calls(), 1);
}

#[tokio::test]
async fn identity_is_shared_between_lifecycle_and_payments() {
    let eng = engine().await;
    let now = OffsetDateTime::now_utc();

    // first authorization mints the billing identity, later ones reuse it
    for hours_out in [30i64, 50] {
        let booking = eng
            .lifecycle
            .request(eng.student.id, request(&eng, hours_out, now), now)
            .await
            .unwrap();
        eng.lifecycle.accept(booking.id, eng.tutor.id, now).await.unwrap();
        eng.orchestrator
            .create_payment_authorization(booking.id, eng.student.id, now)
            .await
            .unwrap();
    }

    assert_eq!(eng.gateway.customer_calls(), 1);
    let payer = eng.identity.profile(eng.student.id).await.unwrap();
    assert!(payer.billing_ref.is_some());
}
