//! Booking state machine
//!
//! `Pending -> Accepted -> Confirmed -> Completed`, with `Declined` and
//! `Cancelled` side branches and a `TutorSuggested` pre-state for lessons
//! a tutor proposes. Every transition re-reads the booking and writes it
//! back guarded by the status it read, so stale transitions lose at the
//! store. Authorization is role plus relationship: the assigned tutor,
//! an adult student, or a guardian of the student.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BookingError, BookingResult};
use crate::gateway::PaymentGateway;
use crate::identity::IdentityDirectory;
use crate::meetings::MeetingGenerator;
use crate::model::{Booking, BookingStatus, LessonReport, PaymentAuthType, Role};
use crate::orchestrator::{payment_schedule_for, select_strategy};
use crate::store::BookingStore;

/// Decline and in-window cancellation reasons must carry at least this
/// many characters.
pub const MIN_REASON_LEN: usize = 10;

/// Students and guardians cannot cancel inside this pre-lesson window.
pub const CANCELLATION_WINDOW_HOURS: i64 = 24;

/// Parameters for a new booking request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingRequest {
    pub student_id: Uuid,
    pub tutor_id: Uuid,
    pub subject: String,
    pub level: String,
    pub scheduled_at: OffsetDateTime,
    pub duration_minutes: i32,
    pub price_cents: i64,
}

#[derive(Clone)]
pub struct BookingLifecycle {
    store: Arc<dyn BookingStore>,
    identity: Arc<dyn IdentityDirectory>,
    gateway: Arc<dyn PaymentGateway>,
    meetings: MeetingGenerator,
}

impl BookingLifecycle {
    pub fn new(
        store: Arc<dyn BookingStore>,
        identity: Arc<dyn IdentityDirectory>,
        gateway: Arc<dyn PaymentGateway>,
        meetings: MeetingGenerator,
    ) -> Self {
        Self {
            store,
            identity,
            gateway,
            meetings,
        }
    }

    fn validate_request(request: &BookingRequest, now: OffsetDateTime) -> BookingResult<()> {
        if request.scheduled_at <= now {
            return Err(BookingError::Validation(
                "lesson must be scheduled in the future".to_string(),
            ));
        }
        if request.duration_minutes <= 0 {
            return Err(BookingError::Validation(
                "lesson duration must be positive".to_string(),
            ));
        }
        if request.price_cents <= 0 {
            return Err(BookingError::Validation(
                "lesson price must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Create a `Pending` booking. The requester must be the student or
    /// a guardian of the student.
    pub async fn request(
        &self,
        requester_id: Uuid,
        request: BookingRequest,
        now: OffsetDateTime,
    ) -> BookingResult<Booking> {
        Self::validate_request(&request, now)?;

        if requester_id != request.student_id {
            let requester = self.identity.profile(requester_id).await?;
            if !requester.is_guardian_of(request.student_id) && requester.role != Role::Admin {
                return Err(BookingError::Unauthorized(
                    "only the student or their guardian can request a booking".to_string(),
                ));
            }
        }

        let booking = Booking::new(
            request.student_id,
            request.tutor_id,
            request.subject,
            request.level,
            request.scheduled_at,
            request.duration_minutes,
            request.price_cents,
            now,
        );
        self.store.insert(&booking).await?;
        tracing::info!(booking_id = %booking.id, tutor_id = %booking.tutor_id, "Booking requested");
        Ok(booking)
    }

    /// Tutor proposes a lesson; it waits in `TutorSuggested` for guardian
    /// (or adult-student) approval.
    pub async fn suggest(
        &self,
        tutor_id: Uuid,
        request: BookingRequest,
        now: OffsetDateTime,
    ) -> BookingResult<Booking> {
        Self::validate_request(&request, now)?;

        if tutor_id != request.tutor_id {
            return Err(BookingError::Unauthorized(
                "a tutor can only suggest their own lessons".to_string(),
            ));
        }

        let mut booking = Booking::new(
            request.student_id,
            request.tutor_id,
            request.subject,
            request.level,
            request.scheduled_at,
            request.duration_minutes,
            request.price_cents,
            now,
        );
        booking.status = BookingStatus::TutorSuggested;
        self.store.insert(&booking).await?;
        tracing::info!(booking_id = %booking.id, "Lesson suggested by tutor");
        Ok(booking)
    }

    /// Approve a tutor-suggested lesson, moving it to `Pending`. Only an
    /// adult student or the student's guardian may approve.
    pub async fn approve_suggestion(
        &self,
        booking_id: Uuid,
        requester_id: Uuid,
        now: OffsetDateTime,
    ) -> BookingResult<Booking> {
        let mut booking = self.store.get(booking_id).await?;
        if booking.status != BookingStatus::TutorSuggested {
            return Err(BookingError::Conflict(format!(
                "booking {} is '{}', only a suggested lesson can be approved",
                booking_id, booking.status
            )));
        }

        let requester = self.identity.profile(requester_id).await?;
        let is_adult_student =
            requester_id == booking.student_id && requester.is_adult_at(now.date());
        if !is_adult_student
            && !requester.is_guardian_of(booking.student_id)
            && requester.role != Role::Admin
        {
            return Err(BookingError::Unauthorized(
                "only the student or their guardian can approve a suggested lesson".to_string(),
            ));
        }

        booking.status = BookingStatus::Pending;
        self.store
            .update(&booking, BookingStatus::TutorSuggested)
            .await?;
        tracing::info!(booking_id = %booking_id, "Suggested lesson approved");
        Ok(booking)
    }

    /// Tutor accepts a pending booking. Acceptance also fixes the payment
    /// strategy from the time remaining until the lesson.
    pub async fn accept(
        &self,
        booking_id: Uuid,
        requester_id: Uuid,
        now: OffsetDateTime,
    ) -> BookingResult<Booking> {
        let mut booking = self.store.get(booking_id).await?;
        if requester_id != booking.tutor_id {
            return Err(BookingError::Unauthorized(
                "only the assigned tutor can accept a booking".to_string(),
            ));
        }
        if booking.status != BookingStatus::Pending {
            return Err(BookingError::Conflict(format!(
                "booking {} is '{}', only a pending booking can be accepted",
                booking_id, booking.status
            )));
        }

        let strategy = select_strategy(booking.scheduled_at, now);
        booking.status = BookingStatus::Accepted;
        booking.payment_auth_type = Some(strategy);
        booking.payment_scheduled_for = match strategy {
            PaymentAuthType::DeferredAuth => Some(payment_schedule_for(booking.scheduled_at)),
            _ => None,
        };
        self.store.update(&booking, BookingStatus::Pending).await?;

        tracing::info!(
            booking_id = %booking_id,
            strategy = %strategy,
            "Booking accepted"
        );
        Ok(booking)
    }

    /// Tutor declines a pending booking with a reason.
    pub async fn decline(
        &self,
        booking_id: Uuid,
        requester_id: Uuid,
        reason: &str,
        _now: OffsetDateTime,
    ) -> BookingResult<Booking> {
        let mut booking = self.store.get(booking_id).await?;
        if requester_id != booking.tutor_id {
            return Err(BookingError::Unauthorized(
                "only the assigned tutor can decline a booking".to_string(),
            ));
        }
        if booking.status != BookingStatus::Pending {
            return Err(BookingError::Conflict(format!(
                "booking {} is '{}', only a pending booking can be declined",
                booking_id, booking.status
            )));
        }
        if reason.trim().chars().count() < MIN_REASON_LEN {
            return Err(BookingError::Validation(format!(
                "decline reason must be at least {} characters",
                MIN_REASON_LEN
            )));
        }

        booking.status = BookingStatus::Declined;
        booking.decline_reason = Some(reason.trim().to_string());
        self.store.update(&booking, BookingStatus::Pending).await?;
        tracing::info!(booking_id = %booking_id, "Booking declined");
        Ok(booking)
    }

    /// Cancel a booking. Tutors may cancel any time (with a reason inside
    /// the 24h window); students and guardians only outside that window.
    /// Paid bookings are refunded before the state changes, and a refund
    /// failure blocks the cancellation.
    pub async fn cancel(
        &self,
        booking_id: Uuid,
        requester_id: Uuid,
        reason: &str,
        now: OffsetDateTime,
    ) -> BookingResult<Booking> {
        let mut booking = self.store.get(booking_id).await?;
        if booking.status.is_terminal() {
            return Err(BookingError::Conflict(format!(
                "booking {} is already '{}'",
                booking_id, booking.status
            )));
        }

        let requester = self.identity.profile(requester_id).await?;
        let is_tutor = requester_id == booking.tutor_id;
        let is_adult_student =
            requester_id == booking.student_id && requester.is_adult_at(now.date());
        let is_guardian = requester.is_guardian_of(booking.student_id);
        let is_admin = requester.role == Role::Admin;

        if !is_tutor && !is_adult_student && !is_guardian && !is_admin {
            return Err(BookingError::Unauthorized(
                "not allowed to cancel this booking".to_string(),
            ));
        }

        // Inside the window: non-tutors are refused outright; tutors must
        // justify themselves.
        let within_window =
            booking.scheduled_at - now < Duration::hours(CANCELLATION_WINDOW_HOURS);
        if within_window {
            if !is_tutor && !is_admin {
                return Err(BookingError::Validation(format!(
                    "bookings cannot be cancelled within {} hours of the lesson",
                    CANCELLATION_WINDOW_HOURS
                )));
            }
            if is_tutor && reason.trim().chars().count() < MIN_REASON_LEN {
                return Err(BookingError::Validation(format!(
                    "a cancellation this close to the lesson needs a reason of at least {} characters",
                    MIN_REASON_LEN
                )));
            }
        }

        // Refund before persisting: a cancelled booking holding captured
        // funds is worse than a failed cancellation.
        if booking.is_paid {
            let reference = booking.payment_intent_id.clone().ok_or_else(|| {
                BookingError::Internal(format!(
                    "paid booking {} has no payment reference",
                    booking_id
                ))
            })?;
            let refund_id = self.gateway.refund(&reference).await?;
            tracing::info!(
                booking_id = %booking_id,
                refund_id = %refund_id,
                "Refund issued for cancelled booking"
            );
            booking.refund_id = Some(refund_id);
            // the money went back, so the booking is no longer paid
            booking.is_paid = false;
        }

        let expected = booking.status;
        booking.status = BookingStatus::Cancelled;
        booking.cancellation_reason = Some(reason.trim().to_string()).filter(|r| !r.is_empty());
        self.store.update(&booking, expected).await?;

        if let Some(meeting_ref) = &booking.meeting_id {
            self.meetings.delete_for_booking(meeting_ref).await;
        }

        tracing::info!(booking_id = %booking_id, by = %requester_id, "Booking cancelled");
        Ok(booking)
    }

    /// Tutor completes a confirmed lesson, attaching the lesson report.
    pub async fn complete(
        &self,
        booking_id: Uuid,
        requester_id: Uuid,
        report: LessonReport,
        _now: OffsetDateTime,
    ) -> BookingResult<Booking> {
        let mut booking = self.store.get(booking_id).await?;
        if requester_id != booking.tutor_id {
            return Err(BookingError::Unauthorized(
                "only the assigned tutor can complete a lesson".to_string(),
            ));
        }
        if booking.status != BookingStatus::Confirmed {
            return Err(BookingError::Conflict(format!(
                "booking {} is '{}', only a confirmed lesson can be completed",
                booking_id, booking.status
            )));
        }
        if report.summary.trim().is_empty() {
            return Err(BookingError::Validation(
                "lesson report needs a summary".to_string(),
            ));
        }

        booking.status = BookingStatus::Completed;
        booking.lesson_report = Some(report);
        self.store.update(&booking, BookingStatus::Confirmed).await?;
        tracing::info!(booking_id = %booking_id, "Lesson completed");
        Ok(booking)
    }

    /// Move a booking to a new time. Unpaid bookings get a freshly
    /// computed payment strategy and cleared attempt state; a booking
    /// that already had a meeting link gets it reissued for the new
    /// window (best effort).
    pub async fn reschedule(
        &self,
        booking_id: Uuid,
        requester_id: Uuid,
        new_time: OffsetDateTime,
        new_duration_minutes: Option<i32>,
        now: OffsetDateTime,
    ) -> BookingResult<Booking> {
        if new_time <= now {
            return Err(BookingError::Validation(
                "lesson must be rescheduled to a future time".to_string(),
            ));
        }
        if new_duration_minutes.is_some_and(|d| d <= 0) {
            return Err(BookingError::Validation(
                "lesson duration must be positive".to_string(),
            ));
        }

        let mut booking = self.store.get(booking_id).await?;
        if booking.status.is_terminal() {
            return Err(BookingError::Conflict(format!(
                "booking {} is '{}' and cannot be rescheduled",
                booking_id, booking.status
            )));
        }

        let requester = self.identity.profile(requester_id).await?;
        let is_tutor = requester_id == booking.tutor_id;
        let is_adult_student =
            requester_id == booking.student_id && requester.is_adult_at(now.date());
        let is_guardian = requester.is_guardian_of(booking.student_id);
        if !is_tutor && !is_adult_student && !is_guardian && requester.role != Role::Admin {
            return Err(BookingError::Unauthorized(
                "not allowed to reschedule this booking".to_string(),
            ));
        }

        let expected = booking.status;
        booking.scheduled_at = new_time;
        if let Some(duration) = new_duration_minutes {
            booking.duration_minutes = duration;
        }

        if !booking.is_paid {
            let strategy = select_strategy(new_time, now);
            booking.payment_auth_type = Some(strategy);
            booking.payment_scheduled_for = match strategy {
                PaymentAuthType::DeferredAuth => Some(payment_schedule_for(new_time)),
                _ => None,
            };
            booking.payment_attempted = false;
            booking.payment_retry_count = 0;
            booking.last_payment_retry_at = None;
            booking.payment_error = None;
        }

        self.store.update(&booking, expected).await?;
        tracing::info!(
            booking_id = %booking_id,
            scheduled_at = %new_time,
            "Booking rescheduled"
        );

        if booking.meeting_link.is_some() {
            if let Err(e) = self.meetings.regenerate_for_booking(booking_id).await {
                tracing::warn!(
                    booking_id = %booking_id,
                    error = %e,
                    "Meeting regeneration failed after reschedule"
                );
            } else {
                booking = self.store.get(booking_id).await?;
            }
        }

        Ok(booking)
    }
}
