//! Typed booking records
//!
//! Everything the engine persists or reads is an explicit struct; untyped
//! rows never leave the store boundary.

use serde::{Deserialize, Serialize};
use time::{Date, Duration, OffsetDateTime};
use uuid::Uuid;

/// Lifecycle status of a booking.
///
/// `Pending -> Accepted -> Confirmed -> Completed`, with `Declined` and
/// `Cancelled` as side branches and `TutorSuggested` as the pre-`Pending`
/// state for tutor-proposed lessons awaiting guardian approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    TutorSuggested,
    Pending,
    Accepted,
    Confirmed,
    Completed,
    Declined,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::TutorSuggested => "tutor_suggested",
            BookingStatus::Pending => "pending",
            BookingStatus::Accepted => "accepted",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Completed => "completed",
            BookingStatus::Declined => "declined",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "tutor_suggested" => Some(BookingStatus::TutorSuggested),
            "pending" => Some(BookingStatus::Pending),
            "accepted" => Some(BookingStatus::Accepted),
            "confirmed" => Some(BookingStatus::Confirmed),
            "completed" => Some(BookingStatus::Completed),
            "declined" => Some(BookingStatus::Declined),
            "cancelled" => Some(BookingStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal statuses are never transitioned out of.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BookingStatus::Completed | BookingStatus::Cancelled | BookingStatus::Declined
        )
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How payment for a booking is authorized, chosen at accept-time from
/// the time remaining until the lesson.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentAuthType {
    /// Lesson is less than 24h away: the payer completes a standard
    /// charge synchronously.
    ImmediateCharge,
    /// 24h to 7 days out: a manual-capture hold reserves the funds now.
    ImmediateAuth,
    /// 7+ days out: only a reusable payment method is saved; the charge
    /// runs later via the scheduled processor.
    DeferredAuth,
}

impl PaymentAuthType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentAuthType::ImmediateCharge => "immediate_charge",
            PaymentAuthType::ImmediateAuth => "immediate_auth",
            PaymentAuthType::DeferredAuth => "deferred_auth",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "immediate_charge" => Some(PaymentAuthType::ImmediateCharge),
            "immediate_auth" => Some(PaymentAuthType::ImmediateAuth),
            "deferred_auth" => Some(PaymentAuthType::DeferredAuth),
            _ => None,
        }
    }
}

impl std::fmt::Display for PaymentAuthType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Report the tutor submits when completing a lesson.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LessonReport {
    pub summary: String,
    pub topics_covered: Vec<String>,
    pub homework: Option<String>,
    pub progress_note: Option<String>,
}

/// A tutoring lesson booking. Never deleted, only transitioned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Booking {
    pub id: Uuid,
    pub student_id: Uuid,
    pub tutor_id: Uuid,
    pub subject: String,
    pub level: String,
    pub scheduled_at: OffsetDateTime,
    pub duration_minutes: i32,
    /// Price in minor currency units (cents)
    pub price_cents: i64,
    pub status: BookingStatus,
    pub is_paid: bool,
    /// Opaque gateway reference: a payment-intent once real money is in
    /// play, or a setup-intent / placeholder before that
    pub payment_intent_id: Option<String>,
    pub saved_payment_method_id: Option<String>,
    pub payment_auth_type: Option<PaymentAuthType>,
    /// When the scheduled processor should charge (deferred auth only)
    pub payment_scheduled_for: Option<OffsetDateTime>,
    /// When the authorization (hold or setup intent) expires
    pub payment_expires_at: Option<OffsetDateTime>,
    /// Claim flag: set before an off-session charge is attempted so
    /// overlapping processor runs skip the booking
    pub payment_attempted: bool,
    pub payment_retry_count: i32,
    pub last_payment_retry_at: Option<OffsetDateTime>,
    pub payment_error: Option<String>,
    pub paid_at: Option<OffsetDateTime>,
    pub meeting_link: Option<String>,
    pub meeting_id: Option<String>,
    pub lesson_report: Option<LessonReport>,
    pub decline_reason: Option<String>,
    pub cancellation_reason: Option<String>,
    pub refund_id: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Booking {
    /// Build a fresh `Pending` booking request.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        student_id: Uuid,
        tutor_id: Uuid,
        subject: String,
        level: String,
        scheduled_at: OffsetDateTime,
        duration_minutes: i32,
        price_cents: i64,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            student_id,
            tutor_id,
            subject,
            level,
            scheduled_at,
            duration_minutes,
            price_cents,
            status: BookingStatus::Pending,
            is_paid: false,
            payment_intent_id: None,
            saved_payment_method_id: None,
            payment_auth_type: None,
            payment_scheduled_for: None,
            payment_expires_at: None,
            payment_attempted: false,
            payment_retry_count: 0,
            last_payment_retry_at: None,
            payment_error: None,
            paid_at: None,
            meeting_link: None,
            meeting_id: None,
            lesson_report: None,
            decline_reason: None,
            cancellation_reason: None,
            refund_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Meeting window derived from the scheduled time and duration.
    pub fn meeting_window(&self) -> (OffsetDateTime, OffsetDateTime) {
        let end = self.scheduled_at + Duration::minutes(self.duration_minutes as i64);
        (self.scheduled_at, end)
    }

}

/// Role of a marketplace user, as supplied by the identity collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Student,
    Guardian,
    Tutor,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Guardian => "guardian",
            Role::Tutor => "tutor",
            Role::Admin => "admin",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "student" => Some(Role::Student),
            "guardian" => Some(Role::Guardian),
            "tutor" => Some(Role::Tutor),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

/// Read-only view of a user supplied by the identity collaborator.
#[derive(Debug, Clone)]
pub struct Profile {
    pub id: Uuid,
    pub role: Role,
    pub full_name: String,
    pub email: String,
    pub date_of_birth: Option<Date>,
    /// Student ids this user is a guardian of
    pub children: Vec<Uuid>,
    /// Gateway billing identity, lazily created on first payment need
    pub billing_ref: Option<String>,
}

impl Profile {
    /// Calendar-aware adulthood check: age in whole years, not divided
    /// milliseconds. A birthday later in the year has not happened yet.
    pub fn is_adult_at(&self, today: Date) -> bool {
        match self.date_of_birth {
            Some(dob) => {
                let mut years = today.year() - dob.year();
                if (today.month() as u8, today.day()) < (dob.month() as u8, dob.day()) {
                    years -= 1;
                }
                years >= 18
            }
            // Unknown date of birth is treated as a minor; a guardian
            // must act on their behalf
            None => false,
        }
    }

    pub fn is_guardian_of(&self, student_id: Uuid) -> bool {
        self.children.contains(&student_id)
    }
}
