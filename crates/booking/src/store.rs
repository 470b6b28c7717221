//! Booking persistence
//!
//! `BookingStore` is the single source of truth; no component caches
//! booking state across calls. Every mutation is a read-modify-write: the
//! update carries the status the caller read, and a mismatch at write time
//! rejects the stale transition. The processed-event marker insert is the
//! atomic claim that gives webhook confirmation its exactly-once guarantee.
//!
//! `PgBookingStore` is the production implementation; `MemoryBookingStore`
//! backs tests and local development without a database.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{BookingError, BookingResult};
use crate::model::{Booking, BookingStatus, LessonReport, PaymentAuthType};

#[async_trait]
pub trait BookingStore: Send + Sync {
    async fn get(&self, id: Uuid) -> BookingResult<Booking>;

    async fn insert(&self, booking: &Booking) -> BookingResult<()>;

    /// Write the booking back, guarded by the status the caller read.
    /// Returns `Conflict` if the stored status has moved on since.
    async fn update(&self, booking: &Booking, expected: BookingStatus) -> BookingResult<()>;

    /// Persist a freshly issued meeting link and provider reference.
    async fn set_meeting(&self, id: Uuid, join_url: &str, meeting_ref: &str) -> BookingResult<()>;

    /// Atomically mark the booking paid and confirmed. Rejected with
    /// `Conflict` unless the booking is `Accepted` (or already `Confirmed`,
    /// for idempotent re-runs).
    async fn confirm_paid(
        &self,
        id: Uuid,
        reference: &str,
        paid_at: OffsetDateTime,
    ) -> BookingResult<Booking>;

    /// Deferred-auth bookings whose scheduled charge is due: accepted,
    /// unpaid, unclaimed, `payment_scheduled_for <= now`.
    async fn due_deferred(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> BookingResult<Vec<Booking>>;

    /// Claim-before-attempt flag flip. Returns false when another run
    /// already claimed the booking, it got paid, or it left `Accepted`
    /// (cancelled between the due scan and the claim) in the meantime.
    async fn claim_payment_attempt(&self, id: Uuid) -> BookingResult<bool>;

    /// Retry pass: release claims for failed attempts that have cooled
    /// down and are under the retry cap, so the next main run reconsiders
    /// them. Returns the number of bookings released.
    async fn release_payment_claims(
        &self,
        cooled_before: OffsetDateTime,
        max_retries: i32,
    ) -> BookingResult<u64>;

    /// Record a processed gateway event. Returns true when this call
    /// inserted the marker, false when the event was already recorded.
    async fn mark_event_processed(&self, event_id: &str, booking_id: Uuid) -> BookingResult<bool>;

    /// Retention purge for the idempotency ledger.
    async fn purge_processed_events(&self, older_than: OffsetDateTime) -> BookingResult<u64>;

    /// Hold-authorized bookings whose uncaptured hold has expired.
    async fn expired_holds(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> BookingResult<Vec<Booking>>;
}

// ---------------------------------------------------------------------------
// Postgres implementation
// ---------------------------------------------------------------------------

const BOOKING_COLUMNS: &str = r#"
    id, student_id, tutor_id, subject, level, scheduled_at, duration_minutes,
    price_cents, status, is_paid, payment_intent_id, saved_payment_method_id,
    payment_auth_type, payment_scheduled_for, payment_expires_at,
    payment_attempted, payment_retry_count, last_payment_retry_at,
    payment_error, paid_at, meeting_link, meeting_id, lesson_report,
    decline_reason, cancellation_reason, refund_id, created_at, updated_at
"#;

/// Raw row shape; converted to the typed [`Booking`] at this boundary only.
#[derive(Debug, sqlx::FromRow)]
struct BookingRow {
    id: Uuid,
    student_id: Uuid,
    tutor_id: Uuid,
    subject: String,
    level: String,
    scheduled_at: OffsetDateTime,
    duration_minutes: i32,
    price_cents: i64,
    status: String,
    is_paid: bool,
    payment_intent_id: Option<String>,
    saved_payment_method_id: Option<String>,
    payment_auth_type: Option<String>,
    payment_scheduled_for: Option<OffsetDateTime>,
    payment_expires_at: Option<OffsetDateTime>,
    payment_attempted: bool,
    payment_retry_count: i32,
    last_payment_retry_at: Option<OffsetDateTime>,
    payment_error: Option<String>,
    paid_at: Option<OffsetDateTime>,
    meeting_link: Option<String>,
    meeting_id: Option<String>,
    lesson_report: Option<serde_json::Value>,
    decline_reason: Option<String>,
    cancellation_reason: Option<String>,
    refund_id: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl BookingRow {
    fn into_booking(self) -> BookingResult<Booking> {
        let status = BookingStatus::from_str(&self.status).ok_or_else(|| {
            BookingError::Database(format!("unknown booking status '{}'", self.status))
        })?;
        let payment_auth_type = match self.payment_auth_type.as_deref() {
            Some(s) => Some(PaymentAuthType::from_str(s).ok_or_else(|| {
                BookingError::Database(format!("unknown payment auth type '{}'", s))
            })?),
            None => None,
        };
        let lesson_report: Option<LessonReport> = match self.lesson_report {
            Some(value) => Some(serde_json::from_value(value).map_err(|e| {
                BookingError::Database(format!("malformed lesson report: {}", e))
            })?),
            None => None,
        };

        Ok(Booking {
            id: self.id,
            student_id: self.student_id,
            tutor_id: self.tutor_id,
            subject: self.subject,
            level: self.level,
            scheduled_at: self.scheduled_at,
            duration_minutes: self.duration_minutes,
            price_cents: self.price_cents,
            status,
            is_paid: self.is_paid,
            payment_intent_id: self.payment_intent_id,
            saved_payment_method_id: self.saved_payment_method_id,
            payment_auth_type,
            payment_scheduled_for: self.payment_scheduled_for,
            payment_expires_at: self.payment_expires_at,
            payment_attempted: self.payment_attempted,
            payment_retry_count: self.payment_retry_count,
            last_payment_retry_at: self.last_payment_retry_at,
            payment_error: self.payment_error,
            paid_at: self.paid_at,
            meeting_link: self.meeting_link,
            meeting_id: self.meeting_id,
            lesson_report,
            decline_reason: self.decline_reason,
            cancellation_reason: self.cancellation_reason,
            refund_id: self.refund_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn report_to_json(report: &Option<LessonReport>) -> BookingResult<Option<serde_json::Value>> {
    report
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .map_err(|e| BookingError::Internal(format!("failed to serialize lesson report: {}", e)))
}

#[derive(Clone)]
pub struct PgBookingStore {
    pool: PgPool,
}

impl PgBookingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BookingStore for PgBookingStore {
    async fn get(&self, id: Uuid) -> BookingResult<Booking> {
        let row: Option<BookingRow> = sqlx::query_as(&format!(
            "SELECT {} FROM bookings WHERE id = $1",
            BOOKING_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or(BookingError::BookingNotFound(id))?.into_booking()
    }

    async fn insert(&self, booking: &Booking) -> BookingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO bookings (
                id, student_id, tutor_id, subject, level, scheduled_at,
                duration_minutes, price_cents, status, is_paid,
                payment_auth_type, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(booking.id)
        .bind(booking.student_id)
        .bind(booking.tutor_id)
        .bind(&booking.subject)
        .bind(&booking.level)
        .bind(booking.scheduled_at)
        .bind(booking.duration_minutes)
        .bind(booking.price_cents)
        .bind(booking.status.as_str())
        .bind(booking.is_paid)
        .bind(booking.payment_auth_type.map(|t| t.as_str()))
        .bind(booking.created_at)
        .bind(booking.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update(&self, booking: &Booking, expected: BookingStatus) -> BookingResult<()> {
        let lesson_report = report_to_json(&booking.lesson_report)?;

        let result = sqlx::query(
            r#"
            UPDATE bookings SET
                scheduled_at = $3,
                duration_minutes = $4,
                status = $5,
                is_paid = $6,
                payment_intent_id = $7,
                saved_payment_method_id = $8,
                payment_auth_type = $9,
                payment_scheduled_for = $10,
                payment_expires_at = $11,
                payment_attempted = $12,
                payment_retry_count = $13,
                last_payment_retry_at = $14,
                payment_error = $15,
                paid_at = $16,
                meeting_link = $17,
                meeting_id = $18,
                lesson_report = $19,
                decline_reason = $20,
                cancellation_reason = $21,
                refund_id = $22,
                updated_at = NOW()
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(booking.id)
        .bind(expected.as_str())
        .bind(booking.scheduled_at)
        .bind(booking.duration_minutes)
        .bind(booking.status.as_str())
        .bind(booking.is_paid)
        .bind(&booking.payment_intent_id)
        .bind(&booking.saved_payment_method_id)
        .bind(booking.payment_auth_type.map(|t| t.as_str()))
        .bind(booking.payment_scheduled_for)
        .bind(booking.payment_expires_at)
        .bind(booking.payment_attempted)
        .bind(booking.payment_retry_count)
        .bind(booking.last_payment_retry_at)
        .bind(&booking.payment_error)
        .bind(booking.paid_at)
        .bind(&booking.meeting_link)
        .bind(&booking.meeting_id)
        .bind(lesson_report)
        .bind(&booking.decline_reason)
        .bind(&booking.cancellation_reason)
        .bind(&booking.refund_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Distinguish a stale transition from a missing booking
            let exists: Option<(String,)> =
                sqlx::query_as("SELECT status FROM bookings WHERE id = $1")
                    .bind(booking.id)
                    .fetch_optional(&self.pool)
                    .await?;
            return match exists {
                Some((current,)) => Err(BookingError::Conflict(format!(
                    "booking {} is '{}', expected '{}'",
                    booking.id, current, expected
                ))),
                None => Err(BookingError::BookingNotFound(booking.id)),
            };
        }

        Ok(())
    }

    async fn set_meeting(&self, id: Uuid, join_url: &str, meeting_ref: &str) -> BookingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE bookings
            SET meeting_link = $2, meeting_id = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(join_url)
        .bind(meeting_ref)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BookingError::BookingNotFound(id));
        }
        Ok(())
    }

    async fn confirm_paid(
        &self,
        id: Uuid,
        reference: &str,
        paid_at: OffsetDateTime,
    ) -> BookingResult<Booking> {
        let row: Option<BookingRow> = sqlx::query_as(&format!(
            r#"
            UPDATE bookings SET
                is_paid = TRUE,
                payment_intent_id = $2,
                paid_at = $3,
                status = 'confirmed',
                payment_error = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status IN ('accepted', 'confirmed')
            RETURNING {}
            "#,
            BOOKING_COLUMNS
        ))
        .bind(id)
        .bind(reference)
        .bind(paid_at)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.into_booking(),
            None => {
                let exists: Option<(String,)> =
                    sqlx::query_as("SELECT status FROM bookings WHERE id = $1")
                        .bind(id)
                        .fetch_optional(&self.pool)
                        .await?;
                match exists {
                    Some((current,)) => Err(BookingError::Conflict(format!(
                        "cannot confirm payment for booking {} in status '{}'",
                        id, current
                    ))),
                    None => Err(BookingError::BookingNotFound(id)),
                }
            }
        }
    }

    async fn due_deferred(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> BookingResult<Vec<Booking>> {
        let rows: Vec<BookingRow> = sqlx::query_as(&format!(
            r#"
            SELECT {}
            FROM bookings
            WHERE status = 'accepted'
              AND is_paid = FALSE
              AND payment_attempted = FALSE
              AND payment_scheduled_for IS NOT NULL
              AND payment_scheduled_for <= $1
            ORDER BY payment_scheduled_for ASC
            LIMIT $2
            "#,
            BOOKING_COLUMNS
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(BookingRow::into_booking).collect()
    }

    async fn claim_payment_attempt(&self, id: Uuid) -> BookingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE bookings
            SET payment_attempted = TRUE, updated_at = NOW()
            WHERE id = $1
              AND status = 'accepted'
              AND payment_attempted = FALSE
              AND is_paid = FALSE
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_payment_claims(
        &self,
        cooled_before: OffsetDateTime,
        max_retries: i32,
    ) -> BookingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE bookings
            SET payment_attempted = FALSE, updated_at = NOW()
            WHERE status = 'accepted'
              AND payment_attempted = TRUE
              AND is_paid = FALSE
              AND payment_error IS NOT NULL
              AND payment_retry_count < $1
              AND last_payment_retry_at IS NOT NULL
              AND last_payment_retry_at <= $2
            "#,
        )
        .bind(max_retries)
        .bind(cooled_before)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn mark_event_processed(&self, event_id: &str, booking_id: Uuid) -> BookingResult<bool> {
        // Atomic claim: only one concurrent delivery gets a row back
        let claimed: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO processed_payment_events (event_id, booking_id, processed_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (event_id) DO NOTHING
            RETURNING event_id
            "#,
        )
        .bind(event_id)
        .bind(booking_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed.is_some())
    }

    async fn purge_processed_events(&self, older_than: OffsetDateTime) -> BookingResult<u64> {
        let result = sqlx::query("DELETE FROM processed_payment_events WHERE processed_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn expired_holds(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> BookingResult<Vec<Booking>> {
        let rows: Vec<BookingRow> = sqlx::query_as(&format!(
            r#"
            SELECT {}
            FROM bookings
            WHERE status = 'accepted'
              AND is_paid = FALSE
              AND payment_auth_type = 'immediate_auth'
              AND payment_intent_id IS NOT NULL
              AND payment_expires_at IS NOT NULL
              AND payment_expires_at < $1
            ORDER BY payment_expires_at ASC
            LIMIT $2
            "#,
            BOOKING_COLUMNS
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(BookingRow::into_booking).collect()
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryInner {
    bookings: HashMap<Uuid, Booking>,
    processed_events: HashSet<String>,
}

/// In-memory store for tests and local development.
#[derive(Clone, Default)]
pub struct MemoryBookingStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryBookingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BookingStore for MemoryBookingStore {
    async fn get(&self, id: Uuid) -> BookingResult<Booking> {
        let inner = self.inner.lock().await;
        inner
            .bookings
            .get(&id)
            .cloned()
            .ok_or(BookingError::BookingNotFound(id))
    }

    async fn insert(&self, booking: &Booking) -> BookingResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.bookings.contains_key(&booking.id) {
            return Err(BookingError::Conflict(format!(
                "booking {} already exists",
                booking.id
            )));
        }
        inner.bookings.insert(booking.id, booking.clone());
        Ok(())
    }

    async fn update(&self, booking: &Booking, expected: BookingStatus) -> BookingResult<()> {
        let mut inner = self.inner.lock().await;
        let stored = inner
            .bookings
            .get_mut(&booking.id)
            .ok_or(BookingError::BookingNotFound(booking.id))?;
        if stored.status != expected {
            return Err(BookingError::Conflict(format!(
                "booking {} is '{}', expected '{}'",
                booking.id, stored.status, expected
            )));
        }
        let mut updated = booking.clone();
        updated.updated_at = OffsetDateTime::now_utc();
        *stored = updated;
        Ok(())
    }

    async fn set_meeting(&self, id: Uuid, join_url: &str, meeting_ref: &str) -> BookingResult<()> {
        let mut inner = self.inner.lock().await;
        let stored = inner
            .bookings
            .get_mut(&id)
            .ok_or(BookingError::BookingNotFound(id))?;
        stored.meeting_link = Some(join_url.to_string());
        stored.meeting_id = Some(meeting_ref.to_string());
        stored.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn confirm_paid(
        &self,
        id: Uuid,
        reference: &str,
        paid_at: OffsetDateTime,
    ) -> BookingResult<Booking> {
        let mut inner = self.inner.lock().await;
        let stored = inner
            .bookings
            .get_mut(&id)
            .ok_or(BookingError::BookingNotFound(id))?;
        if !matches!(
            stored.status,
            BookingStatus::Accepted | BookingStatus::Confirmed
        ) {
            return Err(BookingError::Conflict(format!(
                "cannot confirm payment for booking {} in status '{}'",
                id, stored.status
            )));
        }
        stored.is_paid = true;
        stored.payment_intent_id = Some(reference.to_string());
        stored.paid_at = Some(paid_at);
        stored.status = BookingStatus::Confirmed;
        stored.payment_error = None;
        stored.updated_at = OffsetDateTime::now_utc();
        Ok(stored.clone())
    }

    async fn due_deferred(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> BookingResult<Vec<Booking>> {
        let inner = self.inner.lock().await;
        let mut due: Vec<Booking> = inner
            .bookings
            .values()
            .filter(|b| {
                b.status == BookingStatus::Accepted
                    && !b.is_paid
                    && !b.payment_attempted
                    && b.payment_scheduled_for.is_some_and(|at| at <= now)
            })
            .cloned()
            .collect();
        due.sort_by_key(|b| b.payment_scheduled_for);
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn claim_payment_attempt(&self, id: Uuid) -> BookingResult<bool> {
        let mut inner = self.inner.lock().await;
        let stored = inner
            .bookings
            .get_mut(&id)
            .ok_or(BookingError::BookingNotFound(id))?;
        if stored.status != BookingStatus::Accepted || stored.payment_attempted || stored.is_paid {
            return Ok(false);
        }
        stored.payment_attempted = true;
        stored.updated_at = OffsetDateTime::now_utc();
        Ok(true)
    }

    async fn release_payment_claims(
        &self,
        cooled_before: OffsetDateTime,
        max_retries: i32,
    ) -> BookingResult<u64> {
        let mut inner = self.inner.lock().await;
        let mut released = 0u64;
        for booking in inner.bookings.values_mut() {
            if booking.status == BookingStatus::Accepted
                && booking.payment_attempted
                && !booking.is_paid
                && booking.payment_error.is_some()
                && booking.payment_retry_count < max_retries
                && booking
                    .last_payment_retry_at
                    .is_some_and(|at| at <= cooled_before)
            {
                booking.payment_attempted = false;
                booking.updated_at = OffsetDateTime::now_utc();
                released += 1;
            }
        }
        Ok(released)
    }

    async fn mark_event_processed(&self, event_id: &str, _booking_id: Uuid) -> BookingResult<bool> {
        let mut inner = self.inner.lock().await;
        Ok(inner.processed_events.insert(event_id.to_string()))
    }

    async fn purge_processed_events(&self, _older_than: OffsetDateTime) -> BookingResult<u64> {
        // The memory store keeps no timestamps; retention only matters in Postgres
        Ok(0)
    }

    async fn expired_holds(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> BookingResult<Vec<Booking>> {
        let inner = self.inner.lock().await;
        let mut expired: Vec<Booking> = inner
            .bookings
            .values()
            .filter(|b| {
                b.status == BookingStatus::Accepted
                    && !b.is_paid
                    && b.payment_auth_type == Some(PaymentAuthType::ImmediateAuth)
                    && b.payment_intent_id.is_some()
                    && b.payment_expires_at.is_some_and(|at| at < now)
            })
            .cloned()
            .collect();
        expired.sort_by_key(|b| b.payment_expires_at);
        expired.truncate(limit as usize);
        Ok(expired)
    }
}
