//! Booking consistency checks
//!
//! Executable, non-destructive SQL invariants run after mutations or on
//! a schedule. Each check reads only; violations carry enough context to
//! debug by hand. The marker check doubles as the repair sweep for
//! webhook deliveries whose confirmation failed after the idempotency
//! marker was committed.

use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BookingResult;
use crate::processor::MAX_PAYMENT_RETRIES;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ViolationSeverity {
    /// Money may be in the wrong place
    Critical,
    /// Inconsistent but recoverable without touching funds
    Warning,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::Warning => write!(f, "WARNING"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InvariantViolation {
    pub invariant: &'static str,
    pub severity: ViolationSeverity,
    pub booking_ids: Vec<Uuid>,
    pub description: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct InvariantReport {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub violations: Vec<InvariantViolation>,
}

impl InvariantReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn has_critical(&self) -> bool {
        self.violations
            .iter()
            .any(|v| v.severity == ViolationSeverity::Critical)
    }
}

pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_all(&self) -> BookingResult<InvariantReport> {
        let mut violations = Vec::new();

        violations.extend(self.check_paid_is_confirmed().await?);
        violations.extend(self.check_paid_has_reference().await?);
        violations.extend(self.check_scheduled_only_for_deferred().await?);
        violations.extend(self.check_retry_count_cap().await?);
        violations.extend(self.check_marker_has_confirmed_booking().await?);
        violations.extend(self.check_expired_uncaptured_holds().await?);

        let report = InvariantReport {
            checked_at: OffsetDateTime::now_utc(),
            checks_run: 6,
            violations,
        };

        for violation in &report.violations {
            match violation.severity {
                ViolationSeverity::Critical => tracing::error!(
                    invariant = violation.invariant,
                    affected = violation.booking_ids.len(),
                    "{}",
                    violation.description
                ),
                ViolationSeverity::Warning => tracing::warn!(
                    invariant = violation.invariant,
                    affected = violation.booking_ids.len(),
                    "{}",
                    violation.description
                ),
            }
        }
        if report.is_clean() {
            tracing::info!(checks_run = report.checks_run, "All booking invariants hold");
        }

        Ok(report)
    }

    async fn ids(&self, query: &str) -> BookingResult<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(query).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// A paid booking is always confirmed or completed.
    async fn check_paid_is_confirmed(&self) -> BookingResult<Vec<InvariantViolation>> {
        let ids = self
            .ids(
                r#"
                SELECT id FROM bookings
                WHERE is_paid = TRUE
                  AND status NOT IN ('confirmed', 'completed')
                "#,
            )
            .await?;

        Ok(violation_if(
            ids,
            "paid_is_confirmed",
            ViolationSeverity::Critical,
            "paid booking outside confirmed/completed",
        ))
    }

    /// A paid booking carries the gateway reference that paid it.
    async fn check_paid_has_reference(&self) -> BookingResult<Vec<InvariantViolation>> {
        let ids = self
            .ids(
                r#"
                SELECT id FROM bookings
                WHERE is_paid = TRUE
                  AND (payment_intent_id IS NULL OR payment_intent_id = 'pending')
                "#,
            )
            .await?;

        Ok(violation_if(
            ids,
            "paid_has_reference",
            ViolationSeverity::Critical,
            "paid booking without a real payment reference",
        ))
    }

    /// Only deferred-auth bookings carry a scheduled charge time.
    async fn check_scheduled_only_for_deferred(&self) -> BookingResult<Vec<InvariantViolation>> {
        let ids = self
            .ids(
                r#"
                SELECT id FROM bookings
                WHERE payment_scheduled_for IS NOT NULL
                  AND (payment_auth_type IS NULL OR payment_auth_type <> 'deferred_auth')
                "#,
            )
            .await?;

        Ok(violation_if(
            ids,
            "scheduled_only_for_deferred",
            ViolationSeverity::Warning,
            "non-deferred booking with a scheduled charge time",
        ))
    }

    /// The retry counter never exceeds the processor's cap.
    async fn check_retry_count_cap(&self) -> BookingResult<Vec<InvariantViolation>> {
        let rows: Vec<(Uuid,)> =
            sqlx::query_as("SELECT id FROM bookings WHERE payment_retry_count > $1")
                .bind(MAX_PAYMENT_RETRIES)
                .fetch_all(&self.pool)
                .await?;
        let ids = rows.into_iter().map(|(id,)| id).collect();

        Ok(violation_if(
            ids,
            "retry_count_cap",
            ViolationSeverity::Warning,
            "booking retried past the processor cap",
        ))
    }

    /// Every processed success marker should point at a paid booking.
    /// Violations are deliveries whose confirmation failed after the
    /// marker committed; they need manual repair.
    async fn check_marker_has_confirmed_booking(&self) -> BookingResult<Vec<InvariantViolation>> {
        let ids = self
            .ids(
                r#"
                SELECT e.booking_id
                FROM processed_payment_events e
                LEFT JOIN bookings b ON b.id = e.booking_id
                WHERE b.id IS NULL
                   OR (b.is_paid = FALSE AND b.refund_id IS NULL)
                "#,
            )
            .await?;

        Ok(violation_if(
            ids,
            "marker_has_confirmed_booking",
            ViolationSeverity::Critical,
            "processed payment event without a paid booking (confirmation failed after marker commit)",
        ))
    }

    /// Uncaptured holds past their expiry should have been swept.
    async fn check_expired_uncaptured_holds(&self) -> BookingResult<Vec<InvariantViolation>> {
        let ids = self
            .ids(
                r#"
                SELECT id FROM bookings
                WHERE status = 'accepted'
                  AND is_paid = FALSE
                  AND payment_auth_type = 'immediate_auth'
                  AND payment_intent_id IS NOT NULL
                  AND payment_intent_id <> 'pending'
                  AND payment_expires_at < NOW() - INTERVAL '1 day'
                "#,
            )
            .await?;

        Ok(violation_if(
            ids,
            "expired_uncaptured_holds",
            ViolationSeverity::Warning,
            "expired hold not yet released for re-authorization",
        ))
    }
}

fn violation_if(
    booking_ids: Vec<Uuid>,
    invariant: &'static str,
    severity: ViolationSeverity,
    description: &str,
) -> Vec<InvariantViolation> {
    if booking_ids.is_empty() {
        return Vec::new();
    }
    vec![InvariantViolation {
        invariant,
        severity,
        description: format!("{} ({} affected)", description, booking_ids.len()),
        booking_ids,
    }]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_report_is_clean() {
        let report = InvariantReport {
            checked_at: OffsetDateTime::now_utc(),
            checks_run: 6,
            violations: vec![],
        };
        assert!(report.is_clean());
        assert!(!report.has_critical());
    }

    #[test]
    fn critical_violations_are_flagged() {
        let report = InvariantReport {
            checked_at: OffsetDateTime::now_utc(),
            checks_run: 6,
            violations: violation_if(
                vec![Uuid::new_v4()],
                "paid_is_confirmed",
                ViolationSeverity::Critical,
                "paid booking outside confirmed/completed",
            ),
        };
        assert!(!report.is_clean());
        assert!(report.has_critical());
    }

    #[test]
    fn no_violation_for_empty_id_set() {
        assert!(violation_if(vec![], "x", ViolationSeverity::Warning, "y").is_empty());
    }
}
