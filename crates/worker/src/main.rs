//! TutorHub background worker
//!
//! Handles scheduled jobs including:
//! - Deferred payment processing (every 15 minutes)
//! - Releasing cooled-down failed payments for retry (hourly)
//! - Releasing expired authorization holds (hourly)
//! - Processed webhook event purge (daily at 3:00 AM UTC)
//! - Booking invariant checks (daily at 4:00 AM UTC)

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use tutorhub_booking::{BookingEngine, BookingStore, InvariantChecker, BATCH_SIZE};

/// Processed webhook event markers are kept this long for audit before
/// purging.
const EVENT_RETENTION_DAYS: i64 = 30;

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    #[allow(clippy::expect_used)] // Fail-fast on startup if required config is missing
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting TutorHub Worker");

    let pool = create_db_pool().await?;
    let engine = BookingEngine::from_env(pool.clone())?;

    let scheduler = JobScheduler::new().await?;

    // Job 1: Process due deferred payments (every 15 minutes)
    let processor = engine.processor.clone();
    scheduler
        .add(Job::new_async("0 */15 * * * *", move |_uuid, _l| {
            let processor = processor.clone();
            Box::pin(async move {
                info!("Running deferred payment processing");
                match processor.run(OffsetDateTime::now_utc()).await {
                    Ok(summary) => {
                        if !summary.failures.is_empty() {
                            for (booking_id, reason) in &summary.failures {
                                error!(booking_id = %booking_id, reason = %reason, "Deferred charge failed");
                            }
                        }
                    }
                    Err(e) => error!(error = %e, "Deferred payment run aborted"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Deferred payment processing (every 15 minutes)");

    // Job 2: Release cooled-down failed payments for retry (hourly)
    let retry_processor = engine.processor.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let processor = retry_processor.clone();
            Box::pin(async move {
                if let Err(e) = processor.retry_pass(OffsetDateTime::now_utc()).await {
                    error!(error = %e, "Payment retry release failed");
                }
            })
        })?)
        .await?;
    info!("Scheduled: Payment retry release (hourly)");

    // Job 3: Release expired authorization holds (hourly, offset from retries)
    let hold_orchestrator = engine.orchestrator.clone();
    scheduler
        .add(Job::new_async("0 30 * * * *", move |_uuid, _l| {
            let orchestrator = hold_orchestrator.clone();
            Box::pin(async move {
                match orchestrator
                    .release_expired_holds(OffsetDateTime::now_utc(), BATCH_SIZE)
                    .await
                {
                    Ok(released) if released > 0 => {
                        info!(released = released, "Released expired authorization holds")
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Expired hold release failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Expired hold release (hourly)");

    // Job 4: Purge old processed webhook events (daily at 3:00 AM UTC)
    let purge_store = engine.store.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let store = purge_store.clone();
            Box::pin(async move {
                info!("Running processed event purge");
                let cutoff =
                    OffsetDateTime::now_utc() - time::Duration::days(EVENT_RETENTION_DAYS);
                match store.purge_processed_events(cutoff).await {
                    Ok(purged) => info!(purged = purged, "Processed event purge complete"),
                    Err(e) => error!(error = %e, "Processed event purge failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Processed event purge (daily at 3:00 AM UTC)");

    // Job 5: Booking invariant checks (daily at 4:00 AM UTC)
    let checker_pool = pool.clone();
    scheduler
        .add(Job::new_async("0 0 4 * * *", move |_uuid, _l| {
            let checker = InvariantChecker::new(checker_pool.clone());
            Box::pin(async move {
                info!("Running booking invariant checks");
                match checker.run_all().await {
                    Ok(report) if report.has_critical() => {
                        error!(
                            violations = report.violations.len(),
                            "Invariant check found critical violations"
                        );
                    }
                    Ok(report) if !report.is_clean() => {
                        warn!(
                            violations = report.violations.len(),
                            "Invariant check found warnings"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Invariant check failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Booking invariant checks (daily at 4:00 AM UTC)");

    // Job 6: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("TutorHub Worker started successfully with {} scheduled jobs", 6);

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
