// Booking crate clippy configuration
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! TutorHub Booking Engine
//!
//! The booking lifecycle and payment orchestration core of the tutoring
//! marketplace. Reconciles three eventually consistent external actors
//! (payment gateway, meeting provider, persistent store) while
//! guaranteeing at-most-once money movement.
//!
//! ## Features
//!
//! - **Booking State Machine**: role-aware transitions with timing rules
//! - **Payment Strategies**: immediate charge, hold-then-capture, deferred save-and-charge
//! - **Webhook Reconciliation**: signed events, exactly-once via idempotency markers
//! - **Scheduled Payment Processor**: batch off-session charges with retry/backoff
//! - **Meeting Generation**: idempotent, retried, decoupled from payment success
//! - **Invariant Checks**: executable consistency sweeps over the store

pub mod config;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod invariants;
pub mod lifecycle;
pub mod meetings;
pub mod model;
pub mod notify;
pub mod orchestrator;
pub mod processor;
pub mod retry;
pub mod store;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;
#[cfg(test)]
mod testkit;

// Config
pub use config::{GatewayConfig, MeetingProviderConfig, NotifierConfig};

// Error
pub use error::{BookingError, BookingResult};

// Gateway
pub use gateway::{OffSessionOutcome, PaymentAuthorization, PaymentGateway, StripeGateway};

// Identity
pub use identity::{IdentityDirectory, MemoryIdentityDirectory, PgIdentityDirectory};

// Invariants
pub use invariants::{InvariantChecker, InvariantReport, InvariantViolation, ViolationSeverity};

// Lifecycle
pub use lifecycle::{
    BookingLifecycle, BookingRequest, CANCELLATION_WINDOW_HOURS, MIN_REASON_LEN,
};

// Meetings
pub use meetings::{HttpMeetingProvider, MeetingDetails, MeetingGenerator, MeetingProvider};

// Model
pub use model::{
    Booking, BookingStatus, LessonReport, PaymentAuthType, Profile, Role,
};

// Notify
pub use notify::{EmailNotifier, Notifier, NullNotifier};

// Orchestrator
pub use orchestrator::{
    is_placeholder_reference, payment_schedule_for, select_strategy, PaymentOrchestrator,
    HOLD_EXPIRY_DAYS, PLACEHOLDER_REFERENCE,
};

// Processor
pub use processor::{
    ProcessorRunSummary, ScheduledPaymentProcessor, BATCH_SIZE, MAX_PAYMENT_RETRIES,
    RETRY_COOLDOWN,
};

// Retry
pub use retry::with_retry;

// Store
pub use store::{BookingStore, MemoryBookingStore, PgBookingStore};

// Webhooks
pub use webhooks::{verify_signature, EventEnvelope, WebhookReconciler};

use std::sync::Arc;

use sqlx::PgPool;

/// The assembled booking engine: every component wired over shared
/// collaborator seams.
pub struct BookingEngine {
    pub store: Arc<dyn BookingStore>,
    pub identity: Arc<dyn IdentityDirectory>,
    pub lifecycle: BookingLifecycle,
    pub orchestrator: PaymentOrchestrator,
    pub processor: ScheduledPaymentProcessor,
    pub reconciler: WebhookReconciler,
    pub meetings: MeetingGenerator,
}

impl BookingEngine {
    /// Wire the engine from explicit collaborators.
    pub fn new(
        store: Arc<dyn BookingStore>,
        gateway: Arc<dyn PaymentGateway>,
        identity: Arc<dyn IdentityDirectory>,
        meeting_provider: Arc<dyn MeetingProvider>,
        notifier: Arc<dyn Notifier>,
        webhook_secret: String,
    ) -> Self {
        let meetings = MeetingGenerator::new(store.clone(), identity.clone(), meeting_provider);
        let orchestrator = PaymentOrchestrator::new(
            store.clone(),
            gateway.clone(),
            identity.clone(),
            meetings.clone(),
            notifier.clone(),
        );
        let lifecycle = BookingLifecycle::new(
            store.clone(),
            identity.clone(),
            gateway.clone(),
            meetings.clone(),
        );
        let processor = ScheduledPaymentProcessor::new(
            store.clone(),
            gateway,
            identity.clone(),
            orchestrator.clone(),
            notifier,
        );
        let reconciler =
            WebhookReconciler::new(store.clone(), orchestrator.clone(), webhook_secret);

        Self {
            store,
            identity,
            lifecycle,
            orchestrator,
            processor,
            reconciler,
            meetings,
        }
    }

    /// Production wiring: Postgres store, Stripe gateway, HTTP meeting
    /// provider, email notifier when configured.
    pub fn from_env(pool: PgPool) -> BookingResult<Self> {
        let gateway_config = GatewayConfig::from_env()?;
        let webhook_secret = gateway_config.webhook_secret.clone();

        let notifier_config = NotifierConfig::from_env();
        let notifier: Arc<dyn Notifier> = if notifier_config.is_enabled() {
            Arc::new(EmailNotifier::new(notifier_config))
        } else {
            Arc::new(NullNotifier)
        };

        Ok(Self::new(
            Arc::new(PgBookingStore::new(pool.clone())),
            Arc::new(StripeGateway::new(&gateway_config)?),
            Arc::new(PgIdentityDirectory::new(pool)),
            Arc::new(HttpMeetingProvider::new(MeetingProviderConfig::from_env()?)),
            notifier,
            webhook_secret,
        ))
    }
}
