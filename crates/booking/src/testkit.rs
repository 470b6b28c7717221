//! Counting fakes shared across unit and scenario tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BookingError, BookingResult};
use crate::gateway::{OffSessionOutcome, PaymentAuthorization, PaymentGateway};
use crate::meetings::{MeetingDetails, MeetingProvider};
use crate::model::{Booking, Profile, Role};
use crate::notify::Notifier;

pub fn profile(role: Role, age_years: Option<i32>) -> Profile {
    let today = OffsetDateTime::now_utc().date();
    let date_of_birth = age_years.map(|age| {
        today
            .replace_year(today.year() - age)
            // Feb 29 birthdays collapse to Mar 1 in non-leap years
            .unwrap_or_else(|_| {
                Date::from_calendar_date(today.year() - age, time::Month::March, 1).unwrap()
            })
    });
    Profile {
        id: Uuid::new_v4(),
        role,
        full_name: format!("{} {}", role.as_str(), Uuid::new_v4().simple()),
        email: format!("{}@example.com", Uuid::new_v4().simple()),
        date_of_birth,
        children: vec![],
        billing_ref: None,
    }
}

pub fn guardian_of(children: Vec<Uuid>) -> Profile {
    let mut p = profile(Role::Guardian, Some(45));
    p.children = children;
    p
}

// ---------------------------------------------------------------------------
// Gateway fake
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
enum OffSessionMode {
    Succeed,
    RequireAction,
    Decline,
}

struct GatewayInner {
    counter: u64,
    customer_calls: u32,
    charge_calls: u32,
    hold_calls: u32,
    setup_calls: u32,
    off_session_calls: u32,
    refund_calls: u32,
    off_session_mode: OffSessionMode,
    refunds_fail: bool,
    saved_methods: Vec<String>,
}

impl Default for GatewayInner {
    fn default() -> Self {
        Self {
            counter: 0,
            customer_calls: 0,
            charge_calls: 0,
            hold_calls: 0,
            setup_calls: 0,
            off_session_calls: 0,
            refund_calls: 0,
            off_session_mode: OffSessionMode::Succeed,
            refunds_fail: false,
            saved_methods: vec!["pm_card_1".to_string()],
        }
    }
}

#[derive(Clone, Default)]
pub struct FakeGateway {
    inner: Arc<Mutex<GatewayInner>>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decline_off_session(&self) {
        self.inner.lock().unwrap().off_session_mode = OffSessionMode::Decline;
    }

    pub fn require_action_off_session(&self) {
        self.inner.lock().unwrap().off_session_mode = OffSessionMode::RequireAction;
    }

    pub fn fail_refunds(&self) {
        self.inner.lock().unwrap().refunds_fail = true;
    }

    pub fn set_saved_methods(&self, methods: Vec<String>) {
        self.inner.lock().unwrap().saved_methods = methods;
    }

    pub fn customer_calls(&self) -> u32 {
        self.inner.lock().unwrap().customer_calls
    }

    pub fn charge_calls(&self) -> u32 {
        self.inner.lock().unwrap().charge_calls
    }

    pub fn hold_calls(&self) -> u32 {
        self.inner.lock().unwrap().hold_calls
    }

    pub fn setup_calls(&self) -> u32 {
        self.inner.lock().unwrap().setup_calls
    }

    pub fn off_session_calls(&self) -> u32 {
        self.inner.lock().unwrap().off_session_calls
    }

    pub fn refund_calls(&self) -> u32 {
        self.inner.lock().unwrap().refund_calls
    }

    fn next(&self, prefix: &str) -> String {
        let mut inner = self.inner.lock().unwrap();
        inner.counter += 1;
        format!("{}_{}", prefix, inner.counter)
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn ensure_customer(
        &self,
        _full_name: &str,
        _email: &str,
        _user_id: &str,
    ) -> BookingResult<String> {
        self.inner.lock().unwrap().customer_calls += 1;
        Ok(self.next("cus"))
    }

    async fn create_charge(
        &self,
        _amount_cents: i64,
        _customer_ref: &str,
        _metadata: HashMap<String, String>,
    ) -> BookingResult<PaymentAuthorization> {
        self.inner.lock().unwrap().charge_calls += 1;
        let reference = self.next("pi");
        Ok(PaymentAuthorization {
            client_secret: format!("{}_secret", reference),
            reference,
        })
    }

    async fn create_hold(
        &self,
        _amount_cents: i64,
        _customer_ref: &str,
        _metadata: HashMap<String, String>,
    ) -> BookingResult<PaymentAuthorization> {
        self.inner.lock().unwrap().hold_calls += 1;
        let reference = self.next("pi");
        Ok(PaymentAuthorization {
            client_secret: format!("{}_secret", reference),
            reference,
        })
    }

    async fn create_setup_intent(
        &self,
        _customer_ref: &str,
        _metadata: HashMap<String, String>,
    ) -> BookingResult<PaymentAuthorization> {
        self.inner.lock().unwrap().setup_calls += 1;
        let reference = self.next("seti");
        Ok(PaymentAuthorization {
            client_secret: format!("{}_secret", reference),
            reference,
        })
    }

    async fn charge_off_session(
        &self,
        _amount_cents: i64,
        _customer_ref: &str,
        _method_ref: &str,
        _metadata: HashMap<String, String>,
    ) -> BookingResult<OffSessionOutcome> {
        let mode = {
            let mut inner = self.inner.lock().unwrap();
            inner.off_session_calls += 1;
            inner.off_session_mode
        };
        match mode {
            OffSessionMode::Succeed => Ok(OffSessionOutcome::Succeeded {
                reference: self.next("pi"),
            }),
            OffSessionMode::RequireAction => Ok(OffSessionOutcome::RequiresAction {
                reference: self.next("pi"),
            }),
            OffSessionMode::Decline => {
                Err(BookingError::PaymentDeclined("card declined".to_string()))
            }
        }
    }

    async fn refund(&self, _payment_ref: &str) -> BookingResult<String> {
        let fails = {
            let mut inner = self.inner.lock().unwrap();
            inner.refund_calls += 1;
            inner.refunds_fail
        };
        if fails {
            return Err(BookingError::RefundFailed("gateway unavailable".to_string()));
        }
        Ok(self.next("re"))
    }

    async fn list_saved_methods(&self, _customer_ref: &str) -> BookingResult<Vec<String>> {
        Ok(self.inner.lock().unwrap().saved_methods.clone())
    }
}

// ---------------------------------------------------------------------------
// Meeting provider fake
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MeetingInner {
    create_calls: u32,
    remaining_failures: u32,
    counter: u32,
    deleted: Vec<String>,
    fail_deletes: bool,
}

#[derive(Clone, Default)]
pub struct FakeMeetingProvider {
    inner: Arc<Mutex<MeetingInner>>,
}

impl FakeMeetingProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the first `n` create calls, then succeed.
    pub fn failing_times(n: u32) -> Self {
        let provider = Self::default();
        provider.inner.lock().unwrap().remaining_failures = n;
        provider
    }

    pub fn fail_deletes(&self) {
        self.inner.lock().unwrap().fail_deletes = true;
    }

    pub fn create_calls(&self) -> u32 {
        self.inner.lock().unwrap().create_calls
    }

    pub fn deleted_refs(&self) -> Vec<String> {
        self.inner.lock().unwrap().deleted.clone()
    }
}

#[async_trait]
impl MeetingProvider for FakeMeetingProvider {
    async fn create_meeting(
        &self,
        _subject: &str,
        _start: OffsetDateTime,
        _end: OffsetDateTime,
        _attendees: &[String],
    ) -> BookingResult<MeetingDetails> {
        let mut inner = self.inner.lock().unwrap();
        inner.create_calls += 1;
        if inner.remaining_failures > 0 {
            inner.remaining_failures -= 1;
            return Err(BookingError::MeetingProvider("transient outage".to_string()));
        }
        inner.counter += 1;
        Ok(MeetingDetails {
            join_url: format!("https://meet.example/room-{}", inner.counter),
            meeting_ref: format!("mtg_{}", inner.counter),
        })
    }

    async fn delete_meeting(&self, meeting_ref: &str) -> BookingResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_deletes {
            return Err(BookingError::MeetingProvider("delete failed".to_string()));
        }
        inner.deleted.push(meeting_ref.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Notifier fake
// ---------------------------------------------------------------------------

#[derive(Default)]
struct NotifierInner {
    failures: Vec<(Uuid, String)>,
    actions: Vec<Uuid>,
}

#[derive(Clone, Default)]
pub struct CountingNotifier {
    inner: Arc<Mutex<NotifierInner>>,
}

impl CountingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failure_count(&self) -> usize {
        self.inner.lock().unwrap().failures.len()
    }

    pub fn action_count(&self) -> usize {
        self.inner.lock().unwrap().actions.len()
    }

    pub fn last_failure_reason(&self) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .failures
            .last()
            .map(|(_, reason)| reason.clone())
    }
}

#[async_trait]
impl Notifier for CountingNotifier {
    async fn notify_payment_failure(&self, booking: &Booking, _payer: &Profile, reason: &str) {
        self.inner
            .lock()
            .unwrap()
            .failures
            .push((booking.id, reason.to_string()));
    }

    async fn notify_action_required(&self, booking: &Booking, _payer: &Profile) {
        self.inner.lock().unwrap().actions.push(booking.id);
    }
}
