//! Meeting generation
//!
//! Ensures a confirmed booking has a video-meeting link. Generation is
//! idempotent: an existing link is returned as-is with no provider call.
//! Provider failures are retried with exponential backoff; regeneration
//! (after a reschedule) is the only path that overwrites a link.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::config::MeetingProviderConfig;
use crate::error::{BookingError, BookingResult};
use crate::identity::IdentityDirectory;
use crate::retry::with_retry;
use crate::store::BookingStore;

/// Provider calls get one initial attempt plus up to 3 retries, backing
/// off 1s/2s/4s.
pub const MEETING_MAX_RETRIES: u32 = 3;
pub const MEETING_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct MeetingDetails {
    pub join_url: String,
    pub meeting_ref: String,
}

#[async_trait]
pub trait MeetingProvider: Send + Sync {
    async fn create_meeting(
        &self,
        subject: &str,
        start: OffsetDateTime,
        end: OffsetDateTime,
        attendees: &[String],
    ) -> BookingResult<MeetingDetails>;

    async fn delete_meeting(&self, meeting_ref: &str) -> BookingResult<()>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct CreateMeetingRequest<'a> {
    subject: &'a str,
    #[serde(with = "time::serde::rfc3339")]
    start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    end: OffsetDateTime,
    attendees: &'a [String],
}

#[derive(Deserialize)]
struct CreateMeetingResponse {
    join_url: String,
    meeting_id: String,
}

/// JSON-over-HTTP meeting provider client.
#[derive(Clone)]
pub struct HttpMeetingProvider {
    config: MeetingProviderConfig,
    client: reqwest::Client,
}

impl HttpMeetingProvider {
    pub fn new(config: MeetingProviderConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl MeetingProvider for HttpMeetingProvider {
    async fn create_meeting(
        &self,
        subject: &str,
        start: OffsetDateTime,
        end: OffsetDateTime,
        attendees: &[String],
    ) -> BookingResult<MeetingDetails> {
        let url = format!("{}/meetings", self.config.base_url.trim_end_matches('/'));
        let request = CreateMeetingRequest {
            subject,
            start,
            end,
            attendees,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| BookingError::MeetingProvider(e.to_string()))?;

        if !response.status().is_success() {
            return Err(BookingError::MeetingProvider(format!(
                "meeting creation returned {}",
                response.status()
            )));
        }

        let body: CreateMeetingResponse = response
            .json()
            .await
            .map_err(|e| BookingError::MeetingProvider(format!("malformed response: {}", e)))?;

        Ok(MeetingDetails {
            join_url: body.join_url,
            meeting_ref: body.meeting_id,
        })
    }

    async fn delete_meeting(&self, meeting_ref: &str) -> BookingResult<()> {
        let url = format!(
            "{}/meetings/{}",
            self.config.base_url.trim_end_matches('/'),
            meeting_ref
        );

        let response = self
            .client
            .delete(&url)
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(|e| BookingError::MeetingProvider(e.to_string()))?;

        // Already-gone meetings count as deleted
        if !response.status().is_success() && response.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(BookingError::MeetingProvider(format!(
                "meeting deletion returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Generator
// ---------------------------------------------------------------------------

/// Idempotently ensures a booking has a meeting link.
///
/// Invoked from three call sites with identical semantics: after payment
/// confirmation, from the manual on-demand endpoint, and after a
/// reschedule of a booking that already had a link.
#[derive(Clone)]
pub struct MeetingGenerator {
    store: Arc<dyn BookingStore>,
    identity: Arc<dyn IdentityDirectory>,
    provider: Arc<dyn MeetingProvider>,
}

impl MeetingGenerator {
    pub fn new(
        store: Arc<dyn BookingStore>,
        identity: Arc<dyn IdentityDirectory>,
        provider: Arc<dyn MeetingProvider>,
    ) -> Self {
        Self {
            store,
            identity,
            provider,
        }
    }

    /// Return the booking's meeting link, creating one if absent.
    pub async fn generate_for_booking(&self, booking_id: Uuid) -> BookingResult<String> {
        let booking = self.store.get(booking_id).await?;

        if let Some(link) = booking.meeting_link {
            tracing::debug!(booking_id = %booking_id, "Meeting link already present, reusing");
            return Ok(link);
        }

        self.issue(booking_id).await
    }

    /// Reissue the meeting for a booking whose time window changed.
    /// The previous meeting is deleted best-effort; a deletion failure
    /// only leaves an orphaned meeting at the provider.
    pub async fn regenerate_for_booking(&self, booking_id: Uuid) -> BookingResult<String> {
        let booking = self.store.get(booking_id).await?;

        if let Some(old_ref) = &booking.meeting_id {
            if let Err(e) = self.provider.delete_meeting(old_ref).await {
                tracing::warn!(
                    booking_id = %booking_id,
                    meeting_ref = %old_ref,
                    error = %e,
                    "Failed to delete superseded meeting, continuing"
                );
            }
        }

        self.issue(booking_id).await
    }

    async fn issue(&self, booking_id: Uuid) -> BookingResult<String> {
        let booking = self.store.get(booking_id).await?;
        let student = self.identity.profile(booking.student_id).await?;
        let tutor = self.identity.profile(booking.tutor_id).await?;

        let (start, end) = booking.meeting_window();
        let subject = format!("{} ({}) with {}", booking.subject, booking.level, tutor.full_name);
        let attendees = vec![student.email.clone(), tutor.email.clone()];

        let details = with_retry(MEETING_MAX_RETRIES, MEETING_RETRY_BASE_DELAY, || {
            self.provider
                .create_meeting(&subject, start, end, &attendees)
        })
        .await?;

        self.store
            .set_meeting(booking_id, &details.join_url, &details.meeting_ref)
            .await?;

        tracing::info!(
            booking_id = %booking_id,
            meeting_ref = %details.meeting_ref,
            "Meeting created"
        );

        Ok(details.join_url)
    }

    /// Best-effort deletion of the booking's meeting (cancellation path).
    pub async fn delete_for_booking(&self, meeting_ref: &str) {
        if let Err(e) = self.provider.delete_meeting(meeting_ref).await {
            tracing::warn!(
                meeting_ref = %meeting_ref,
                error = %e,
                "Failed to delete meeting for cancelled booking"
            );
        }
    }
}
