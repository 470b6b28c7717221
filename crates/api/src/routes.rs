//! HTTP surface for the booking engine
//!
//! Thin handlers: parse the requester and payload, delegate to the
//! engine, map errors to status codes. The requester is identified by
//! the `x-user-id` header set by the gateway in front of this service.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use time::OffsetDateTime;
use tutorhub_booking::{Booking, BookingError, BookingRequest, BookingStore, LessonReport};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/bookings", post(create_booking))
        .route("/bookings/suggestions", post(suggest_booking))
        .route("/bookings/{id}", get(get_booking))
        .route("/bookings/{id}/approve", post(approve_suggestion))
        .route("/bookings/{id}/accept", post(accept_booking))
        .route("/bookings/{id}/decline", post(decline_booking))
        .route("/bookings/{id}/cancel", post(cancel_booking))
        .route("/bookings/{id}/complete", post(complete_booking))
        .route("/bookings/{id}/reschedule", post(reschedule_booking))
        .route("/bookings/{id}/payments/authorize", post(authorize_payment))
        .route("/bookings/{id}/payments/confirm", post(confirm_payment))
        .route("/bookings/{id}/meeting", post(generate_meeting))
        .route("/webhooks/payments", post(payment_webhook))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

/// Requester identity, injected upstream after authentication.
fn requester_id(headers: &HeaderMap) -> ApiResult<Uuid> {
    let raw = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| BookingError::Unauthorized("missing x-user-id header".into()))?;
    let id = raw
        .parse()
        .map_err(|_| BookingError::Unauthorized(format!("malformed x-user-id '{raw}'")))?;
    Ok(id)
}

async fn get_booking(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Booking>> {
    let booking = state.engine.store.get(id).await?;
    Ok(Json(booking))
}

async fn create_booking(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<BookingRequest>,
) -> ApiResult<Json<Booking>> {
    let requester = requester_id(&headers)?;
    let booking = state
        .engine
        .lifecycle
        .request(requester, request, OffsetDateTime::now_utc())
        .await?;
    Ok(Json(booking))
}

async fn suggest_booking(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<BookingRequest>,
) -> ApiResult<Json<Booking>> {
    let requester = requester_id(&headers)?;
    let booking = state
        .engine
        .lifecycle
        .suggest(requester, request, OffsetDateTime::now_utc())
        .await?;
    Ok(Json(booking))
}

async fn approve_suggestion(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Booking>> {
    let requester = requester_id(&headers)?;
    let booking = state
        .engine
        .lifecycle
        .approve_suggestion(id, requester, OffsetDateTime::now_utc())
        .await?;
    Ok(Json(booking))
}

async fn accept_booking(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Booking>> {
    let requester = requester_id(&headers)?;
    let booking = state
        .engine
        .lifecycle
        .accept(id, requester, OffsetDateTime::now_utc())
        .await?;
    Ok(Json(booking))
}

#[derive(Deserialize)]
struct ReasonPayload {
    reason: String,
}

async fn decline_booking(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(payload): Json<ReasonPayload>,
) -> ApiResult<Json<Booking>> {
    let requester = requester_id(&headers)?;
    let booking = state
        .engine
        .lifecycle
        .decline(id, requester, &payload.reason, OffsetDateTime::now_utc())
        .await?;
    Ok(Json(booking))
}

#[derive(Deserialize)]
struct CancelPayload {
    #[serde(default)]
    reason: String,
}

async fn cancel_booking(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(payload): Json<CancelPayload>,
) -> ApiResult<Json<Booking>> {
    let requester = requester_id(&headers)?;
    let booking = state
        .engine
        .lifecycle
        .cancel(id, requester, &payload.reason, OffsetDateTime::now_utc())
        .await?;
    Ok(Json(booking))
}

async fn complete_booking(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(report): Json<LessonReport>,
) -> ApiResult<Json<Booking>> {
    let requester = requester_id(&headers)?;
    let booking = state
        .engine
        .lifecycle
        .complete(id, requester, report, OffsetDateTime::now_utc())
        .await?;
    Ok(Json(booking))
}

#[derive(Deserialize)]
struct ReschedulePayload {
    #[serde(with = "time::serde::rfc3339")]
    scheduled_at: OffsetDateTime,
    duration_minutes: Option<i32>,
}

async fn reschedule_booking(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(payload): Json<ReschedulePayload>,
) -> ApiResult<Json<Booking>> {
    let requester = requester_id(&headers)?;
    let booking = state
        .engine
        .lifecycle
        .reschedule(
            id,
            requester,
            payload.scheduled_at,
            payload.duration_minutes,
            OffsetDateTime::now_utc(),
        )
        .await?;
    Ok(Json(booking))
}

async fn authorize_payment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let requester = requester_id(&headers)?;
    let authorization = state
        .engine
        .orchestrator
        .create_payment_authorization(id, requester, OffsetDateTime::now_utc())
        .await?;
    Ok(Json(serde_json::json!({
        "reference": authorization.reference,
        "client_secret": authorization.client_secret,
    })))
}

#[derive(Deserialize)]
struct ConfirmPayload {
    reference: String,
}

async fn confirm_payment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(payload): Json<ConfirmPayload>,
) -> ApiResult<Json<Booking>> {
    // Confirmation carries its own proof (the gateway reference), but the
    // caller must still be authenticated.
    requester_id(&headers)?;
    let booking = state
        .engine
        .orchestrator
        .confirm_payment(id, &payload.reference, OffsetDateTime::now_utc())
        .await?;
    Ok(Json(booking))
}

async fn generate_meeting(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    requester_id(&headers)?;
    let link = state.engine.meetings.generate_for_booking(id).await?;
    Ok(Json(serde_json::json!({ "meeting_link": link })))
}

/// Signed event delivery from the payment provider. A non-2xx response
/// makes the provider redeliver, which the engine's idempotency markers
/// make safe.
async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<&'static str> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or(BookingError::WebhookSignatureInvalid)?;

    state
        .engine
        .reconciler
        .process(&body, signature, OffsetDateTime::now_utc())
        .await?;
    Ok("ok")
}
