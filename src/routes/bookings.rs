use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;

use crate::error::{AppError, AppResult};
use crate::middleware::CurrentUser;
use crate::models::{
    Booking, CancelBookingRequest, CreateBookingRequest, Deliverable, OpenDisputeRequest, Payment,
    PaymentIntent, ReviewRequest, RevisionRequest, TimelineEntry,
};
use crate::services::{BookingService, EscrowService};
use crate::AppState;

/// New booking plus the deposit intent opened for it
#[derive(Debug, Serialize)]
pub struct BookingCreatedResponse {
    pub booking: Booking,
    pub payment: PaymentIntent,
}

/// Booking with everything a party needs to see at once
#[derive(Debug, Serialize)]
pub struct BookingDetail {
    #[serde(flatten)]
    pub booking: Booking,
    pub deliverables: Vec<Deliverable>,
    pub payments: Vec<Payment>,
}

/// Book a service package; responds with the deposit checkout
pub async fn create_booking(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<CreateBookingRequest>,
) -> AppResult<(StatusCode, Json<BookingCreatedResponse>)> {
    let (booking, payment) = BookingService::create_booking(&state, &user, req).await?;
    Ok((
        StatusCode::CREATED,
        Json(BookingCreatedResponse { booking, payment }),
    ))
}

/// List own bookings as a customer
pub async fn list_bookings(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
) -> AppResult<Json<Vec<Booking>>> {
    let bookings = BookingService::list_for_customer(&state.db, &user.id).await?;
    Ok(Json(bookings))
}

/// Get one booking with deliverables and payments
pub async fn get_booking(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path(booking_id): Path<String>,
) -> AppResult<Json<BookingDetail>> {
    let booking = BookingService::get_for_party(&state.db, &booking_id, &user).await?;
    let deliverables = BookingService::deliverables(&state.db, &booking.id).await?;
    let payments = EscrowService::payments_for_booking(&state.db, &booking.id).await?;
    Ok(Json(BookingDetail {
        booking,
        deliverables,
        payments,
    }))
}

/// Full audit trail of a booking
pub async fn booking_timeline(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path(booking_id): Path<String>,
) -> AppResult<Json<Vec<TimelineEntry>>> {
    let booking = BookingService::get_for_party(&state.db, &booking_id, &user).await?;
    let entries = BookingService::timeline(&state.db, &booking.id).await?;
    Ok(Json(entries))
}

/// Re-issue the deposit payment intent for an unpaid booking
pub async fn pay(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path(booking_id): Path<String>,
) -> AppResult<Json<PaymentIntent>> {
    let booking = BookingService::get_booking(&state.db, &booking_id).await?;
    if booking.customer_id != user.id {
        return Err(AppError::NotAuthorized);
    }
    let intent = EscrowService::deposit_intent(&state, &booking).await?;
    Ok(Json(intent))
}

/// Accept delivered work by opening the final payment intent
pub async fn accept_delivery(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path(booking_id): Path<String>,
) -> AppResult<Json<PaymentIntent>> {
    let booking = BookingService::get_booking(&state.db, &booking_id).await?;
    if booking.customer_id != user.id {
        return Err(AppError::NotAuthorized);
    }
    let intent = EscrowService::final_intent(&state, &booking).await?;
    Ok(Json(intent))
}

/// Request a revision on delivered work
pub async fn request_revision(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path(booking_id): Path<String>,
    Json(req): Json<RevisionRequest>,
) -> AppResult<Json<Booking>> {
    let booking = BookingService::request_revision(&state, &user, &booking_id, &req).await?;
    Ok(Json(booking))
}

/// Cancel a booking under the refund policy
pub async fn cancel_booking(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path(booking_id): Path<String>,
    Json(req): Json<CancelBookingRequest>,
) -> AppResult<Json<Booking>> {
    let booking = BookingService::cancel(&state, &user, &booking_id, &req).await?;
    Ok(Json(booking))
}

/// Open a dispute, freezing the booking for admin resolution
pub async fn open_dispute(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path(booking_id): Path<String>,
    Json(req): Json<OpenDisputeRequest>,
) -> AppResult<Json<Booking>> {
    let booking = BookingService::open_dispute(&state, &user, &booking_id, &req).await?;
    Ok(Json(booking))
}

/// Review a completed booking
pub async fn leave_review(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path(booking_id): Path<String>,
    Json(req): Json<ReviewRequest>,
) -> AppResult<Json<Booking>> {
    let booking = BookingService::leave_review(&state, &user, &booking_id, &req).await?;
    Ok(Json(booking))
}
