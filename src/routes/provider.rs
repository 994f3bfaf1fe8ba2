use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};

use crate::error::AppResult;
use crate::middleware::ProviderUser;
use crate::models::{AcceptBookingRequest, Booking, DeclineBookingRequest, DeliverRequest};
use crate::services::BookingService;
use crate::AppState;

/// Paid booking requests waiting on this provider, most urgent first
pub async fn pending_requests(
    State(state): State<Arc<AppState>>,
    ProviderUser(user): ProviderUser,
) -> AppResult<Json<Vec<Booking>>> {
    let bookings = BookingService::pending_requests_for_provider(&state.db, &user.id).await?;
    Ok(Json(bookings))
}

/// All bookings received by this provider
pub async fn list_bookings(
    State(state): State<Arc<AppState>>,
    ProviderUser(user): ProviderUser,
) -> AppResult<Json<Vec<Booking>>> {
    let bookings = BookingService::list_for_provider(&state.db, &user.id).await?;
    Ok(Json(bookings))
}

/// Accept a paid booking request
pub async fn accept_booking(
    State(state): State<Arc<AppState>>,
    ProviderUser(user): ProviderUser,
    Path(booking_id): Path<String>,
    Json(req): Json<AcceptBookingRequest>,
) -> AppResult<Json<Booking>> {
    let booking =
        BookingService::accept(&state, &user, &booking_id, req.message.as_deref()).await?;
    Ok(Json(booking))
}

/// Decline a paid booking request; the deposit is refunded in full
pub async fn decline_booking(
    State(state): State<Arc<AppState>>,
    ProviderUser(user): ProviderUser,
    Path(booking_id): Path<String>,
    Json(req): Json<DeclineBookingRequest>,
) -> AppResult<Json<Booking>> {
    let booking = BookingService::decline(&state, &user, &booking_id, &req).await?;
    Ok(Json(booking))
}

/// Mark work as started
pub async fn start_work(
    State(state): State<Arc<AppState>>,
    ProviderUser(user): ProviderUser,
    Path(booking_id): Path<String>,
) -> AppResult<Json<Booking>> {
    let booking = BookingService::start_work(&state, &user, &booking_id).await?;
    Ok(Json(booking))
}

/// Deliver work with at least one deliverable
pub async fn deliver(
    State(state): State<Arc<AppState>>,
    ProviderUser(user): ProviderUser,
    Path(booking_id): Path<String>,
    Json(req): Json<DeliverRequest>,
) -> AppResult<Json<Booking>> {
    let booking = BookingService::deliver(&state, &user, &booking_id, &req).await?;
    Ok(Json(booking))
}
