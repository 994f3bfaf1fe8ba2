pub mod admin;
pub mod auth;
pub mod bookings;
pub mod catalog;
pub mod notifications;
pub mod payments;
pub mod provider;

use std::sync::Arc;

use axum::{
    http::StatusCode,
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};

use crate::AppState;

/// Health check endpoint
pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// Build the full application router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Public routes
        .route("/health", get(health))
        .route("/auth/register", post(auth::register))
        .route("/auth/me", get(auth::me))
        // Catalog routes
        .route("/services", get(catalog::list_services))
        .route("/services", post(catalog::create_service))
        .route("/services/:id", get(catalog::get_service))
        // Customer booking routes
        .route("/bookings", post(bookings::create_booking))
        .route("/bookings", get(bookings::list_bookings))
        .route("/bookings/:id", get(bookings::get_booking))
        .route("/bookings/:id/timeline", get(bookings::booking_timeline))
        .route("/bookings/:id/pay", post(bookings::pay))
        .route(
            "/bookings/:id/accept-delivery",
            post(bookings::accept_delivery),
        )
        .route("/bookings/:id/revision", post(bookings::request_revision))
        .route("/bookings/:id/cancel", post(bookings::cancel_booking))
        .route("/bookings/:id/dispute", post(bookings::open_dispute))
        .route("/bookings/:id/review", post(bookings::leave_review))
        // Provider routes
        .route("/provider/requests", get(provider::pending_requests))
        .route("/provider/bookings", get(provider::list_bookings))
        .route(
            "/provider/bookings/:id/accept",
            post(provider::accept_booking),
        )
        .route(
            "/provider/bookings/:id/decline",
            post(provider::decline_booking),
        )
        .route("/provider/bookings/:id/start", post(provider::start_work))
        .route("/provider/bookings/:id/deliver", post(provider::deliver))
        // Payment routes
        .route("/payments/webhook", post(payments::webhook))
        .route("/payments/:id", get(payments::get_payment))
        // Admin routes
        .route("/admin/payments/flagged", get(admin::flagged_payments))
        .route("/admin/payments/:id/resolve", post(admin::resolve_payment))
        .route("/admin/disputes", get(admin::list_disputes))
        .route("/admin/disputes/:id/resolve", post(admin::resolve_dispute))
        // Notification routes
        .route("/notifications", get(notifications::list_notifications))
        .route("/notifications/:id/read", post(notifications::mark_read))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(1024 * 1024))
        .with_state(state)
}
