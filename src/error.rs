use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    // Authentication errors
    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Not authorized")]
    NotAuthorized,

    #[error("Session expired")]
    SessionExpired,

    // User errors
    #[error("User not found")]
    UserNotFound,

    #[error("User already exists")]
    UserAlreadyExists,

    // Catalog errors
    #[error("Service not found")]
    ServiceNotFound,

    #[error("Service not available")]
    ServiceNotAvailable,

    #[error("Package not found")]
    PackageNotFound,

    // Booking errors
    #[error("Booking not found")]
    BookingNotFound,

    #[error("Invalid transition from {from} on {event}: {reason}")]
    InvalidTransition {
        from: String,
        event: String,
        reason: String,
    },

    #[error("Conflicting update, please retry")]
    Conflict,

    // Payment errors
    #[error("Payment not found")]
    PaymentNotFound,

    #[error("Payment already completed")]
    PaymentAlreadyCompleted,

    #[error("Payment flagged for review: {0}")]
    PaymentFlagged(String),

    #[error("Unknown gateway transaction")]
    UnknownGatewayTransaction,

    #[error("Gateway error: {message}")]
    Gateway { message: String, retryable: bool },

    // Dispute errors
    #[error("Dispute not found")]
    DisputeNotFound,

    #[error("Dispute already resolved")]
    DisputeAlreadyResolved,

    #[error("Invalid resolution")]
    InvalidResolution,

    // Notification errors
    #[error("Notification not found")]
    NotificationNotFound,

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    // Invalid input
    #[error("Invalid input: {0}")]
    Validation(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            // 400 Bad Request
            AppError::Validation(_)
            | AppError::InvalidResolution
            | AppError::UnknownGatewayTransaction => (StatusCode::BAD_REQUEST, self.to_string()),

            // 401 Unauthorized
            AppError::NotAuthenticated | AppError::SessionExpired => {
                (StatusCode::UNAUTHORIZED, self.to_string())
            }

            // 403 Forbidden
            AppError::NotAuthorized => (StatusCode::FORBIDDEN, self.to_string()),

            // 404 Not Found
            AppError::UserNotFound
            | AppError::ServiceNotFound
            | AppError::PackageNotFound
            | AppError::BookingNotFound
            | AppError::PaymentNotFound
            | AppError::DisputeNotFound
            | AppError::NotificationNotFound => (StatusCode::NOT_FOUND, self.to_string()),

            // 409 Conflict
            AppError::UserAlreadyExists
            | AppError::ServiceNotAvailable
            | AppError::InvalidTransition { .. }
            | AppError::Conflict
            | AppError::PaymentAlreadyCompleted
            | AppError::PaymentFlagged(_)
            | AppError::DisputeAlreadyResolved => (StatusCode::CONFLICT, self.to_string()),

            // Gateway failures: retryable ones ask the caller to try again,
            // terminal ones surface as a bad upstream response
            AppError::Gateway { retryable, .. } => {
                tracing::warn!("Gateway error: {}", self);
                if *retryable {
                    (
                        StatusCode::SERVICE_UNAVAILABLE,
                        "Payment gateway unavailable, try again later".to_string(),
                    )
                } else {
                    (StatusCode::BAD_GATEWAY, self.to_string())
                }
            }

            // 500 Internal Server Error
            AppError::Database(_) | AppError::Internal(_) => {
                tracing::error!("Internal error: {}", self);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

/// Result type alias for convenience
pub type AppResult<T> = Result<T, AppError>;
