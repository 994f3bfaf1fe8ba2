use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;

use crate::error::{AppError, AppResult};
use crate::middleware::CurrentUser;
use crate::models::Payment;
use crate::services::{ApplyOutcome, BookingService, EscrowService, GatewayEvent};
use crate::AppState;

pub const SIGNATURE_HEADER: &str = "x-gateway-signature";

#[derive(Debug, Deserialize)]
struct WebhookEnvelope {
    event: String,
    data: WebhookData,
}

#[derive(Debug, Deserialize)]
struct WebhookData {
    transaction_id: String,
    #[serde(default)]
    amount: i64,
}

/// Gateway webhook endpoint.
///
/// The signature is verified over the raw body before anything is
/// parsed. Duplicate and flagged events are acknowledged with 200 so the
/// gateway stops redelivering them; unknown transactions are rejected so
/// a misrouted webhook stays visible on the gateway side.
pub async fn webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<StatusCode> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !state.gateway.verify_signature(&body, signature) {
        tracing::warn!("Webhook rejected: invalid signature");
        return Err(AppError::Validation(
            "invalid webhook signature".to_string(),
        ));
    }

    let envelope: WebhookEnvelope = serde_json::from_slice(&body)
        .map_err(|e| AppError::Validation(format!("malformed webhook payload: {}", e)))?;

    let Some(event) = GatewayEvent::parse(&envelope.event) else {
        tracing::debug!("Ignoring unrecognized gateway event {}", envelope.event);
        return Ok(StatusCode::OK);
    };

    let outcome = EscrowService::apply_gateway_event(
        &state,
        &envelope.data.transaction_id,
        event,
        envelope.data.amount,
    )
    .await?;

    match outcome {
        ApplyOutcome::Applied | ApplyOutcome::AlreadyApplied | ApplyOutcome::Flagged => {
            Ok(StatusCode::OK)
        }
        ApplyOutcome::Unknown => Err(AppError::UnknownGatewayTransaction),
    }
}

/// Get one payment; booking parties and admins only
pub async fn get_payment(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path(payment_id): Path<String>,
) -> AppResult<Json<Payment>> {
    let payment = EscrowService::get_payment(&state.db, &payment_id).await?;
    let booking = BookingService::get_booking(&state.db, &payment.booking_id).await?;
    if !booking.is_party(&user.id) && !user.is_admin() {
        return Err(AppError::NotAuthorized);
    }
    Ok(Json(payment))
}
