use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;

use crate::error::AppResult;
use crate::middleware::AdminUser;
use crate::models::{Dispute, Payment, ResolveDisputeRequest, ResolvePaymentRequest};
use crate::services::EscrowService;
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct DisputeFilter {
    /// "open" or "resolved"; absent means all
    pub status: Option<String>,
}

/// Payments held for manual review
pub async fn flagged_payments(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
) -> AppResult<Json<Vec<Payment>>> {
    let payments = EscrowService::list_flagged(&state.db).await?;
    Ok(Json(payments))
}

/// Decide a flagged payment: complete, fail or retry it
pub async fn resolve_payment(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
    Path(payment_id): Path<String>,
    Json(req): Json<ResolvePaymentRequest>,
) -> AppResult<Json<Payment>> {
    let payment = EscrowService::resolve_flagged(&state, &payment_id, &req).await?;
    Ok(Json(payment))
}

/// List disputes, optionally filtered by status
pub async fn list_disputes(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
    Query(filter): Query<DisputeFilter>,
) -> AppResult<Json<Vec<Dispute>>> {
    let disputes = EscrowService::list_disputes(&state.db, filter.status.as_deref()).await?;
    Ok(Json(disputes))
}

/// Resolve an open dispute by splitting the held funds
pub async fn resolve_dispute(
    State(state): State<Arc<AppState>>,
    AdminUser(admin): AdminUser,
    Path(dispute_id): Path<String>,
    Json(req): Json<ResolveDisputeRequest>,
) -> AppResult<Json<Dispute>> {
    let dispute = EscrowService::resolve_dispute(&state, &admin, &dispute_id, &req).await?;
    Ok(Json(dispute))
}
