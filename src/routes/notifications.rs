use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};
use chrono::Utc;

use crate::error::{AppError, AppResult};
use crate::middleware::CurrentUser;
use crate::models::Notification;
use crate::AppState;

/// Web inbox: latest notifications for the current user
pub async fn list_notifications(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
) -> AppResult<Json<Vec<Notification>>> {
    let notifications: Vec<Notification> = sqlx::query_as(
        "SELECT * FROM notifications WHERE user_id = ? ORDER BY created_at DESC LIMIT 100",
    )
    .bind(&user.id)
    .fetch_all(state.db.pool())
    .await?;
    Ok(Json(notifications))
}

/// Mark one notification as read
pub async fn mark_read(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path(notification_id): Path<String>,
) -> AppResult<Json<Notification>> {
    sqlx::query(
        "UPDATE notifications SET read_at = ? WHERE id = ? AND user_id = ? AND read_at IS NULL",
    )
    .bind(Utc::now())
    .bind(&notification_id)
    .bind(&user.id)
    .execute(state.db.pool())
    .await?;

    let notification: Notification =
        sqlx::query_as("SELECT * FROM notifications WHERE id = ? AND user_id = ?")
            .bind(&notification_id)
            .bind(&user.id)
            .fetch_optional(state.db.pool())
            .await?
            .ok_or(AppError::NotificationNotFound)?;
    Ok(Json(notification))
}
