use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use chrono::{Duration, Utc};
use rand::RngCore;

use crate::error::{AppError, AppResult};
use crate::middleware::{token_digest, CurrentUser};
use crate::models::{AuthResponse, RegisterRequest, User, UserRole};
use crate::AppState;

/// Register a new account and open its first session
pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> AppResult<(StatusCode, Json<AuthResponse>)> {
    let email = req.email.trim().to_lowercase();
    if email.is_empty() || !email.contains('@') {
        return Err(AppError::Validation("a valid email is required".to_string()));
    }
    if req.display_name.trim().is_empty() {
        return Err(AppError::Validation(
            "display_name must not be empty".to_string(),
        ));
    }
    if req.role == UserRole::Admin {
        return Err(AppError::Validation(
            "admin accounts cannot be self-registered".to_string(),
        ));
    }

    let existing: Option<(String,)> = sqlx::query_as("SELECT id FROM users WHERE email = ?")
        .bind(&email)
        .fetch_optional(state.db.pool())
        .await?;
    if existing.is_some() {
        return Err(AppError::UserAlreadyExists);
    }

    let id = uuid::Uuid::new_v4().to_string();
    let role = String::from(req.role.clone());
    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO users (id, email, display_name, phone, role, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(&email)
    .bind(req.display_name.trim())
    .bind(&req.phone)
    .bind(&role)
    .bind(now)
    .execute(state.db.pool())
    .await?;

    let user: User = sqlx::query_as("SELECT * FROM users WHERE id = ?")
        .bind(&id)
        .fetch_one(state.db.pool())
        .await?;

    let token = open_session(&state, &user.id).await?;
    Ok((StatusCode::CREATED, Json(AuthResponse { user, token })))
}

/// Current account
pub async fn me(CurrentUser(user): CurrentUser) -> Json<User> {
    Json(user)
}

/// Mint a session token; only its digest is persisted
async fn open_session(state: &AppState, user_id: &str) -> AppResult<String> {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    let token = hex::encode(bytes);

    let now = Utc::now();
    let expires_at = now + Duration::hours(state.config.session_hours as i64);
    sqlx::query(
        r#"
        INSERT INTO sessions (id, user_id, token_digest, expires_at, created_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(uuid::Uuid::new_v4().to_string())
    .bind(user_id)
    .bind(token_digest(&token))
    .bind(expires_at)
    .bind(now)
    .execute(state.db.pool())
    .await?;

    Ok(token)
}
