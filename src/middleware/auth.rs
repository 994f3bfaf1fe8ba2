// Auth extractors are part of the public API - may not all be used internally yet
#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use chrono::Utc;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::models::{Session, User};
use crate::AppState;

/// Extractor for the current authenticated user (required)
pub struct CurrentUser(pub User);

/// Extractor that requires the provider role
pub struct ProviderUser(pub User);

/// Extractor that requires the admin role
pub struct AdminUser(pub User);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for CurrentUser {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|_| AuthError::NotAuthenticated)?;

        let user = get_user_from_token(state, bearer.token())
            .await
            .map_err(|_| AuthError::Internal)?
            .ok_or(AuthError::NotAuthenticated)?;

        Ok(CurrentUser(user))
    }
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for ProviderUser {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let CurrentUser(user) = CurrentUser::from_request_parts(parts, state).await?;

        if !user.is_provider() {
            return Err(AuthError::NotProvider);
        }

        Ok(ProviderUser(user))
    }
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AdminUser {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let CurrentUser(user) = CurrentUser::from_request_parts(parts, state).await?;

        if !user.is_admin() {
            return Err(AuthError::NotAdmin);
        }

        Ok(AdminUser(user))
    }
}

/// Authentication errors
#[derive(Debug)]
pub enum AuthError {
    NotAuthenticated,
    NotProvider,
    NotAdmin,
    Internal,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::NotAuthenticated => (StatusCode::UNAUTHORIZED, "Authentication required"),
            AuthError::NotProvider => (StatusCode::FORBIDDEN, "Provider access required"),
            AuthError::NotAdmin => (StatusCode::FORBIDDEN, "Admin access required"),
            AuthError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "Internal error"),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Hex SHA-256 of a session token; the only form that touches the database
pub fn token_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Resolve a bearer token to its user through an unexpired session
async fn get_user_from_token(
    state: &AppState,
    token: &str,
) -> Result<Option<User>, sqlx::Error> {
    let session: Option<Session> =
        sqlx::query_as("SELECT * FROM sessions WHERE token_digest = ? AND expires_at > ?")
            .bind(token_digest(token))
            .bind(Utc::now())
            .fetch_optional(state.db.pool())
            .await?;

    let session = match session {
        Some(s) => s,
        None => return Ok(None),
    };

    let user: Option<User> = sqlx::query_as("SELECT * FROM users WHERE id = ?")
        .bind(&session.user_id)
        .fetch_optional(state.db.pool())
        .await?;

    Ok(user)
}
