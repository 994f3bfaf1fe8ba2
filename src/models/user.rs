use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// User roles
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Customer,
    Provider,
    Admin,
}

impl From<String> for UserRole {
    fn from(s: String) -> Self {
        match s.as_str() {
            "provider" => UserRole::Provider,
            "admin" => UserRole::Admin,
            _ => UserRole::Customer,
        }
    }
}

impl From<UserRole> for String {
    fn from(role: UserRole) -> Self {
        match role {
            UserRole::Customer => "customer".to_string(),
            UserRole::Provider => "provider".to_string(),
            UserRole::Admin => "admin".to_string(),
        }
    }
}

/// User model
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct User {
    pub id: String,
    pub email: String,
    pub display_name: String,
    pub phone: Option<String>,
    #[sqlx(try_from = "String")]
    pub role: UserRole,
    /// Commission override in percent; providers without one use the
    /// platform default
    pub commission_rate: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl User {
    /// Check if user is a provider
    pub fn is_provider(&self) -> bool {
        matches!(self.role, UserRole::Provider | UserRole::Admin)
    }

    /// Check if user is admin
    pub fn is_admin(&self) -> bool {
        matches!(self.role, UserRole::Admin)
    }
}

/// Bearer-token session; only the token digest is stored
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub token_digest: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    /// Check if session is expired
    pub fn is_expired(&self) -> bool {
        self.expires_at < Utc::now()
    }
}

/// Registration request
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub display_name: String,
    #[serde(default)]
    pub phone: Option<String>,
    pub role: UserRole,
}

/// Registration response carrying the token exactly once
#[derive(Debug, Clone, Serialize)]
pub struct AuthResponse {
    pub user: User,
    pub token: String,
}
