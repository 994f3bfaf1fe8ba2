mod auth;

// Re-export auth types for use by route handlers
#[allow(unused_imports)]
pub use auth::{token_digest, AdminUser, AuthError, CurrentUser, ProviderUser};
