use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

/// Persisted notification with per-channel delivery marks.
///
/// A NULL sent column means that channel has not delivered yet; the
/// background sweep keeps retrying until every configured channel is
/// marked (at-least-once).
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    pub event_type: String,
    pub title: String,
    pub message: String,
    pub payload: String,
    pub email_sent_at: Option<DateTime<Utc>>,
    pub sms_sent_at: Option<DateTime<Utc>>,
    pub web_sent_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    /// Check if the given channel has already delivered this notification
    pub fn delivered_via(&self, channel: &str) -> bool {
        match channel {
            "email" => self.email_sent_at.is_some(),
            "sms" => self.sms_sent_at.is_some(),
            "web" => self.web_sent_at.is_some(),
            _ => false,
        }
    }
}
