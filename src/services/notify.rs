use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::db::Database;
use crate::error::AppResult;
use crate::models::{Booking, Notification, User};

/// Delivery channel capability. Channels are fire-and-forget from the
/// lifecycle's point of view; a failed delivery is logged and retried by
/// the sweep, never propagated to the caller.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Stable channel name; doubles as the sent-column prefix
    fn name(&self) -> &'static str;

    async fn deliver(&self, recipient: &User, notification: &Notification) -> AppResult<()>;
}

/// Email transport stub; the real sender is an external collaborator
pub struct EmailChannel;

#[async_trait]
impl NotificationChannel for EmailChannel {
    fn name(&self) -> &'static str {
        "email"
    }

    async fn deliver(&self, recipient: &User, notification: &Notification) -> AppResult<()> {
        tracing::info!(
            "Email to {}: {} - {}",
            recipient.email,
            notification.title,
            notification.message
        );
        Ok(())
    }
}

/// SMS transport stub; users without a phone number are skipped
pub struct SmsChannel;

#[async_trait]
impl NotificationChannel for SmsChannel {
    fn name(&self) -> &'static str {
        "sms"
    }

    async fn deliver(&self, recipient: &User, notification: &Notification) -> AppResult<()> {
        match &recipient.phone {
            Some(phone) => {
                tracing::info!("SMS to {}: {}", phone, notification.title);
            }
            None => {
                tracing::debug!("User {} has no phone number, skipping SMS", recipient.id);
            }
        }
        Ok(())
    }
}

/// In-app channel; the persisted row is the delivery
pub struct WebChannel;

#[async_trait]
impl NotificationChannel for WebChannel {
    fn name(&self) -> &'static str {
        "web"
    }

    async fn deliver(&self, _recipient: &User, _notification: &Notification) -> AppResult<()> {
        Ok(())
    }
}

/// What happened, rendered into a notification per event type
pub enum Notice<'a> {
    BookingCreated { booking: &'a Booking },
    DepositReceived { booking: &'a Booking },
    BookingAccepted { booking: &'a Booking },
    BookingDeclined { booking: &'a Booking },
    BookingExpired { booking: &'a Booking },
    WorkDelivered { booking: &'a Booking },
    RevisionRequested { booking: &'a Booking },
    BookingCompleted { booking: &'a Booking },
    BookingCancelled { booking: &'a Booking, refund: i64 },
    DisputeOpened { booking: &'a Booking, reason: &'a str },
    RefundCompleted { booking: &'a Booking, amount: i64 },
    PayoutCompleted { booking: &'a Booking, amount: i64 },
}

impl Notice<'_> {
    /// Stable event tag carried on the stored notification
    pub fn event_type(&self) -> &'static str {
        match self {
            Notice::BookingCreated { .. } => "booking.created",
            Notice::DepositReceived { .. } => "booking.deposit_received",
            Notice::BookingAccepted { .. } => "booking.accepted",
            Notice::BookingDeclined { .. } => "booking.declined",
            Notice::BookingExpired { .. } => "booking.expired",
            Notice::WorkDelivered { .. } => "booking.delivered",
            Notice::RevisionRequested { .. } => "booking.revision_requested",
            Notice::BookingCompleted { .. } => "booking.completed",
            Notice::BookingCancelled { .. } => "booking.cancelled",
            Notice::DisputeOpened { .. } => "dispute.opened",
            Notice::RefundCompleted { .. } => "refund.completed",
            Notice::PayoutCompleted { .. } => "payout.completed",
        }
    }

    fn booking(&self) -> &Booking {
        match self {
            Notice::BookingCreated { booking }
            | Notice::DepositReceived { booking }
            | Notice::BookingAccepted { booking }
            | Notice::BookingDeclined { booking }
            | Notice::BookingExpired { booking }
            | Notice::WorkDelivered { booking }
            | Notice::RevisionRequested { booking }
            | Notice::BookingCompleted { booking }
            | Notice::BookingCancelled { booking, .. }
            | Notice::DisputeOpened { booking, .. }
            | Notice::RefundCompleted { booking, .. }
            | Notice::PayoutCompleted { booking, .. } => booking,
        }
    }

    fn title(&self) -> String {
        let booking_ref = &self.booking().booking_ref;
        match self {
            Notice::BookingCreated { .. } => format!("Booking {} created", booking_ref),
            Notice::DepositReceived { .. } => format!("New booking request {}", booking_ref),
            Notice::BookingAccepted { .. } => format!("Booking {} accepted", booking_ref),
            Notice::BookingDeclined { .. } => format!("Booking {} declined", booking_ref),
            Notice::BookingExpired { .. } => format!("Booking {} expired", booking_ref),
            Notice::WorkDelivered { .. } => format!("Booking {} delivered", booking_ref),
            Notice::RevisionRequested { .. } => {
                format!("Revision requested on booking {}", booking_ref)
            }
            Notice::BookingCompleted { .. } => format!("Booking {} completed", booking_ref),
            Notice::BookingCancelled { .. } => format!("Booking {} cancelled", booking_ref),
            Notice::DisputeOpened { .. } => format!("Dispute opened on booking {}", booking_ref),
            Notice::RefundCompleted { .. } => format!("Refund issued for booking {}", booking_ref),
            Notice::PayoutCompleted { .. } => format!("Payout sent for booking {}", booking_ref),
        }
    }

    fn message(&self) -> String {
        let booking = self.booking();
        match self {
            Notice::BookingCreated { .. } => format!(
                "Your booking for \"{}\" was created. Pay the deposit of {} to send it to the provider.",
                booking.title,
                format_amount(booking.deposit_amount)
            ),
            Notice::DepositReceived { .. } => format!(
                "The deposit for \"{}\" was received. Respond before {} or the booking is declined automatically.",
                booking.title,
                booking.response_deadline.format("%Y-%m-%d %H:%M UTC")
            ),
            Notice::BookingAccepted { .. } => {
                format!("The provider accepted \"{}\" and will deliver within {} days.", booking.title, booking.delivery_days)
            }
            Notice::BookingDeclined { .. } => {
                format!("The provider declined \"{}\". Your deposit is being refunded in full.", booking.title)
            }
            Notice::BookingExpired { .. } => format!(
                "The provider did not respond to \"{}\" in time. Your deposit is being refunded in full.",
                booking.title
            ),
            Notice::WorkDelivered { .. } => format!(
                "Work for \"{}\" was delivered. Review it and pay the remaining {} to complete.",
                booking.title,
                format_amount(booking.remaining_amount)
            ),
            Notice::RevisionRequested { .. } => format!(
                "The customer requested a revision on \"{}\" ({} of {} used).",
                booking.title, booking.revisions_used, booking.revisions_allowed
            ),
            Notice::BookingCompleted { .. } => {
                format!("Booking \"{}\" is complete. Thank you!", booking.title)
            }
            Notice::BookingCancelled { refund, .. } => {
                if *refund > 0 {
                    format!(
                        "Booking \"{}\" was cancelled. A refund of {} is on its way.",
                        booking.title,
                        format_amount(*refund)
                    )
                } else {
                    format!("Booking \"{}\" was cancelled.", booking.title)
                }
            }
            Notice::DisputeOpened { reason, .. } => format!(
                "A dispute was opened on \"{}\": {}. An administrator will review it.",
                booking.title, reason
            ),
            Notice::RefundCompleted { amount, .. } => format!(
                "A refund of {} for \"{}\" was completed.",
                format_amount(*amount),
                booking.title
            ),
            Notice::PayoutCompleted { amount, .. } => format!(
                "Your payout of {} for \"{}\" was sent.",
                format_amount(*amount),
                booking.title
            ),
        }
    }

    fn payload(&self) -> serde_json::Value {
        let booking = self.booking();
        let mut payload = serde_json::json!({
            "booking_id": booking.id,
            "booking_ref": booking.booking_ref,
        });
        match self {
            Notice::BookingCancelled { refund, .. } => {
                payload["refund_amount"] = serde_json::json!(refund);
            }
            Notice::RefundCompleted { amount, .. } | Notice::PayoutCompleted { amount, .. } => {
                payload["amount"] = serde_json::json!(amount);
            }
            _ => {}
        }
        payload
    }
}

/// Render a minor-unit amount with two decimals
fn format_amount(minor: i64) -> String {
    format!("{}.{:02}", minor / 100, (minor % 100).abs())
}

/// Fans notifications out to every configured channel.
///
/// Dispatch persists the notification first, then attempts each channel
/// once inline; the sweep re-attempts whatever is still unmarked.
#[derive(Clone)]
pub struct Notifier {
    channels: Arc<Vec<Arc<dyn NotificationChannel>>>,
}

impl Notifier {
    pub fn new(channels: Vec<Arc<dyn NotificationChannel>>) -> Self {
        Self {
            channels: Arc::new(channels),
        }
    }

    /// Persist and deliver a notice to one user. Failures are logged,
    /// never returned; a broken notifier must not break the lifecycle.
    pub async fn dispatch(&self, db: &Database, user_id: &str, notice: Notice<'_>) {
        let user: Option<User> = match sqlx::query_as("SELECT * FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(db.pool())
            .await
        {
            Ok(user) => user,
            Err(e) => {
                tracing::error!("Notification recipient lookup failed: {}", e);
                return;
            }
        };
        let Some(user) = user else {
            tracing::warn!("Notification for unknown user {}", user_id);
            return;
        };

        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let payload = notice.payload().to_string();
        let inserted = sqlx::query(
            r#"
            INSERT INTO notifications (id, user_id, event_type, title, message, payload, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(user_id)
        .bind(notice.event_type())
        .bind(notice.title())
        .bind(notice.message())
        .bind(&payload)
        .bind(now)
        .execute(db.pool())
        .await;

        if let Err(e) = inserted {
            tracing::error!("Failed to persist notification for {}: {}", user_id, e);
            return;
        }

        let notification: Notification =
            match sqlx::query_as("SELECT * FROM notifications WHERE id = ?")
                .bind(&id)
                .fetch_one(db.pool())
                .await
            {
                Ok(n) => n,
                Err(e) => {
                    tracing::error!("Failed to load notification {}: {}", id, e);
                    return;
                }
            };

        self.attempt_channels(db, &user, &notification).await;
    }

    /// Re-attempt delivery for notifications with unmarked channels.
    /// Called periodically by the background sweep.
    pub async fn retry_undelivered(&self, db: &Database) -> AppResult<u32> {
        if self.channels.is_empty() {
            return Ok(0);
        }

        let conditions: Vec<String> = self
            .channels
            .iter()
            .map(|c| format!("{}_sent_at IS NULL", c.name()))
            .collect();
        let sql = format!(
            "SELECT * FROM notifications WHERE {} ORDER BY created_at ASC LIMIT 100",
            conditions.join(" OR ")
        );

        let pending: Vec<Notification> = sqlx::query_as(&sql).fetch_all(db.pool()).await?;
        let mut retried = 0;

        for notification in pending {
            let user: Option<User> = sqlx::query_as("SELECT * FROM users WHERE id = ?")
                .bind(&notification.user_id)
                .fetch_optional(db.pool())
                .await?;
            let Some(user) = user else { continue };

            self.attempt_channels(db, &user, &notification).await;
            retried += 1;
        }

        Ok(retried)
    }

    async fn attempt_channels(&self, db: &Database, user: &User, notification: &Notification) {
        for channel in self.channels.iter() {
            if notification.delivered_via(channel.name()) {
                continue;
            }
            match channel.deliver(user, notification).await {
                Ok(()) => {
                    if let Err(e) = mark_delivered(db, &notification.id, channel.name()).await {
                        tracing::error!(
                            "Failed to mark {} delivery of {}: {}",
                            channel.name(),
                            notification.id,
                            e
                        );
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        "{} delivery of notification {} failed: {}",
                        channel.name(),
                        notification.id,
                        e
                    );
                }
            }
        }
    }
}

async fn mark_delivered(db: &Database, notification_id: &str, channel: &'static str) -> AppResult<()> {
    // Channel names come from the fixed set above, so splicing the column
    // name is safe.
    let sql = format!("UPDATE notifications SET {}_sent_at = ? WHERE id = ?", channel);
    sqlx::query(&sql)
        .bind(Utc::now())
        .bind(notification_id)
        .execute(db.pool())
        .await?;
    Ok(())
}
