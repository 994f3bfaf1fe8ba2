use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Booking model; the central entity of the marketplace.
///
/// Commercial terms (amounts, delivery window, revision allowance) are
/// snapshotted from the selected package at creation and never change
/// afterwards. Status only moves through `BookingStatus` transitions,
/// every one of them recorded in `booking_timeline`.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Booking {
    pub id: String,
    pub booking_ref: String,
    pub customer_id: String,
    pub provider_id: String,
    pub service_id: String,
    pub package_name: String,
    pub title: String,
    pub requirements: Option<String>,
    pub total_amount: i64,
    pub deposit_amount: i64,
    pub remaining_amount: i64,
    pub commission_rate: i64,
    pub commission_amount: i64,
    pub provider_earnings: i64,
    pub delivery_days: i64,
    pub revisions_allowed: i64,
    pub revisions_used: i64,
    pub status: String,
    pub payment_stage: String,
    pub version: i64,
    pub response_deadline: DateTime<Utc>,
    pub expected_delivery: Option<DateTime<Utc>>,
    pub provider_message: Option<String>,
    pub decline_reason: Option<String>,
    pub cancel_reason: Option<String>,
    pub delivery_message: Option<String>,
    pub customer_rating: Option<i64>,
    pub customer_review: Option<String>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Booking lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    PendingPayment,
    PendingApproval,
    Accepted,
    InProgress,
    Delivered,
    RevisionRequested,
    Completed,
    Declined,
    Cancelled,
    Disputed,
}

impl From<String> for BookingStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "pending_approval" => BookingStatus::PendingApproval,
            "accepted" => BookingStatus::Accepted,
            "in_progress" => BookingStatus::InProgress,
            "delivered" => BookingStatus::Delivered,
            "revision_requested" => BookingStatus::RevisionRequested,
            "completed" => BookingStatus::Completed,
            "declined" => BookingStatus::Declined,
            "cancelled" => BookingStatus::Cancelled,
            "disputed" => BookingStatus::Disputed,
            _ => BookingStatus::PendingPayment,
        }
    }
}

impl From<BookingStatus> for String {
    fn from(s: BookingStatus) -> Self {
        match s {
            BookingStatus::PendingPayment => "pending_payment",
            BookingStatus::PendingApproval => "pending_approval",
            BookingStatus::Accepted => "accepted",
            BookingStatus::InProgress => "in_progress",
            BookingStatus::Delivered => "delivered",
            BookingStatus::RevisionRequested => "revision_requested",
            BookingStatus::Completed => "completed",
            BookingStatus::Declined => "declined",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Disputed => "disputed",
        }
        .to_string()
    }
}

impl BookingStatus {
    /// Terminal statuses never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BookingStatus::Completed
                | BookingStatus::Declined
                | BookingStatus::Cancelled
                | BookingStatus::Disputed
        )
    }
}

/// Payment progress of a booking across the split-payment flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentProgress {
    /// Waiting on the deposit half
    Deposit,
    /// Deposit received, remaining half outstanding
    Remaining,
    /// Fully paid
    Settled,
}

impl From<String> for PaymentProgress {
    fn from(s: String) -> Self {
        match s.as_str() {
            "remaining" => PaymentProgress::Remaining,
            "settled" => PaymentProgress::Settled,
            _ => PaymentProgress::Deposit,
        }
    }
}

impl From<PaymentProgress> for String {
    fn from(p: PaymentProgress) -> Self {
        match p {
            PaymentProgress::Deposit => "deposit",
            PaymentProgress::Remaining => "remaining",
            PaymentProgress::Settled => "settled",
        }
        .to_string()
    }
}

impl Booking {
    /// Get status as enum
    pub fn status_enum(&self) -> BookingStatus {
        BookingStatus::from(self.status.clone())
    }

    /// Get payment progress as enum
    pub fn payment_progress(&self) -> PaymentProgress {
        PaymentProgress::from(self.payment_stage.clone())
    }

    /// Check if the booking has reached a terminal status
    pub fn is_terminal(&self) -> bool {
        self.status_enum().is_terminal()
    }

    /// Check if the user is one of the two parties
    pub fn is_party(&self, user_id: &str) -> bool {
        self.customer_id == user_id || self.provider_id == user_id
    }

    /// Check if the provider can still accept within the response window
    pub fn within_response_window(&self, now: DateTime<Utc>) -> bool {
        now <= self.response_deadline
    }

    /// Check if another revision may be requested
    pub fn has_revisions_left(&self) -> bool {
        self.revisions_used < self.revisions_allowed
    }
}

/// Who performed a lifecycle action, as recorded in the timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    Customer,
    Provider,
    System,
    Admin,
}

impl Actor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Actor::Customer => "customer",
            Actor::Provider => "provider",
            Actor::System => "system",
            Actor::Admin => "admin",
        }
    }
}

/// Append-only audit record of a booking status change
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct TimelineEntry {
    pub id: String,
    pub booking_id: String,
    pub status: String,
    pub note: String,
    pub actor: String,
    pub created_at: DateTime<Utc>,
}

/// Deliverable metadata attached on delivery; contents live elsewhere
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Deliverable {
    pub id: String,
    pub booking_id: String,
    pub filename: String,
    pub url: String,
    pub size_bytes: i64,
    pub note: Option<String>,
    pub uploaded_at: DateTime<Utc>,
}

/// Create booking request
#[derive(Debug, Clone, Deserialize)]
pub struct CreateBookingRequest {
    pub service_id: String,
    pub package_name: String,
    pub title: String,
    pub requirements: Option<String>,
}

/// Provider acceptance request
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AcceptBookingRequest {
    pub message: Option<String>,
}

/// Provider decline request
#[derive(Debug, Clone, Deserialize)]
pub struct DeclineBookingRequest {
    pub reason: Option<String>,
}

/// Delivery request; at least one deliverable is required
#[derive(Debug, Clone, Deserialize)]
pub struct DeliverRequest {
    pub message: Option<String>,
    pub deliverables: Vec<DeliverableInput>,
}

/// Deliverable metadata inside a delivery request
#[derive(Debug, Clone, Deserialize)]
pub struct DeliverableInput {
    pub filename: String,
    pub url: String,
    #[serde(default)]
    pub size_bytes: i64,
    pub note: Option<String>,
}

/// Revision request
#[derive(Debug, Clone, Deserialize)]
pub struct RevisionRequest {
    pub note: String,
}

/// Cancellation request
#[derive(Debug, Clone, Deserialize)]
pub struct CancelBookingRequest {
    pub reason: Option<String>,
}

/// Dispute request
#[derive(Debug, Clone, Deserialize)]
pub struct OpenDisputeRequest {
    pub reason: String,
}

/// Post-completion review request
#[derive(Debug, Clone, Deserialize)]
pub struct ReviewRequest {
    pub rating: i64,
    pub comment: Option<String>,
}
