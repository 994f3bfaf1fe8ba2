use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Payment record owned by the escrow tracker.
///
/// Charges (deposit, final) move money in, refunds and payouts move it
/// out. `gateway_transaction_id` is unique across all rows; webhooks are
/// matched on it, which is what makes their application exactly-once.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Payment {
    pub id: String,
    pub booking_id: String,
    pub stage: String,
    pub amount: i64,
    pub status: String,
    pub gateway_transaction_id: Option<String>,
    pub checkout_url: Option<String>,
    pub flag_reason: Option<String>,
    pub failure_reason: Option<String>,
    pub not_before: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Which leg of the money flow a payment row belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStage {
    Deposit,
    Final,
    Refund,
    Payout,
}

impl From<String> for PaymentStage {
    fn from(s: String) -> Self {
        match s.as_str() {
            "final" => PaymentStage::Final,
            "refund" => PaymentStage::Refund,
            "payout" => PaymentStage::Payout,
            _ => PaymentStage::Deposit,
        }
    }
}

impl From<PaymentStage> for String {
    fn from(s: PaymentStage) -> Self {
        match s {
            PaymentStage::Deposit => "deposit",
            PaymentStage::Final => "final",
            PaymentStage::Refund => "refund",
            PaymentStage::Payout => "payout",
        }
        .to_string()
    }
}

impl PaymentStage {
    /// Charges pull money from the customer; refunds and payouts push it out
    pub fn is_charge(&self) -> bool {
        matches!(self, PaymentStage::Deposit | PaymentStage::Final)
    }
}

/// Payment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

impl From<String> for PaymentStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "completed" => PaymentStatus::Completed,
            "failed" => PaymentStatus::Failed,
            "refunded" => PaymentStatus::Refunded,
            _ => PaymentStatus::Pending,
        }
    }
}

impl From<PaymentStatus> for String {
    fn from(s: PaymentStatus) -> Self {
        match s {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        }
        .to_string()
    }
}

impl Payment {
    /// Get stage as enum
    pub fn stage_enum(&self) -> PaymentStage {
        PaymentStage::from(self.stage.clone())
    }

    /// Get status as enum
    pub fn status_enum(&self) -> PaymentStatus {
        PaymentStatus::from(self.status.clone())
    }

    /// Terminal payments are never touched by webhooks again
    pub fn is_terminal(&self) -> bool {
        !matches!(self.status_enum(), PaymentStatus::Pending)
    }

    /// Check if the row is waiting to be sent to the gateway
    pub fn is_unsubmitted(&self) -> bool {
        self.status_enum() == PaymentStatus::Pending && self.gateway_transaction_id.is_none()
    }

    /// Check if the payment is held for manual review
    pub fn is_flagged(&self) -> bool {
        self.flag_reason.is_some()
    }
}

/// Payment intent returned to the customer after charge creation
#[derive(Debug, Clone, Serialize)]
pub struct PaymentIntent {
    pub payment_id: String,
    pub stage: PaymentStage,
    pub amount: i64,
    pub checkout_url: Option<String>,
}

/// Dispute raised by either party; resolution moves money, admin decides
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Dispute {
    pub id: String,
    pub booking_id: String,
    pub opened_by: String,
    pub reason: String,
    pub status: String,
    pub resolution: Option<String>,
    pub resolution_notes: Option<String>,
    pub resolved_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Dispute status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisputeStatus {
    Open,
    Resolved,
}

impl From<String> for DisputeStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "resolved" => DisputeStatus::Resolved,
            _ => DisputeStatus::Open,
        }
    }
}

impl Dispute {
    /// Get status as enum
    pub fn status_enum(&self) -> DisputeStatus {
        DisputeStatus::from(self.status.clone())
    }

    /// Check if dispute is open
    pub fn is_open(&self) -> bool {
        self.status_enum() == DisputeStatus::Open
    }
}

/// How an admin settles a dispute over the funds currently held
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisputeResolution {
    /// Everything held goes back to the customer
    CustomerFull,
    /// Everything held is released to the provider
    ProviderFull,
    /// Split: X% to customer, Y% to provider
    Split {
        customer_percent: i64,
        provider_percent: i64,
    },
}

impl DisputeResolution {
    /// Parse from string like "customer_full", "provider_full", "split_50_50"
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "customer_full" => Some(Self::CustomerFull),
            "provider_full" => Some(Self::ProviderFull),
            s if s.starts_with("split_") => {
                let parts: Vec<&str> = s[6..].split('_').collect();
                if parts.len() == 2 {
                    let customer: i64 = parts[0].parse().ok()?;
                    let provider: i64 = parts[1].parse().ok()?;
                    if customer + provider == 100 && customer >= 0 && provider >= 0 {
                        return Some(Self::Split {
                            customer_percent: customer,
                            provider_percent: provider,
                        });
                    }
                }
                None
            }
            _ => None,
        }
    }

    /// Convert to string
    pub fn as_string(&self) -> String {
        match self {
            Self::CustomerFull => "customer_full".to_string(),
            Self::ProviderFull => "provider_full".to_string(),
            Self::Split {
                customer_percent,
                provider_percent,
            } => format!("split_{}_{}", customer_percent, provider_percent),
        }
    }

    /// Calculate (customer refund, provider release) over the held amount.
    /// Any rounding remainder stays with the customer side.
    pub fn calculate_amounts(&self, held: i64) -> (i64, i64) {
        match self {
            Self::CustomerFull => (held, 0),
            Self::ProviderFull => (0, held),
            Self::Split {
                provider_percent, ..
            } => {
                let provider_amount = (held * provider_percent) / 100;
                (held - provider_amount, provider_amount)
            }
        }
    }
}

/// Resolve dispute request
#[derive(Debug, Clone, Deserialize)]
pub struct ResolveDisputeRequest {
    pub resolution: String,
    pub notes: Option<String>,
}

/// Admin decision on a flagged payment
#[derive(Debug, Clone, Deserialize)]
pub struct ResolvePaymentRequest {
    /// One of "complete", "fail" or "retry"
    pub action: String,
    pub note: Option<String>,
}
