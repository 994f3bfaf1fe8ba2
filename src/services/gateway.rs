use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::config::GatewayConfig;
use crate::error::{AppError, AppResult};

type HmacSha256 = Hmac<Sha256>;

/// Result of creating a charge with the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayCharge {
    pub transaction_id: String,
    pub checkout_url: String,
}

/// Webhook event vocabulary shared with the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayEvent {
    ChargeSucceeded,
    ChargeFailed,
    RefundSucceeded,
    RefundFailed,
    TransferSucceeded,
    TransferFailed,
}

impl GatewayEvent {
    /// Parse the wire event tag; unrecognized events are ignored upstream
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "charge.succeeded" => Some(Self::ChargeSucceeded),
            "charge.failed" => Some(Self::ChargeFailed),
            "refund.succeeded" => Some(Self::RefundSucceeded),
            "refund.failed" => Some(Self::RefundFailed),
            "transfer.succeeded" => Some(Self::TransferSucceeded),
            "transfer.failed" => Some(Self::TransferFailed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChargeSucceeded => "charge.succeeded",
            Self::ChargeFailed => "charge.failed",
            Self::RefundSucceeded => "refund.succeeded",
            Self::RefundFailed => "refund.failed",
            Self::TransferSucceeded => "transfer.succeeded",
            Self::TransferFailed => "transfer.failed",
        }
    }

    /// Success events must carry an amount for reconciliation
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            Self::ChargeSucceeded | Self::RefundSucceeded | Self::TransferSucceeded
        )
    }
}

/// Payment gateway capability.
///
/// The marketplace only ever needs these four operations; SDK specifics
/// stay behind the implementations. `reference` is always our payment id
/// and doubles as the idempotency key on the gateway side.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Create a customer charge, returning the gateway transaction id and
    /// a checkout URL for the customer
    async fn create_charge(
        &self,
        reference: &str,
        amount: i64,
        description: &str,
    ) -> AppResult<GatewayCharge>;

    /// Refund a previously completed charge; returns the gateway
    /// transaction id of the refund
    async fn create_refund(
        &self,
        reference: &str,
        charge_transaction_id: &str,
        amount: i64,
    ) -> AppResult<String>;

    /// Transfer funds out to a provider; returns the gateway transaction id
    async fn create_transfer(
        &self,
        reference: &str,
        recipient_id: &str,
        amount: i64,
    ) -> AppResult<String>;

    /// Verify a webhook payload signature
    fn verify_signature(&self, payload: &[u8], signature: &str) -> bool;
}

/// Compute the hex HMAC-SHA256 signature the gateway puts on webhooks
pub fn sign_payload(secret: &str, payload: &[u8]) -> AppResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| AppError::Internal("invalid webhook secret".to_string()))?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time webhook signature check
pub fn verify_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    let expected = match sign_payload(secret, payload) {
        Ok(expected) => expected,
        Err(_) => return false,
    };
    expected.as_bytes().ct_eq(signature.as_bytes()).into()
}

/// Retry a gateway call with exponential backoff. Only errors the
/// gateway marked retryable are retried; everything else surfaces
/// immediately.
pub async fn with_backoff<T, F, Fut>(config: &GatewayConfig, label: &str, mut op: F) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = AppResult<T>>,
{
    let mut delay = Duration::from_millis(config.retry_delay_ms);
    let mut attempt = 1u32;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(AppError::Gateway {
                message,
                retryable: true,
            }) if attempt < config.max_attempts => {
                tracing::warn!(
                    "Gateway {} attempt {} failed: {}, retrying",
                    label,
                    attempt,
                    message
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// HTTP gateway adapter
pub struct HttpGateway {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    webhook_secret: String,
}

#[derive(Debug, Deserialize)]
struct TransactionRef {
    transaction_id: String,
}

impl HttpGateway {
    pub fn new(config: &GatewayConfig) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::Internal(format!("failed to build gateway client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            webhook_secret: config.webhook_secret.clone(),
        })
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> AppResult<serde_json::Value> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::Gateway {
                message: e.to_string(),
                // Transport problems are worth another try; everything the
                // gateway actually answered is judged by status below
                retryable: e.is_timeout() || e.is_connect(),
            })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(AppError::Gateway {
                message: format!("{} returned {}", path, status),
                retryable: true,
            });
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AppError::Gateway {
                message: format!("{} rejected with {}: {}", path, status, detail),
                retryable: false,
            });
        }

        response.json().await.map_err(|e| AppError::Gateway {
            message: format!("invalid gateway response: {}", e),
            retryable: false,
        })
    }
}

#[async_trait]
impl PaymentGateway for HttpGateway {
    async fn create_charge(
        &self,
        reference: &str,
        amount: i64,
        description: &str,
    ) -> AppResult<GatewayCharge> {
        let body = serde_json::json!({
            "reference": reference,
            "amount": amount,
            "description": description,
        });
        let value = self.post("/v1/charges", body).await?;
        serde_json::from_value(value).map_err(|e| AppError::Gateway {
            message: format!("invalid charge response: {}", e),
            retryable: false,
        })
    }

    async fn create_refund(
        &self,
        reference: &str,
        charge_transaction_id: &str,
        amount: i64,
    ) -> AppResult<String> {
        let body = serde_json::json!({
            "reference": reference,
            "charge_transaction_id": charge_transaction_id,
            "amount": amount,
        });
        let value = self.post("/v1/refunds", body).await?;
        let parsed: TransactionRef = serde_json::from_value(value).map_err(|e| AppError::Gateway {
            message: format!("invalid refund response: {}", e),
            retryable: false,
        })?;
        Ok(parsed.transaction_id)
    }

    async fn create_transfer(
        &self,
        reference: &str,
        recipient_id: &str,
        amount: i64,
    ) -> AppResult<String> {
        let body = serde_json::json!({
            "reference": reference,
            "recipient": recipient_id,
            "amount": amount,
        });
        let value = self.post("/v1/transfers", body).await?;
        let parsed: TransactionRef = serde_json::from_value(value).map_err(|e| AppError::Gateway {
            message: format!("invalid transfer response: {}", e),
            retryable: false,
        })?;
        Ok(parsed.transaction_id)
    }

    fn verify_signature(&self, payload: &[u8], signature: &str) -> bool {
        verify_signature(&self.webhook_secret, payload, signature)
    }
}

/// Recorded mock gateway call, for assertions in tests
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    Charge {
        reference: String,
        amount: i64,
    },
    Refund {
        reference: String,
        charge_transaction_id: String,
        amount: i64,
    },
    Transfer {
        reference: String,
        recipient_id: String,
        amount: i64,
    },
}

/// In-process gateway with deterministic transaction ids. Used when no
/// real gateway is configured, and by tests to script failures.
pub struct MockGateway {
    webhook_secret: String,
    counter: AtomicU64,
    calls: Mutex<Vec<GatewayCall>>,
    scripted_failures: Mutex<VecDeque<(String, bool)>>,
}

impl MockGateway {
    pub fn new(webhook_secret: &str) -> Self {
        Self {
            webhook_secret: webhook_secret.to_string(),
            counter: AtomicU64::new(0),
            calls: Mutex::new(Vec::new()),
            scripted_failures: Mutex::new(VecDeque::new()),
        }
    }

    /// Queue a failure for the next gateway call
    pub fn fail_next(&self, message: &str, retryable: bool) {
        if let Ok(mut failures) = self.scripted_failures.lock() {
            failures.push_back((message.to_string(), retryable));
        }
    }

    /// Everything the gateway has been asked to do so far
    pub fn calls(&self) -> Vec<GatewayCall> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    /// Sign a payload the way this gateway signs its webhooks
    pub fn sign(&self, payload: &[u8]) -> AppResult<String> {
        sign_payload(&self.webhook_secret, payload)
    }

    fn next_id(&self, kind: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("mock-{}-{}", kind, n)
    }

    fn record(&self, call: GatewayCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    fn take_failure(&self) -> Option<AppError> {
        let (message, retryable) = self.scripted_failures.lock().ok()?.pop_front()?;
        Some(AppError::Gateway { message, retryable })
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn create_charge(
        &self,
        reference: &str,
        amount: i64,
        _description: &str,
    ) -> AppResult<GatewayCharge> {
        self.record(GatewayCall::Charge {
            reference: reference.to_string(),
            amount,
        });
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        Ok(GatewayCharge {
            transaction_id: self.next_id("charge"),
            checkout_url: format!("https://gateway.invalid/checkout/{}", reference),
        })
    }

    async fn create_refund(
        &self,
        reference: &str,
        charge_transaction_id: &str,
        amount: i64,
    ) -> AppResult<String> {
        self.record(GatewayCall::Refund {
            reference: reference.to_string(),
            charge_transaction_id: charge_transaction_id.to_string(),
            amount,
        });
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        Ok(self.next_id("refund"))
    }

    async fn create_transfer(
        &self,
        reference: &str,
        recipient_id: &str,
        amount: i64,
    ) -> AppResult<String> {
        self.record(GatewayCall::Transfer {
            reference: reference.to_string(),
            recipient_id: recipient_id.to_string(),
            amount,
        });
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        Ok(self.next_id("transfer"))
    }

    fn verify_signature(&self, payload: &[u8], signature: &str) -> bool {
        verify_signature(&self.webhook_secret, payload, signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_roundtrip() {
        let payload = br#"{"event":"charge.succeeded"}"#;
        let signature = sign_payload("secret", payload).unwrap();
        assert!(verify_signature("secret", payload, &signature));
    }

    #[test]
    fn signature_rejects_tampered_payload() {
        let signature = sign_payload("secret", b"original").unwrap();
        assert!(!verify_signature("secret", b"tampered", &signature));
        assert!(!verify_signature("other-secret", b"original", &signature));
        assert!(!verify_signature("secret", b"original", "not-hex"));
    }

    #[tokio::test]
    async fn backoff_retries_retryable_errors() {
        let config = GatewayConfig {
            max_attempts: 3,
            retry_delay_ms: 1,
            ..GatewayConfig::default()
        };
        let attempts = std::sync::atomic::AtomicU32::new(0);

        let result = with_backoff(&config, "test", || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(AppError::Gateway {
                        message: "boom".to_string(),
                        retryable: true,
                    })
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn backoff_gives_up_after_max_attempts() {
        let config = GatewayConfig {
            max_attempts: 2,
            retry_delay_ms: 1,
            ..GatewayConfig::default()
        };
        let attempts = std::sync::atomic::AtomicU32::new(0);

        let result: AppResult<()> = with_backoff(&config, "test", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async {
                Err(AppError::Gateway {
                    message: "boom".to_string(),
                    retryable: true,
                })
            }
        })
        .await;

        assert!(matches!(result, Err(AppError::Gateway { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn backoff_does_not_retry_terminal_errors() {
        let config = GatewayConfig {
            max_attempts: 3,
            retry_delay_ms: 1,
            ..GatewayConfig::default()
        };
        let attempts = std::sync::atomic::AtomicU32::new(0);

        let result: AppResult<()> = with_backoff(&config, "test", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async {
                Err(AppError::Gateway {
                    message: "card declined".to_string(),
                    retryable: false,
                })
            }
        })
        .await;

        assert!(matches!(result, Err(AppError::Gateway { retryable: false, .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn mock_gateway_ids_are_deterministic() {
        let gateway = MockGateway::new("secret");
        let charge = gateway.create_charge("pay-1", 1000, "test").await.unwrap();
        assert_eq!(charge.transaction_id, "mock-charge-1");
        let refund = gateway.create_refund("pay-2", "mock-charge-1", 500).await.unwrap();
        assert_eq!(refund, "mock-refund-2");
        assert_eq!(gateway.calls().len(), 2);
    }

    #[tokio::test]
    async fn mock_gateway_scripted_failure() {
        let gateway = MockGateway::new("secret");
        gateway.fail_next("outage", true);
        let err = gateway.create_charge("pay-1", 1000, "test").await;
        assert!(matches!(err, Err(AppError::Gateway { retryable: true, .. })));
        // Next call succeeds again
        assert!(gateway.create_charge("pay-1", 1000, "test").await.is_ok());
    }
}
