use serde::Deserialize;

/// Application configuration
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Database URL (SQLite path)
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Session duration in hours
    #[serde(default = "default_session_hours")]
    pub session_hours: u64,

    /// Background sweep interval in seconds
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Payment gateway configuration
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Booking policy configuration
    #[serde(default)]
    pub booking: BookingConfig,

    /// Cancellation refund percentages per lifecycle phase
    #[serde(default)]
    pub refund_policy: RefundPolicyConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct GatewayConfig {
    /// Use the in-process mock gateway instead of a real one
    #[serde(default = "default_gateway_mock")]
    pub mock: bool,

    /// Gateway API base URL
    #[serde(default)]
    pub base_url: String,

    /// Gateway API key
    #[serde(default)]
    pub api_key: String,

    /// Shared secret for webhook signature verification
    #[serde(default = "default_webhook_secret")]
    pub webhook_secret: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_gateway_timeout_secs")]
    pub timeout_secs: u64,

    /// Attempts per gateway call before giving up on retryable errors
    #[serde(default = "default_gateway_max_attempts")]
    pub max_attempts: u32,

    /// Initial backoff delay between retries in milliseconds
    #[serde(default = "default_gateway_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            mock: default_gateway_mock(),
            base_url: String::new(),
            api_key: String::new(),
            webhook_secret: default_webhook_secret(),
            timeout_secs: default_gateway_timeout_secs(),
            max_attempts: default_gateway_max_attempts(),
            retry_delay_ms: default_gateway_retry_delay_ms(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct BookingConfig {
    /// Platform commission in percent, used when the provider has no override
    #[serde(default = "default_commission_rate")]
    pub commission_rate_percent: i64,

    /// Hours a provider has to respond to a paid booking request
    #[serde(default = "default_response_window_hours")]
    pub response_window_hours: i64,

    /// Hours between completion and the provider payout becoming due
    #[serde(default = "default_payout_delay_hours")]
    pub payout_delay_hours: i64,
}

impl Default for BookingConfig {
    fn default() -> Self {
        Self {
            commission_rate_percent: default_commission_rate(),
            response_window_hours: default_response_window_hours(),
            payout_delay_hours: default_payout_delay_hours(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct RefundPolicyConfig {
    /// Percent refunded when cancelling before the provider accepted
    #[serde(default = "default_refund_before_acceptance")]
    pub before_acceptance: i64,

    /// Percent refunded when cancelling after acceptance, before work started
    #[serde(default = "default_refund_accepted")]
    pub accepted: i64,

    /// Percent refunded when cancelling while work is in progress
    #[serde(default = "default_refund_in_progress")]
    pub in_progress: i64,

    /// Percent refunded when cancelling after delivery
    #[serde(default = "default_refund_after_delivery")]
    pub after_delivery: i64,
}

impl Default for RefundPolicyConfig {
    fn default() -> Self {
        Self {
            before_acceptance: default_refund_before_acceptance(),
            accepted: default_refund_accepted(),
            in_progress: default_refund_in_progress(),
            after_delivery: default_refund_after_delivery(),
        }
    }
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_database_url() -> String {
    "sqlite:data/gigmarket.db".to_string()
}

fn default_session_hours() -> u64 {
    24 * 7 // 1 week
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_gateway_mock() -> bool {
    true
}

fn default_webhook_secret() -> String {
    "dev-webhook-secret".to_string()
}

fn default_gateway_timeout_secs() -> u64 {
    10
}

fn default_gateway_max_attempts() -> u32 {
    3
}

fn default_gateway_retry_delay_ms() -> u64 {
    250
}

fn default_commission_rate() -> i64 {
    15
}

fn default_response_window_hours() -> i64 {
    24
}

fn default_payout_delay_hours() -> i64 {
    24
}

fn default_refund_before_acceptance() -> i64 {
    100
}

fn default_refund_accepted() -> i64 {
    100
}

fn default_refund_in_progress() -> i64 {
    50
}

fn default_refund_after_delivery() -> i64 {
    0
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            database_url: default_database_url(),
            session_hours: default_session_hours(),
            sweep_interval_secs: default_sweep_interval_secs(),
            gateway: GatewayConfig::default(),
            booking: BookingConfig::default(),
            refund_policy: RefundPolicyConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment and config file
    pub fn load() -> anyhow::Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            // Start with defaults
            .set_default("host", default_host())?
            .set_default("port", default_port())?
            .set_default("database_url", default_database_url())?
            .set_default("session_hours", default_session_hours())?
            .set_default("sweep_interval_secs", default_sweep_interval_secs())?
            // Load from config file if exists
            .add_source(config::File::with_name("config").required(false))
            // Override with environment variables (GIGMARKET_ prefix)
            .add_source(
                config::Environment::with_prefix("GIGMARKET")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !self.gateway.mock {
            if self.gateway.base_url.is_empty() {
                anyhow::bail!("gateway.base_url is required when gateway.mock is false");
            }
            if self.gateway.api_key.is_empty() {
                anyhow::bail!("gateway.api_key is required when gateway.mock is false");
            }
        }
        if self.gateway.webhook_secret.is_empty() {
            anyhow::bail!("gateway.webhook_secret must not be empty");
        }
        if !(0..=100).contains(&self.booking.commission_rate_percent) {
            anyhow::bail!("booking.commission_rate_percent must be between 0 and 100");
        }
        for (name, percent) in [
            ("before_acceptance", self.refund_policy.before_acceptance),
            ("accepted", self.refund_policy.accepted),
            ("in_progress", self.refund_policy.in_progress),
            ("after_delivery", self.refund_policy.after_delivery),
        ] {
            if !(0..=100).contains(&percent) {
                anyhow::bail!("refund_policy.{} must be between 0 and 100", name);
            }
        }
        Ok(())
    }
}
