use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration structure for QZPay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub billing: BillingConfig,

    #[serde(default)]
    pub webhooks: WebhookConfig,

    #[serde(default)]
    pub providers: ProvidersConfig,

    #[serde(default)]
    pub health: HealthConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            billing: BillingConfig::default(),
            webhooks: WebhookConfig::default(),
            providers: ProvidersConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &str) -> Result<Self, crate::Error> {
        use crate::Error;

        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, crate::Error> {
        // Try to load from QZPAY_CONFIG env var first
        if let Ok(config_path) = std::env::var("QZPAY_CONFIG") {
            return Self::load(&config_path);
        }

        // Try default locations
        let default_paths = [
            "./config/default.toml",
            "./config/production.toml",
            "/etc/qzpay/config.toml",
        ];

        for path in &default_paths {
            if Path::new(path).exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        use crate::Error;

        if self.billing.grace_period_days < 0 {
            return Err(Error::Config("grace_period_days must be >= 0".to_string()));
        }

        if self.billing.retry_intervals.iter().any(|d| *d <= 0) {
            return Err(Error::Config(
                "retry_intervals entries must be positive day counts".to_string(),
            ));
        }

        if self.billing.trial_conversion_days < 0 {
            return Err(Error::Config(
                "trial_conversion_days must be >= 0".to_string(),
            ));
        }

        if self.webhooks.timestamp_tolerance_seconds <= 0 {
            return Err(Error::Config(
                "timestamp_tolerance_seconds must be > 0".to_string(),
            ));
        }

        if self.billing.default_currency.len() != 3 {
            return Err(Error::Config(
                "default_currency must be a 3-letter ISO code".to_string(),
            ));
        }

        Ok(())
    }
}

/// Billing engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingConfig {
    /// Days a past_due subscription remains functional before
    /// non-payment cancellation
    #[serde(default = "default_grace_period_days")]
    pub grace_period_days: i64,

    /// Ordered days-between-retries, e.g. [1, 3, 5]
    #[serde(default = "default_retry_intervals")]
    pub retry_intervals: Vec<i64>,

    /// Days before trial_end to attempt conversion (0 = at trial end)
    #[serde(default)]
    pub trial_conversion_days: i64,

    /// Used when a price lacks an explicit currency
    #[serde(default = "default_currency")]
    pub default_currency: String,

    /// Tags all created records as live or test billing
    #[serde(default)]
    pub livemode: bool,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            grace_period_days: default_grace_period_days(),
            retry_intervals: default_retry_intervals(),
            trial_conversion_days: 0,
            default_currency: default_currency(),
            livemode: false,
        }
    }
}

/// Inbound webhook configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Replay-protection window in seconds; the boundary is inclusive
    #[serde(default = "default_timestamp_tolerance")]
    pub timestamp_tolerance_seconds: i64,

    /// Shared secret for HMAC verification. When absent, verification
    /// passes (development mode); production configuration requires it.
    #[serde(default)]
    pub secret: Option<String>,

    /// How long processed provider event ids are remembered for
    /// idempotent dispatch
    #[serde(default = "default_processed_ttl")]
    pub processed_id_ttl_seconds: i64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timestamp_tolerance_seconds: default_timestamp_tolerance(),
            secret: None,
            processed_id_ttl_seconds: default_processed_ttl(),
        }
    }
}

/// Payment provider credentials
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub stripe: Option<GatewayCredentials>,

    #[serde(default)]
    pub mercadopago: Option<GatewayCredentials>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayCredentials {
    pub api_key: String,

    #[serde(default)]
    pub webhook_secret: Option<String>,
}

/// Health probe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Per-probe timeout; exceeding it marks the component unhealthy
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Storage response time above this marks the component degraded
    #[serde(default = "default_storage_degraded_ms")]
    pub storage_degraded_ms: u64,

    /// Provider response time above this marks the component degraded
    #[serde(default = "default_provider_degraded_ms")]
    pub provider_degraded_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: default_probe_timeout_ms(),
            storage_degraded_ms: default_storage_degraded_ms(),
            provider_degraded_ms: default_provider_degraded_ms(),
        }
    }
}

fn default_grace_period_days() -> i64 {
    7
}

fn default_retry_intervals() -> Vec<i64> {
    vec![1, 3, 5]
}

fn default_currency() -> String {
    "USD".to_string()
}

fn default_timestamp_tolerance() -> i64 {
    300
}

fn default_processed_ttl() -> i64 {
    86400
}

fn default_probe_timeout_ms() -> u64 {
    5000
}

fn default_storage_degraded_ms() -> u64 {
    2000
}

fn default_provider_degraded_ms() -> u64 {
    3000
}
