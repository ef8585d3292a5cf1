use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use url::Url;

use crate::domain::CounterName;
use crate::error::{Result, SyncError};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub ledger: LedgerConfig,
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    /// WebSocket endpoint of the ledger query bridge
    pub ws_url: String,
    /// Connect + subscribe timeout per topic in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

fn default_connect_timeout() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetadataConfig {
    /// GraphQL endpoint of the descriptive-metadata service
    pub api_url: String,
    /// Per-request timeout in milliseconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    /// Largest number of ids sent in one request
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Image preset requested from the service (e.g. "small")
    #[serde(default = "default_image_preset")]
    pub image_preset: String,
}

fn default_request_timeout() -> u64 {
    8_000
}

fn default_max_batch_size() -> usize {
    25
}

fn default_image_preset() -> String {
    "small".to_string()
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.kivaws.org/graphql".to_string(),
            request_timeout_ms: default_request_timeout(),
            max_batch_size: default_max_batch_size(),
            image_preset: default_image_preset(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    /// Ledger fixed-point units per one display unit (1 KD$ = 1000 units)
    pub ledger_units_per_display_unit: u64,
    /// Fixed-point denominator of the oracle answer (8 decimals)
    pub oracle_rate_denominator: u64,
    /// Decimal places kept by `to_display_unit`
    pub display_decimals: u32,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            ledger_units_per_display_unit: 1_000,
            oracle_rate_denominator: 100_000_000,
            display_decimals: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Capacity of the ledger-update channel feeding the engine
    pub ledger_channel_capacity: usize,
    /// Capacity of the async-result channel (fetches, submissions)
    pub result_channel_capacity: usize,
    /// Capacity of the command channel used by handles
    pub command_channel_capacity: usize,
    /// Capacity of the notification broadcast channel
    pub notification_capacity: usize,
    /// Aggregate counters to subscribe to
    pub counters: Vec<CounterName>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ledger_channel_capacity: 256,
            result_channel_capacity: 128,
            command_channel_capacity: 32,
            notification_capacity: 256,
            counters: CounterName::ALL.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Report submissions as finalized without touching the ledger
    #[serde(default)]
    pub dry_run: bool,
    /// A submission without a terminal status after this long is failed
    #[serde(default = "default_submission_timeout")]
    pub submission_timeout_ms: u64,
}

fn default_submission_timeout() -> u64 {
    120_000
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            submission_timeout_ms: default_submission_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> std::result::Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> std::result::Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default values
            .set_default("ledger.ws_url", "ws://127.0.0.1:9955")?
            .set_default("metadata.api_url", "https://api.kivaws.org/graphql")?
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("MICROLOAN_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (MICROLOAN_LEDGER__WS_URL, etc.)
            .add_source(
                Environment::with_prefix("MICROLOAN")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Configuration for the offline demo (no network endpoints are contacted)
    pub fn offline() -> Self {
        Self {
            ledger: LedgerConfig {
                ws_url: "ws://127.0.0.1:9955".to_string(),
                connect_timeout_ms: default_connect_timeout(),
            },
            metadata: MetadataConfig::default(),
            pricing: PricingConfig::default(),
            engine: EngineConfig::default(),
            gateway: GatewayConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Reject values that would make the engine misbehave at runtime
    pub fn validate(&self) -> Result<()> {
        let ws = Url::parse(&self.ledger.ws_url)
            .map_err(|e| SyncError::InvalidConfig(format!("ledger.ws_url: {}", e)))?;
        if !matches!(ws.scheme(), "ws" | "wss") {
            return Err(SyncError::InvalidConfig(format!(
                "ledger.ws_url must use ws:// or wss://, got {}",
                ws.scheme()
            )));
        }

        let api = Url::parse(&self.metadata.api_url)
            .map_err(|e| SyncError::InvalidConfig(format!("metadata.api_url: {}", e)))?;
        if !matches!(api.scheme(), "http" | "https") {
            return Err(SyncError::InvalidConfig(format!(
                "metadata.api_url must use http(s), got {}",
                api.scheme()
            )));
        }

        if self.metadata.max_batch_size == 0 {
            return Err(SyncError::InvalidConfig(
                "metadata.max_batch_size must be positive".into(),
            ));
        }
        if self.pricing.ledger_units_per_display_unit == 0
            || self.pricing.oracle_rate_denominator == 0
        {
            return Err(SyncError::InvalidConfig(
                "pricing scales must be non-zero".into(),
            ));
        }
        if self.engine.ledger_channel_capacity == 0
            || self.engine.result_channel_capacity == 0
            || self.engine.command_channel_capacity == 0
            || self.engine.notification_capacity == 0
        {
            return Err(SyncError::InvalidConfig(
                "engine channel capacities must be positive".into(),
            ));
        }
        if self.gateway.submission_timeout_ms == 0 {
            return Err(SyncError::InvalidConfig(
                "gateway.submission_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}
