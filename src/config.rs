//! Configuration management for the dVPN backend
//!
//! Configuration is loaded from a TOML file; every field has a default.
//!
//! # Example Configuration File
//!
//! ```toml
//! [network]
//! api_endpoint = "http://127.0.0.1:3000"
//! rpc_endpoint = "https://rpc.sentinel.co:443"
//! chain_id = "sentinelhub-2"
//! denom = "udvpn"
//! gas_price = "0.1"
//! gas_base = 200000
//! plan_id = "42"
//! provider_address = "sent1..."
//!
//! [wallets]
//! node_subscriber_mnemonic = "..."
//! fee_granter_mnemonic = "..."
//!
//! [catalog]
//! max_price_per_hour = 100
//! node_subscription_hours = 720
//! countries_file = "countries.json"
//!
//! [scheduler]
//! enabled = true
//!
//! [api]
//! bind_address = "0.0.0.0:8080"
//!
//! [app]
//! min_api_version = "1.0.0"
//! min_android_version = "2.3.0"
//! min_ios_version = "2.1.0"
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Ledger gateway connection configuration
    #[serde(default)]
    pub network: NetworkConfig,

    /// Signing material for each ledger role
    #[serde(default)]
    pub wallets: WalletsConfig,

    /// Catalog, plan and subscription policy
    #[serde(default)]
    pub catalog: CatalogConfig,

    /// Reconciliation job scheduling
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// API server configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Minimum client versions announced to apps
    #[serde(default)]
    pub app: AppVersionsConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Ledger gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Base URL of the REST gateway
    #[serde(default = "default_api_endpoint")]
    pub api_endpoint: String,

    /// RPC endpoint the gateway forwards transactions to
    #[serde(default = "default_rpc_endpoint")]
    pub rpc_endpoint: String,

    /// Chain identifier
    #[serde(default = "default_chain_id")]
    pub chain_id: String,

    /// Default token denomination for prices, balances and fees
    #[serde(default = "default_denom")]
    pub denom: String,

    /// Gas price per unit, without denomination (e.g. "0.1")
    #[serde(default = "default_gas_price")]
    pub gas_price: String,

    /// Gas limit for a single-item operation
    #[serde(default = "default_gas_base")]
    pub gas_base: u64,

    /// Gateway request timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub timeout_seconds: u64,

    /// Provider plan identifier
    #[serde(default)]
    pub plan_id: String,

    /// Provider wallet address (authz and fee granter)
    #[serde(default)]
    pub provider_address: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            api_endpoint: default_api_endpoint(),
            rpc_endpoint: default_rpc_endpoint(),
            chain_id: default_chain_id(),
            denom: default_denom(),
            gas_price: default_gas_price(),
            gas_base: default_gas_base(),
            timeout_seconds: default_connection_timeout(),
            plan_id: String::new(),
            provider_address: String::new(),
        }
    }
}

impl NetworkConfig {
    /// Gas price string as the gateway expects it, e.g. `0.1udvpn`
    pub fn gas_prices(&self) -> String {
        format!("{}{}", self.gas_price, self.denom)
    }

    /// Gas limit for a batch operation over `items` entries
    pub fn batch_gas(&self, items: usize) -> u64 {
        self.gas_base.saturating_mul(items as u64 + 1)
    }
}

fn default_api_endpoint() -> String {
    "http://127.0.0.1:3000".to_string()
}

fn default_rpc_endpoint() -> String {
    "https://rpc.sentinel.co:443".to_string()
}

fn default_chain_id() -> String {
    "sentinelhub-2".to_string()
}

fn default_denom() -> String {
    "udvpn".to_string()
}

fn default_gas_price() -> String {
    "0.1".to_string()
}

fn default_gas_base() -> u64 {
    200_000
}

fn default_connection_timeout() -> u64 {
    30
}

/// Mnemonics used to sign each kind of ledger transaction.
///
/// Every role acts on behalf of the provider through an authz grant, so the
/// wallets only need to hold the grant, not funds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WalletsConfig {
    /// Signs node subscriptions
    #[serde(default)]
    pub node_subscriber_mnemonic: String,
    /// Signs plan admissions
    #[serde(default)]
    pub node_linker_mnemonic: String,
    /// Signs plan evictions
    #[serde(default)]
    pub node_remover_mnemonic: String,
    /// Signs fee grants
    #[serde(default)]
    pub fee_granter_mnemonic: String,
    /// Signs wallet enrollment into the plan subscription
    #[serde(default)]
    pub main_subscriber_mnemonic: String,
    /// Signs plan subscription renewal
    #[serde(default)]
    pub subscription_updater_mnemonic: String,
}

/// Catalog and subscription policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Hourly price ceiling for plan admission (in `network.denom`)
    #[serde(default = "default_max_price_per_hour")]
    pub max_price_per_hour: i64,

    /// Lifetime of a node subscription in hours
    #[serde(default = "default_node_subscription_hours")]
    pub node_subscription_hours: i64,

    /// A plan subscription expiring sooner than this is renewed
    #[serde(default = "default_plan_renewal_lead_hours")]
    pub plan_renewal_lead_hours: i64,

    /// Maximum entities handled per convergence tick
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Byte allowance granted to every enrolled wallet
    #[serde(default = "default_enrollment_bytes")]
    pub enrollment_bytes: i64,

    /// Servers at or above this load are not picked for city connects
    #[serde(default = "default_max_server_load")]
    pub max_server_load: f64,

    /// JSON file with `{name, code}` country records used to seed the store
    #[serde(default)]
    pub countries_file: Option<PathBuf>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            max_price_per_hour: default_max_price_per_hour(),
            node_subscription_hours: default_node_subscription_hours(),
            plan_renewal_lead_hours: default_plan_renewal_lead_hours(),
            batch_size: default_batch_size(),
            enrollment_bytes: default_enrollment_bytes(),
            max_server_load: default_max_server_load(),
            countries_file: None,
        }
    }
}

fn default_max_price_per_hour() -> i64 {
    100
}

fn default_node_subscription_hours() -> i64 {
    720 // 30 days
}

fn default_plan_renewal_lead_hours() -> i64 {
    24
}

fn default_batch_size() -> u32 {
    10
}

fn default_enrollment_bytes() -> i64 {
    100_000_000_000_000
}

fn default_max_server_load() -> f64 {
    0.9
}

/// Reconciliation job intervals
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Run the reconciliation jobs at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Node catalog sync interval
    #[serde(default = "default_node_sync_interval")]
    pub node_sync_interval_secs: u64,

    /// Fee grant convergence interval
    #[serde(default = "default_short_interval")]
    pub fee_grant_interval_secs: u64,

    /// Enrollment convergence interval
    #[serde(default = "default_short_interval")]
    pub enrollment_interval_secs: u64,

    /// Plan admission/eviction interval
    #[serde(default = "default_plan_interval")]
    pub plan_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            node_sync_interval_secs: default_node_sync_interval(),
            fee_grant_interval_secs: default_short_interval(),
            enrollment_interval_secs: default_short_interval(),
            plan_interval_secs: default_plan_interval(),
        }
    }
}

fn default_node_sync_interval() -> u64 {
    3600
}

fn default_short_interval() -> u64 {
    1
}

fn default_plan_interval() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

/// API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Address to bind the API server to
    #[serde(default = "default_api_bind")]
    pub bind_address: String,

    /// Enable CORS
    #[serde(default = "default_true")]
    pub enable_cors: bool,

    /// Include the human-readable reason in error responses.
    /// Disable in production.
    #[serde(default = "default_true")]
    pub expose_error_reasons: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: default_api_bind(),
            enable_cors: true,
            expose_error_reasons: true,
        }
    }
}

fn default_api_bind() -> String {
    "127.0.0.1:8080".to_string()
}

/// Oldest client versions the backend still supports. Empty means unset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppVersionsConfig {
    /// Oldest supported API version
    #[serde(default)]
    pub min_api_version: String,

    /// Oldest supported Android app version
    #[serde(default)]
    pub min_android_version: String,

    /// Oldest supported iOS app version
    #[serde(default)]
    pub min_ios_version: String,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database URL or path
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Directory relative database paths are resolved against
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_database_url() -> String {
    "sqlite:dvpn.db".to_string()
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("dvpn"))
        .unwrap_or_else(|| PathBuf::from("./data"))
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Config {
    /// Resolve the database URL, making it relative to data_dir if needed
    pub fn resolve_database_url(&self) -> String {
        let url = &self.database.url;

        if url.starts_with("sqlite:/") || url == "sqlite::memory:" {
            return url.clone();
        }

        let path = url.strip_prefix("sqlite:").unwrap_or(url);

        if std::path::Path::new(path).is_absolute() {
            return url.clone();
        }

        let db_path = self.database.data_dir.join(path);
        format!("sqlite:{}", db_path.display())
    }

    /// Get the API bind address
    pub fn api_bind_address(&self) -> String {
        self.api.bind_address.clone()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.network.api_endpoint.is_empty() {
            return Err("network.api_endpoint must be set".to_string());
        }

        if self.network.denom.is_empty() {
            return Err("network.denom must be set".to_string());
        }

        if self.network.gas_price.parse::<f64>().is_err() {
            return Err(format!(
                "network.gas_price is not a number: {}",
                self.network.gas_price
            ));
        }

        if self.network.gas_base == 0 {
            return Err("network.gas_base cannot be 0".to_string());
        }

        if self.catalog.batch_size == 0 {
            return Err("catalog.batch_size cannot be 0".to_string());
        }

        if self.catalog.node_subscription_hours <= 0 {
            return Err("catalog.node_subscription_hours must be positive".to_string());
        }

        if !(0.0..=1.0).contains(&self.catalog.max_server_load) {
            return Err("catalog.max_server_load must be within [0, 1]".to_string());
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(format!(
                "Invalid log format: {}. Must be one of: {:?}",
                self.logging.format, valid_formats
            ));
        }

        Ok(())
    }
}
