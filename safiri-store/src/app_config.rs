use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub business_rules: BusinessRules,
    pub payments: PaymentsConfig,
    pub tickets: TicketsConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    pub redis: Option<RedisConfig>,
    pub database: Option<DatabaseConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Base of the QR verification links printed on tickets.
    pub public_base_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BusinessRules {
    #[serde(default = "default_hold_seconds")]
    pub seat_hold_seconds: u64,
    #[serde(default = "default_hold_seconds")]
    pub booking_hold_seconds: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
    #[serde(default = "default_payment_timeout")]
    pub payment_timeout_seconds: u64,
    #[serde(default = "default_ticket_validity")]
    pub ticket_validity_hours: i64,
}

fn default_hold_seconds() -> u64 { 900 }
fn default_sweep_interval() -> u64 { 30 }
fn default_payment_timeout() -> u64 { 30 }
fn default_ticket_validity() -> i64 { 72 }

impl Default for BusinessRules {
    fn default() -> Self {
        Self {
            seat_hold_seconds: default_hold_seconds(),
            booking_hold_seconds: default_hold_seconds(),
            sweep_interval_seconds: default_sweep_interval(),
            payment_timeout_seconds: default_payment_timeout(),
            ticket_validity_hours: default_ticket_validity(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PaymentsConfig {
    pub currency: String,
    /// Charge endpoint of the payment gateway. Unset means the mock gateway.
    pub gateway_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TicketsConfig {
    pub signing_secret: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CatalogConfig {
    pub seed_path: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    pub url: String,
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            // Per-environment overrides, optional
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // Not checked in
            .add_source(config::File::with_name("config/local").required(false))
            // SAFIRI__SERVER__PORT=9000 sets server.port
            .add_source(config::Environment::with_prefix("SAFIRI").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}
