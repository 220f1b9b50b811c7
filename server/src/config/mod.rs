use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use thiserror::Error;

pub mod cors;
pub mod security;

pub use cors::create_cors_layer;
pub use security::create_security_headers_layer;

const DEFAULT_ALLOWED_ORIGINS: &str = "http://localhost:3000,http://localhost:5173";
const DEFAULT_SMS_BASE_URL: &str = "https://api.africastalking.com/version1";
const DEFAULT_TICKET_BASE_URL: &str = "https://rada.to/ticket";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{key} has invalid value '{value}'")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpesaEnvironment {
    Sandbox,
    Production,
}

impl MpesaEnvironment {
    pub fn base_url(&self) -> &'static str {
        match self {
            MpesaEnvironment::Sandbox => "https://sandbox.safaricom.co.ke",
            MpesaEnvironment::Production => "https://api.safaricom.co.ke",
        }
    }
}

impl FromStr for MpesaEnvironment {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "sandbox" => Ok(MpesaEnvironment::Sandbox),
            "production" => Ok(MpesaEnvironment::Production),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MpesaConfig {
    pub consumer_key: String,
    pub consumer_secret: String,
    pub passkey: String,
    pub shortcode: String,
    pub callback_url: String,
    pub base_url: String,
}

#[derive(Debug, Clone)]
pub struct SmsConfig {
    pub api_key: String,
    pub username: String,
    pub sender_id: Option<String>,
    pub base_url: String,
}

/// Knobs of the reservation and reconciliation engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// PENDING batches older than this are expired by the sweep.
    pub reservation_expiry: Duration,
    pub sweep_interval: Duration,
    pub notification_interval: Duration,
    pub notification_max_attempts: i32,
    pub max_tickets_per_purchase: i32,
    pub superfan_threshold: Decimal,
    pub ticket_base_url: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reservation_expiry: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(60),
            notification_interval: Duration::from_secs(15),
            notification_max_attempts: 5,
            max_tickets_per_purchase: 10,
            superfan_threshold: Decimal::from(5000),
            ticket_base_url: DEFAULT_TICKET_BASE_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    pub bind_addr: SocketAddr,
    /// Enables HSTS.
    pub production: bool,
    pub cors_allowed_origins: Vec<String>,
    pub mpesa: MpesaConfig,
    pub sms: SmsConfig,
    pub engine: EngineConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_map(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::from_lookup(|key| vars.get(key).cloned())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);
        let defaults = EngineConfig::default();

        let mpesa_environment = vars.parsed_or("MPESA_ENVIRONMENT", MpesaEnvironment::Sandbox)?;

        Ok(Self {
            database_url: vars.required("DATABASE_URL")?,
            database_max_connections: vars.parsed_or("DATABASE_MAX_CONNECTIONS", 5)?,
            bind_addr: vars.parsed_or("BIND_ADDR", default_bind_addr())?,
            production: vars
                .optional("RUST_ENV")
                .map(|v| v.eq_ignore_ascii_case("production"))
                .unwrap_or(false),
            cors_allowed_origins: vars
                .optional("CORS_ALLOWED_ORIGINS")
                .unwrap_or_else(|| DEFAULT_ALLOWED_ORIGINS.to_string())
                .split(',')
                .map(|origin| origin.trim().to_string())
                .filter(|origin| !origin.is_empty())
                .collect(),
            mpesa: MpesaConfig {
                consumer_key: vars.required("MPESA_CONSUMER_KEY")?,
                consumer_secret: vars.required("MPESA_CONSUMER_SECRET")?,
                passkey: vars.required("MPESA_PASSKEY")?,
                shortcode: vars.required("MPESA_SHORTCODE")?,
                callback_url: vars.required("MPESA_CALLBACK_URL")?,
                base_url: mpesa_environment.base_url().to_string(),
            },
            sms: SmsConfig {
                api_key: vars.required("AFRICAS_TALKING_API_KEY")?,
                username: vars.required("AFRICAS_TALKING_USERNAME")?,
                sender_id: vars.optional("AFRICAS_TALKING_SENDER_ID"),
                base_url: DEFAULT_SMS_BASE_URL.to_string(),
            },
            engine: EngineConfig {
                reservation_expiry: Duration::from_secs(vars.parsed_or(
                    "RESERVATION_EXPIRY_SECS",
                    defaults.reservation_expiry.as_secs(),
                )?),
                sweep_interval: Duration::from_secs(
                    vars.parsed_or("SWEEP_INTERVAL_SECS", defaults.sweep_interval.as_secs())?,
                ),
                notification_interval: Duration::from_secs(vars.parsed_or(
                    "NOTIFICATION_INTERVAL_SECS",
                    defaults.notification_interval.as_secs(),
                )?),
                notification_max_attempts: vars
                    .parsed_or("NOTIFICATION_MAX_ATTEMPTS", defaults.notification_max_attempts)?,
                max_tickets_per_purchase: vars
                    .parsed_or("MAX_TICKETS_PER_PURCHASE", defaults.max_tickets_per_purchase)?,
                superfan_threshold: vars
                    .parsed_or("SUPERFAN_THRESHOLD", defaults.superfan_threshold)?,
                ticket_base_url: vars
                    .optional("TICKET_BASE_URL")
                    .unwrap_or(defaults.ticket_base_url),
            },
        })
    }
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 3001))
}

struct Vars<F>(F);

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|value| !value.trim().is_empty())
    }

    fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        self.optional(key).ok_or(ConfigError::Missing(key))
    }

    fn parsed_or<T: FromStr>(&self, key: &'static str, default: T) -> Result<T, ConfigError> {
        match self.optional(key) {
            None => Ok(default),
            Some(value) => value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid { key, value }),
        }
    }
}
