use std::env;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Distinguishes runtime behavior for different stages of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnvironment {
    Development,
    Test,
    Production,
}

impl AppEnvironment {
    fn from_str(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Self::Production,
            "test" | "ci" => Self::Test,
            _ => Self::Development,
        }
    }
}

/// Top-level configuration for the marketplace service.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: AppEnvironment,
    pub server: ServerConfig,
    pub telemetry: TelemetryConfig,
    pub payments: PaymentConfig,
    pub store: StoreConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let environment = AppEnvironment::from_str(
            &env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
        );

        let host = env::var("APP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("APP_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort)?;

        let log_level = env::var("APP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let defaults = PaymentConfig::default();
        let currency = env::var("PAYMENT_CURRENCY").unwrap_or(defaults.currency);
        let return_url = env::var("PAYMENT_RETURN_URL").unwrap_or(defaults.return_url);
        let platform_fee_bps = match env::var("PAYMENT_PLATFORM_FEE_BPS") {
            Ok(raw) => raw
                .trim()
                .parse::<u32>()
                .ok()
                .filter(|bps| *bps <= 10_000)
                .ok_or(ConfigError::InvalidPlatformFee)?,
            Err(_) => defaults.platform_fee_bps,
        };

        let lock_timeout = match env::var("STORE_LOCK_TIMEOUT_MS") {
            Ok(raw) => raw
                .trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| ConfigError::InvalidLockTimeout)?,
            Err(_) => StoreConfig::default().lock_timeout,
        };

        Ok(Self {
            environment,
            server: ServerConfig { host, port },
            telemetry: TelemetryConfig { log_level },
            payments: PaymentConfig {
                currency,
                return_url,
                platform_fee_bps,
            },
            store: StoreConfig { lock_timeout },
        })
    }
}

/// Settings controlling the HTTP server binding.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        if self.host.eq_ignore_ascii_case("localhost") {
            return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), self.port));
        }

        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|source| ConfigError::InvalidHost { source })?;

        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Tracing and metrics controls.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
}

/// Charges and payouts made through the external payment processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentConfig {
    pub currency: String,
    /// Where the processor sends the payer after an interactive authorization step.
    pub return_url: String,
    /// Platform commission withheld from payouts, in basis points.
    pub platform_fee_bps: u32,
}

impl PaymentConfig {
    /// Amount released to the listing owner once the platform fee is withheld.
    pub fn payout_amount(&self, price_cents: u64) -> u64 {
        let fee = price_cents.saturating_mul(u64::from(self.platform_fee_bps)) / 10_000;
        price_cents - fee
    }
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            currency: "eur".to_string(),
            return_url: "http://localhost:8080/payment/return".to_string(),
            platform_fee_bps: 750,
        }
    }
}

/// Transactional store tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreConfig {
    pub lock_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_millis(5_000),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidHost { source: std::net::AddrParseError },
    InvalidPlatformFee,
    InvalidLockTimeout,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "APP_PORT must be a valid u16"),
            ConfigError::InvalidHost { .. } => {
                write!(f, "APP_HOST must parse to an IPv4 or IPv6 address")
            }
            ConfigError::InvalidPlatformFee => write!(
                f,
                "PAYMENT_PLATFORM_FEE_BPS must be an integer between 0 and 10000"
            ),
            ConfigError::InvalidLockTimeout => {
                write!(f, "STORE_LOCK_TIMEOUT_MS must be a whole number of milliseconds")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::InvalidHost { source } => Some(source),
            ConfigError::InvalidPort
            | ConfigError::InvalidPlatformFee
            | ConfigError::InvalidLockTimeout => None,
        }
    }
}
