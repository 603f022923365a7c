use std::fmt;
use std::path::Path;

use chrono::NaiveDate;
use serde::Deserialize;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Service-level configuration (serving layer, upstream endpoints, storage).
///
/// Loaded from `config.yaml`; credentials come from the environment
/// (`HSP_EMAIL`/`HSP_PASSWORD`) and are never stored in the file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub hsp: HspConfig,
    #[serde(default)]
    pub fares: FaresConfig,
    /// Allowed CORS origins. Empty means permissive (development).
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Log warnings for settings that are valid but probably unintended.
    pub fn validate(&self) {
        if self.cors_origins.is_empty() {
            warn!("CORS: no origins configured, allowing all origins (development only)");
        }
        if !self.hsp.base_url.starts_with("https://") {
            warn!(url = %self.hsp.base_url, "HSP base URL does not use HTTPS");
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            hsp: HspConfig::default(),
            fares: FaresConfig::default(),
            cors_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "ServerConfig::default_port")]
    pub port: u16,
    #[serde(default = "ServerConfig::default_database_path")]
    pub database_path: String,
    /// Token required by POST /api/reset-rate-limit. Unset disables the endpoint.
    #[serde(default)]
    pub admin_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: Self::default_port(),
            database_path: Self::default_database_path(),
            admin_token: None,
        }
    }
}

impl ServerConfig {
    fn default_port() -> u16 {
        3000
    }
    fn default_database_path() -> String {
        "data/railfair.db".to_string()
    }

    /// Port override from the environment wins over the config file.
    pub fn effective_port(&self) -> u16 {
        std::env::var("RAILFAIR_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(self.port)
    }

    /// Database path override from the environment wins over the config file.
    pub fn effective_database_path(&self) -> String {
        std::env::var("RAILFAIR_DB_PATH").unwrap_or_else(|_| self.database_path.clone())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HspConfig {
    #[serde(default = "HspConfig::default_base_url")]
    pub base_url: String,
    /// Upstream request timeout in seconds.
    #[serde(default = "HspConfig::default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for HspConfig {
    fn default() -> Self {
        Self {
            base_url: Self::default_base_url(),
            timeout_secs: Self::default_timeout_secs(),
        }
    }
}

impl HspConfig {
    fn default_base_url() -> String {
        "https://hsp-prod.rockshore.net/api/v1".to_string()
    }
    fn default_timeout_secs() -> u64 {
        30
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FaresConfig {
    #[serde(default = "FaresConfig::default_feed_url")]
    pub feed_url: String,
    #[serde(default = "FaresConfig::default_auth_url")]
    pub auth_url: String,
    /// Directory the fare archive is cached in between refreshes.
    #[serde(default = "FaresConfig::default_cache_dir")]
    pub cache_dir: String,
    /// Re-download the archive once the local copy is older than this.
    #[serde(default = "FaresConfig::default_refresh_hours")]
    pub refresh_hours: u64,
}

impl Default for FaresConfig {
    fn default() -> Self {
        Self {
            feed_url: Self::default_feed_url(),
            auth_url: Self::default_auth_url(),
            cache_dir: Self::default_cache_dir(),
            refresh_hours: Self::default_refresh_hours(),
        }
    }
}

impl FaresConfig {
    fn default_feed_url() -> String {
        "https://opendata.nationalrail.co.uk/api/staticfeeds/2.0/fares".to_string()
    }
    fn default_auth_url() -> String {
        "https://opendata.nationalrail.co.uk/authenticate".to_string()
    }
    fn default_cache_dir() -> String {
        "data/fares".to_string()
    }
    fn default_refresh_hours() -> u64 {
        24
    }
}

/// Upstream credentials, read from the environment at startup.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl Credentials {
    pub fn from_env() -> Result<Self, ConfigError> {
        let email = std::env::var("HSP_EMAIL")
            .or_else(|_| std::env::var("HSP_USERNAME"))
            .map_err(|_| ConfigError::Invalid("HSP_EMAIL or HSP_USERNAME must be set".into()))?;
        let password = std::env::var("HSP_PASSWORD")
            .map_err(|_| ConfigError::Invalid("HSP_PASSWORD must be set".into()))?;
        Ok(Self { email, password })
    }
}

/// Day-type partition of the HSP query space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DayType {
    Weekday,
    Saturday,
    Sunday,
}

impl fmt::Display for DayType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DayType::Weekday => "WEEKDAY",
            DayType::Saturday => "SATURDAY",
            DayType::Sunday => "SUNDAY",
        };
        f.write_str(s)
    }
}

/// One (origin, destination) pair with its query time window.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
    pub origin: String,
    pub destination: String,
    #[serde(default = "RouteConfig::default_from_time")]
    pub from_time: String,
    #[serde(default = "RouteConfig::default_to_time")]
    pub to_time: String,
}

impl RouteConfig {
    fn default_from_time() -> String {
        "0000".to_string()
    }
    fn default_to_time() -> String {
        "2359".to_string()
    }
}

/// Inter-request pacing window, seconds. A fresh uniform draw from
/// [min, max] separates any two upstream requests.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RequestInterval {
    #[serde(default = "RequestInterval::default_min")]
    pub min: f64,
    #[serde(default = "RequestInterval::default_max")]
    pub max: f64,
}

impl Default for RequestInterval {
    fn default() -> Self {
        Self {
            min: Self::default_min(),
            max: Self::default_max(),
        }
    }
}

impl RequestInterval {
    fn default_min() -> f64 {
        3.0
    }
    fn default_max() -> f64 {
        5.0
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "RetryConfig::default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "RetryConfig::default_initial_delay")]
    pub initial_delay: f64,
    #[serde(default = "RetryConfig::default_max_delay")]
    pub max_delay: f64,
    #[serde(default = "RetryConfig::default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "RetryConfig::default_jitter")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: Self::default_max_attempts(),
            initial_delay: Self::default_initial_delay(),
            max_delay: Self::default_max_delay(),
            backoff_multiplier: Self::default_backoff_multiplier(),
            jitter: Self::default_jitter(),
        }
    }
}

impl RetryConfig {
    fn default_max_attempts() -> u32 {
        3
    }
    fn default_initial_delay() -> f64 {
        1.0
    }
    fn default_max_delay() -> f64 {
        30.0
    }
    fn default_backoff_multiplier() -> f64 {
        2.0
    }
    fn default_jitter() -> bool {
        true
    }
}

/// A batch-collection phase: which routes, which dates, how politely.
#[derive(Debug, Clone, Deserialize)]
pub struct PhaseConfig {
    pub phase_name: String,
    pub from_date: NaiveDate,
    pub to_date: NaiveDate,
    pub day_types: Vec<DayType>,
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub request_interval: RequestInterval,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "PhaseConfig::default_progress_dir")]
    pub progress_dir: String,
}

impl PhaseConfig {
    fn default_progress_dir() -> String {
        "data/progress".to_string()
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<(), ConfigError> {
        if self.from_date > self.to_date {
            return Err(ConfigError::Invalid(format!(
                "from_date {} is after to_date {}",
                self.from_date, self.to_date
            )));
        }
        if self.routes.is_empty() {
            return Err(ConfigError::Invalid("phase has no routes".into()));
        }
        if self.request_interval.min < 1.0 || self.request_interval.max < self.request_interval.min
        {
            return Err(ConfigError::Invalid(format!(
                "request_interval [{}, {}] must satisfy 1.0 <= min <= max",
                self.request_interval.min, self.request_interval.max
            )));
        }
        Ok(())
    }
}
