use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the compression service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    pub service: ServiceConfig,
    /// HTTP API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Vision model configuration
    pub detector: DetectorConfig,
    /// Asset host configuration
    pub asset_store: AssetStoreConfig,
    /// Database configuration
    pub database: DatabaseConfig,
}

/// Deployment environment, selected by `APP_ENVIRONMENT`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    /// Read the environment from `APP_ENVIRONMENT` (defaults to development)
    pub fn from_env() -> Self {
        match std::env::var("APP_ENVIRONMENT") {
            Ok(value) => Self::parse(&value),
            Err(_) => Self::Development,
        }
    }

    fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("production") {
            Self::Production
        } else {
            Self::Development
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Deployment environment
    #[serde(default = "default_environment")]
    pub environment: Environment,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Maximum request body size in bytes
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
    /// Maximum size of the uploaded image file in bytes
    #[serde(default = "default_max_upload")]
    pub max_upload_bytes: usize,
    /// Rate limiting
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

/// Sliding-window rate limit settings
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum requests per client within the window
    #[serde(default = "default_rate_limit_max")]
    pub max_requests: usize,
    /// Window length in seconds
    #[serde(default = "default_rate_limit_window_secs")]
    pub window_secs: u64,
    /// Apply the limit outside production as well
    #[serde(default)]
    pub always_enabled: bool,
}

/// Vision model configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    /// API key for the generative language API
    pub api_key: String,
    /// Model name
    #[serde(default = "default_detector_model")]
    pub model: String,
    /// Base URL of the generative language API
    #[serde(default = "default_detector_base_url")]
    pub base_url: String,
    /// Request timeout in seconds
    #[serde(default = "default_detector_timeout_secs")]
    pub timeout_secs: u64,
}

/// Which asset host receives uploaded bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetProvider {
    Cloudinary,
    S3,
}

/// Asset host configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AssetStoreConfig {
    /// Active provider
    #[serde(default = "default_asset_provider")]
    pub provider: AssetProvider,
    /// Logical folder for uploaded assets
    #[serde(default = "default_asset_folder")]
    pub folder: String,
    /// Request timeout in seconds
    #[serde(default = "default_asset_timeout_secs")]
    pub timeout_secs: u64,
    /// Cloudinary credentials
    pub cloudinary: Option<CloudinaryConfig>,
    /// S3 bucket settings
    pub s3: Option<S3Config>,
}

/// Cloudinary upload API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CloudinaryConfig {
    pub cloud_name: String,
    pub api_key: String,
    pub api_secret: String,
    /// Upload API base URL
    #[serde(default = "default_cloudinary_base_url")]
    pub base_url: String,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// S3 bucket name for asset storage
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Public base URL used to build asset URLs (CDN in front of the bucket)
    pub public_base_url: Option<String>,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Connection attempts at startup before giving up
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    /// Delay between startup connection attempts in seconds
    #[serde(default = "default_connect_retry_delay_secs")]
    pub connect_retry_delay_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

// Default value functions
fn default_service_name() -> String {
    "compression-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_environment() -> Environment {
    Environment::Development
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    3000
}

fn default_body_limit() -> usize {
    50 * 1024 * 1024 // 50MB
}

fn default_max_upload() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_rate_limit_max() -> usize {
    100
}

fn default_rate_limit_window_secs() -> u64 {
    15 * 60
}

fn default_detector_model() -> String {
    "gemini-1.5-flash".to_string()
}

fn default_detector_base_url() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}

fn default_detector_timeout_secs() -> u64 {
    60
}

fn default_asset_provider() -> AssetProvider {
    AssetProvider::Cloudinary
}

fn default_asset_folder() -> String {
    "ai-compression".to_string()
}

fn default_asset_timeout_secs() -> u64 {
    60
}

fn default_cloudinary_base_url() -> String {
    "https://api.cloudinary.com".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_connect_attempts() -> u32 {
    5
}

fn default_connect_retry_delay_secs() -> u64 {
    5
}

fn default_run_migrations() -> bool {
    true
}

impl Config {
    /// Load configuration from config files and environment
    ///
    /// Files are picked by `APP_ENVIRONMENT`: `config/default` first, then
    /// `config/{environment}` on top of it.
    pub fn load() -> anyhow::Result<Self> {
        let environment = Environment::from_env();

        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", default_service_name())?
            .set_default("service.log_level", default_log_level())?
            .set_default("service.environment", environment.as_str())?
            .set_default("service.metrics_port", i64::from(default_metrics_port()))?
            // Add config files if present
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(
                config::File::with_name(&format!("config/{}", environment.as_str()))
                    .required(false),
            )
            // Override with environment variables
            // COMPRESSION__DATABASE__URL -> database.url
            .add_source(
                config::Environment::with_prefix("COMPRESSION")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the service cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api.rate_limit.window_secs == 0 {
            anyhow::bail!("api.rate_limit.window_secs must be greater than zero");
        }
        if self.api.rate_limit.max_requests == 0 {
            anyhow::bail!("api.rate_limit.max_requests must be greater than zero");
        }
        Ok(())
    }

    pub fn is_production(&self) -> bool {
        self.service.environment.is_production()
    }

    /// Get rate limit window as Duration
    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.api.rate_limit.window_secs)
    }

    /// Whether the rate limiter should be installed
    pub fn rate_limit_enabled(&self) -> bool {
        self.is_production() || self.api.rate_limit.always_enabled
    }
}

impl DatabaseConfig {
    /// Get connection acquire timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Get delay between startup connection attempts as Duration
    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_secs(self.connect_retry_delay_secs)
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            body_limit_bytes: default_body_limit(),
            max_upload_bytes: default_max_upload(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: default_rate_limit_max(),
            window_secs: default_rate_limit_window_secs(),
            always_enabled: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        assert_eq!(default_rate_limit_max(), 100);
        assert_eq!(default_rate_limit_window_secs(), 900);
        assert_eq!(default_max_upload(), 5 * 1024 * 1024);
        assert_eq!(default_body_limit(), 50 * 1024 * 1024);
        assert_eq!(default_asset_folder(), "ai-compression");
    }

    #[test]
    fn test_environment_parse() {
        assert_eq!(Environment::parse("production"), Environment::Production);
        assert_eq!(Environment::parse(" PRODUCTION "), Environment::Production);
        assert_eq!(Environment::parse("staging"), Environment::Development);
        assert_eq!(Environment::parse(""), Environment::Development);
        assert!(Environment::Production.is_production());
        assert!(!Environment::Development.is_production());
    }

    #[test]
    fn test_deserialize_minimal_config() {
        let config: Config = config::Config::builder()
            .set_default("service.environment", "production")
            .unwrap()
            .set_default("detector.api_key", "key")
            .unwrap()
            .set_default("asset_store.provider", "s3")
            .unwrap()
            .set_default("asset_store.s3.bucket", "assets")
            .unwrap()
            .set_default("database.url", "postgres://localhost/images")
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert!(config.is_production());
        assert!(config.rate_limit_enabled());
        assert_eq!(config.api.port, 3000);
        assert_eq!(config.asset_store.provider, AssetProvider::S3);
        assert_eq!(config.asset_store.folder, "ai-compression");
        assert_eq!(config.database.connect_attempts, 5);
        assert_eq!(config.database.connect_retry_delay(), Duration::from_secs(5));
        assert_eq!(config.detector.model, "gemini-1.5-flash");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_rate_limit_window_rejected() {
        let mut config: Config = config::Config::builder()
            .set_default("service.environment", "development")
            .unwrap()
            .set_default("detector.api_key", "key")
            .unwrap()
            .set_default("asset_store.provider", "s3")
            .unwrap()
            .set_default("database.url", "postgres://localhost/images")
            .unwrap()
            .set_default("api.rate_limit.window_secs", 0i64)
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("window_secs"));

        config.api.rate_limit.window_secs = 60;
        config.api.rate_limit.max_requests = 0;
        assert!(config.validate().is_err());
    }
}
