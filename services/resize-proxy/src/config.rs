use crate::transcoder::ResizeFilter;
use reqwest::Url;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while validating a loaded configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Main configuration for the resize proxy
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Public listener configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Upstream origin configuration
    pub origin: OriginConfig,
    /// S3 configuration for variant write-back
    #[serde(default)]
    pub s3: S3Config,
    /// Write-back worker pool configuration
    #[serde(default)]
    pub write_back: WriteBackConfig,
    /// Resize configuration
    #[serde(default)]
    pub resize: ResizeConfig,
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
    /// Metrics port, 0 disables the exporter
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Listener configuration for the proxy
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// Listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Largest inbound request body forwarded to the origin
    #[serde(default = "default_max_request_body")]
    pub max_request_body_bytes: usize,
    /// How long shutdown waits for pending write-backs
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

/// Origin (upstream object store) configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OriginConfig {
    /// Base URL every inbound path is resolved against
    pub url: String,
    /// Per-fetch timeout in seconds
    #[serde(default = "default_origin_timeout_secs")]
    pub timeout_secs: u64,
    /// Largest origin response body accepted
    #[serde(default = "default_max_origin_body")]
    pub max_body_bytes: u64,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// Bucket receiving written-back variants
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default = "default_true")]
    pub force_path_style: bool,
    /// Static access key, falls back to the default credential chain when unset
    pub access_key_id: Option<String>,
    /// Static secret key
    pub secret_access_key: Option<String>,
    /// Prefix stripped from request paths to build object keys.
    /// Defaults to `/<bucket>/`.
    pub key_prefix: Option<String>,
    /// Multipart upload threshold in bytes (5MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes (5MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

/// Write-back worker pool configuration
#[derive(Debug, Clone, Deserialize)]
pub struct WriteBackConfig {
    /// Persist generated variants to the store
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Maximum concurrent uploads
    #[serde(default = "default_write_back_concurrency")]
    pub concurrency: usize,
    /// Jobs buffered before new ones are dropped
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

/// Resize behaviour
#[derive(Debug, Clone, Deserialize)]
pub struct ResizeConfig {
    /// Sampling filter name
    #[serde(default = "default_filter")]
    pub filter: String,
}

// Default value functions
fn default_service_name() -> String {
    "resize-proxy".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_max_request_body() -> usize {
    10 * 1024 * 1024 // 10MB
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

fn default_origin_timeout_secs() -> u64 {
    30
}

fn default_max_origin_body() -> u64 {
    100 * 1024 * 1024 // 100MB
}

fn default_bucket() -> String {
    "images".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_multipart_threshold() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_part_size() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_write_back_concurrency() -> usize {
    10
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_filter() -> String {
    "triangle".to_string()
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        // Legacy deployments point both the proxy and the uploader at S3_ADDR
        let legacy_addr = std::env::var("S3_ADDR").ok();

        let config = config::Config::builder()
            .set_default("service.name", "resize-proxy")?
            .set_default("service.log_level", "info")?
            .set_default("s3.bucket", "images")?
            .add_source(config::File::with_name("config/resize-proxy").required(false))
            .add_source(config::File::with_name("/etc/resize-proxy/config").required(false))
            // RESIZE_PROXY__ORIGIN__URL -> origin.url
            .add_source(
                config::Environment::with_prefix("RESIZE_PROXY")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("origin.url", legacy_addr.clone())?
            .set_override_option("s3.endpoint_url", legacy_addr)?
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would leave the proxy unable to serve
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.origin_url()?;
        self.resize_filter()?;

        if self.write_back.concurrency == 0 {
            return Err(invalid("write_back.concurrency", "must be at least 1"));
        }
        if self.write_back.queue_capacity == 0 {
            return Err(invalid("write_back.queue_capacity", "must be at least 1"));
        }
        if self.s3.part_size_bytes == 0 {
            return Err(invalid("s3.part_size_bytes", "must be at least 1"));
        }

        Ok(())
    }

    /// Parsed origin base URL
    pub fn origin_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.origin.url).map_err(|e| invalid("origin.url", &e.to_string()))
    }

    /// Parsed resize filter
    pub fn resize_filter(&self) -> Result<ResizeFilter, ConfigError> {
        self.resize
            .filter
            .parse()
            .map_err(|e: String| invalid("resize.filter", &e))
    }

    /// Get write-back drain timeout as Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.api.shutdown_timeout_secs)
    }
}

impl OriginConfig {
    /// Get origin fetch timeout as Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl S3Config {
    /// Prefix removed from request paths before they become object keys.
    ///
    /// Request paths arrive already resolved against the origin base URL, so
    /// the default is the base path followed by `/<bucket>/`.
    pub fn effective_key_prefix(&self, origin_base: &Url) -> String {
        self.key_prefix.clone().unwrap_or_else(|| {
            format!(
                "{}/{}/",
                origin_base.path().trim_end_matches('/'),
                self.bucket
            )
        })
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            max_request_body_bytes: default_max_request_body(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl Default for WriteBackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            concurrency: default_write_back_concurrency(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for ResizeConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
        }
    }
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: default_bucket(),
            region: default_region(),
            endpoint_url: None,
            force_path_style: true,
            access_key_id: None,
            secret_access_key: None,
            key_prefix: None,
            multipart_threshold_bytes: default_multipart_threshold(),
            part_size_bytes: default_part_size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            service: ServiceConfig::default(),
            api: ApiConfig::default(),
            origin: OriginConfig {
                url: "http://minio:9000".to_string(),
                timeout_secs: 5,
                max_body_bytes: 1024,
            },
            s3: S3Config::default(),
            write_back: WriteBackConfig::default(),
            resize: ResizeConfig::default(),
        }
    }

    #[test]
    fn test_default_values() {
        assert_eq!(default_api_port(), 8080);
        assert_eq!(default_bucket(), "images");
        assert_eq!(default_write_back_concurrency(), 10);
        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn test_key_prefix_defaults_to_bucket() {
        let origin = Url::parse("http://minio:9000").unwrap();
        let mut s3 = S3Config::default();
        assert_eq!(s3.effective_key_prefix(&origin), "/images/");

        s3.key_prefix = Some("/cdn/".to_string());
        assert_eq!(s3.effective_key_prefix(&origin), "/cdn/");
    }

    #[test]
    fn test_key_prefix_follows_origin_base_path() {
        let s3 = S3Config::default();
        for base in ["http://minio:9000/store", "http://minio:9000/store/"] {
            let origin = Url::parse(base).unwrap();
            assert_eq!(s3.effective_key_prefix(&origin), "/store/images/", "{base}");
        }
    }

    #[test]
    fn test_origin_timeout() {
        assert_eq!(test_config().origin.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_validate_rejects_bad_origin() {
        let mut config = test_config();
        config.origin.url = "not a url".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref key, .. }) if key == "origin.url"
        ));
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let mut config = test_config();
        config.write_back.concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_filter() {
        let mut config = test_config();
        config.resize.filter = "bicubic-ish".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_from_sources() {
        let raw = config::Config::builder()
            .set_override("origin.url", "http://localhost:9000")
            .unwrap()
            .set_override("write_back.concurrency", 4)
            .unwrap()
            .build()
            .unwrap();

        let config: Config = raw.try_deserialize().unwrap();
        assert_eq!(config.write_back.concurrency, 4);
        assert_eq!(config.s3.bucket, "images");
        assert!(config.s3.force_path_style);
        assert_eq!(config.api.port, 8080);
    }
}
