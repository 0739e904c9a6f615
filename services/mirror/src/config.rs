use regex::Regex;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Errors that can occur while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {}", .0.join(", "))]
    Invalid(Vec<String>),
}

/// Main configuration for the mirror service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// S3 configuration
    pub s3: S3Config,
    /// Local cache configuration
    #[serde(default)]
    pub cache: CacheConfig,
    /// Bucket synchronization configuration
    #[serde(default)]
    pub sync: SyncConfig,
    /// Names and patterns of the mirrored files
    #[serde(default)]
    pub files: FilesConfig,
    /// Image categories, first match wins
    #[serde(default)]
    pub image_types: Vec<ImageTypeConfig>,
    /// Bucket notification configuration
    #[serde(default)]
    pub notifications: NotificationsConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
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
    /// Log output format (json, text)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// Mirrored bucket
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Deadline for a single object fetch in seconds
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    /// Deadline for a full prefix listing in seconds
    #[serde(default = "default_list_timeout_secs")]
    pub list_timeout_secs: u64,
    /// Presigned URL expiration in seconds
    #[serde(default = "default_presigned_url_expiry_secs")]
    pub presigned_url_expiry_secs: u64,
}

/// Local cache configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Root directory of the on-disk cache
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
    /// Seconds after which an entry that was not refreshed is evicted
    #[serde(default)]
    pub retention_period_secs: u64,
    /// Maximum number of images returned to viewers
    #[serde(default = "default_max_images_display_count")]
    pub max_images_display_count: usize,
    /// Stop the service when the backend cannot be listed
    #[serde(default)]
    pub exit_on_backend_error: bool,
}

/// Bucket synchronization configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Periodic rescans instead of bucket notifications
    #[serde(default)]
    pub polling_mode: bool,
    /// Seconds between rescans
    #[serde(default = "default_polling_period_secs")]
    pub polling_period_secs: u64,
    /// Capacity of the domain event channel feeding the hub
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

/// Names and patterns of the files found next to images
#[derive(Debug, Clone, Deserialize)]
pub struct FilesConfig {
    /// File name of preview images
    #[serde(default = "default_preview_filename")]
    pub preview_filename: String,
    /// Geonames side-file name
    pub geonames_filename: Option<String>,
    /// Localization side-file name
    pub localization_filename: Option<String>,
    /// Pattern of feature-detection side-files
    pub features_regexp: Option<String>,
    /// Feature property holding the detected category
    #[serde(default = "default_features_category_name")]
    pub features_category_name: String,
    /// Feature property holding the detection class
    #[serde(default = "default_features_class_name")]
    pub features_class_name: String,
    /// Suffix of full-product files
    pub full_product_extension: Option<String>,
    /// Protocol prepended to full-product links
    #[serde(default)]
    pub full_product_protocol: String,
    /// Root URL presigned paths are appended to
    #[serde(default)]
    pub full_product_root_url: String,
    /// Link full products through presigned URLs
    #[serde(default)]
    pub full_product_signed_url: bool,
    /// Pattern of other product files fetched into the cache
    pub additional_product_files_regexp: Option<String>,
}

/// One image category
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ImageTypeConfig {
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    pub product_prefix: String,
    pub product_regexp: String,
}

/// Kafka topic receiving bucket event notifications
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationsConfig {
    /// Kafka bootstrap servers
    pub bootstrap_servers: Option<String>,
    /// Topic the bucket publishes its events to
    #[serde(default = "default_notifications_topic")]
    pub topic: String,
    /// Base consumer group ID
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    /// Auto offset reset policy
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u32,
}

/// API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Path prefix used in generated links
    #[serde(default)]
    pub base_path: String,
    /// Outbound queue size of each event subscriber
    #[serde(default = "default_subscriber_queue_capacity")]
    pub subscriber_queue_capacity: usize,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

// Default value functions
fn default_service_name() -> String {
    "mirror-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_fetch_timeout_secs() -> u64 {
    30
}

fn default_list_timeout_secs() -> u64 {
    120
}

fn default_presigned_url_expiry_secs() -> u64 {
    7 * 24 * 3600 // 7 days
}

fn default_cache_dir() -> PathBuf {
    std::env::temp_dir().join("image-mirror")
}

fn default_max_images_display_count() -> usize {
    100
}

fn default_polling_period_secs() -> u64 {
    10
}

fn default_event_channel_capacity() -> usize {
    64
}

fn default_preview_filename() -> String {
    "preview.jpg".to_string()
}

fn default_features_category_name() -> String {
    "category".to_string()
}

fn default_features_class_name() -> String {
    "class".to_string()
}

fn default_notifications_topic() -> String {
    "bucket-notifications".to_string()
}

fn default_consumer_group() -> String {
    "image-mirror".to_string()
}

fn default_auto_offset_reset() -> String {
    "latest".to_string()
}

fn default_session_timeout_ms() -> u32 {
    30000
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    9999
}

fn default_subscriber_queue_capacity() -> usize {
    256
}

fn default_true() -> bool {
    true
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl Config {
    /// Load configuration from config files and environment
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            // Start with default values
            .set_default("service.name", "mirror-service")?
            .set_default("service.log_level", "info")?
            // Add config file if present
            .add_source(config::File::with_name("config/mirror").required(false))
            .add_source(config::File::with_name("/etc/mirror/mirror").required(false));

        // Explicit config file path
        if let Ok(path) = std::env::var("MIRROR_CONFIG") {
            builder = builder.add_source(config::File::with_name(&path).required(true));
        }

        let config = builder
            // Override with environment variables
            // MIRROR__S3__BUCKET -> s3.bucket
            .add_source(
                config::Environment::with_prefix("MIRROR")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: Config = config.try_deserialize()?;
        config.apply_defaults();
        config.validate()?;
        Ok(config)
    }

    /// Fill zero or empty values that deserialization accepted
    pub fn apply_defaults(&mut self) {
        self.service.log_level = self.service.log_level.to_lowercase();

        if self.cache.dir.as_os_str().is_empty() {
            self.cache.dir = default_cache_dir();
        }
        if self.cache.max_images_display_count == 0 {
            self.cache.max_images_display_count = default_max_images_display_count();
        }
        if self.sync.event_channel_capacity == 0 {
            self.sync.event_channel_capacity = default_event_channel_capacity();
        }
        if self.files.preview_filename.is_empty() {
            self.files.preview_filename = default_preview_filename();
        }
        if self.api.port == 0 {
            self.api.port = default_api_port();
        }
        if self.api.subscriber_queue_capacity == 0 {
            self.api.subscriber_queue_capacity = default_subscriber_queue_capacity();
        }
        // "" or "/prefix" without trailing slash
        let base_path = self.api.base_path.trim_matches('/');
        self.api.base_path = if base_path.is_empty() {
            String::new()
        } else {
            format!("/{base_path}")
        };

        let mut seen: Vec<ImageTypeConfig> = Vec::with_capacity(self.image_types.len());
        for mut image_type in self.image_types.drain(..) {
            if image_type.display_name.is_empty() {
                image_type.display_name = image_type.name.clone();
            }
            if seen.contains(&image_type) {
                warn!(image_type = %image_type.name, "Removed duplicate image type");
                continue;
            }
            seen.push(image_type);
        }
        self.image_types = seen;
    }

    /// Collect every configuration problem
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.s3.bucket.is_empty() {
            errors.push("no s3 bucket name provided".to_string());
        }
        if self.image_types.is_empty() {
            errors.push("no image type provided".to_string());
        }
        if !LOG_LEVELS.contains(&self.service.log_level.as_str()) {
            errors.push(format!("invalid log level {:?}", self.service.log_level));
        }
        if self.cache.retention_period_secs == 0 {
            errors.push("no retention period provided".to_string());
        }
        if self.sync.polling_mode && self.sync.polling_period_secs == 0 {
            errors.push("no polling period provided".to_string());
        }
        if !self.sync.polling_mode && self.notifications.bootstrap_servers.is_none() {
            errors.push("notification mode requires notifications.bootstrap_servers".to_string());
        }

        for (i, image_type) in self.image_types.iter().enumerate() {
            if let Err(e) = Regex::new(&image_type.product_regexp) {
                errors.push(format!("invalid regexp for image type {:?}: {e}", image_type.name));
            }
            let collides = self.image_types[..i].iter().any(|other| {
                other.product_prefix == image_type.product_prefix
                    && other.product_regexp == image_type.product_regexp
            });
            if collides {
                errors.push(format!(
                    "image type {:?} has the same prefix and regexp as a previous type",
                    image_type.name
                ));
            }
        }

        for (name, pattern) in [
            ("features_regexp", &self.files.features_regexp),
            ("additional_product_files_regexp", &self.files.additional_product_files_regexp),
        ] {
            if let Some(Err(e)) = pattern.as_deref().map(Regex::new) {
                errors.push(format!("invalid {name}: {e}"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    /// Get retention period as Duration
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.cache.retention_period_secs)
    }

    /// Get polling period as Duration
    pub fn polling_period(&self) -> Duration {
        Duration::from_secs(self.sync.polling_period_secs)
    }

    /// Get single-object fetch deadline as Duration
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.s3.fetch_timeout_secs)
    }

    /// Get listing deadline as Duration
    pub fn list_timeout(&self) -> Duration {
        Duration::from_secs(self.s3.list_timeout_secs)
    }

    /// Get presigned URL expiry as Duration
    pub fn presigned_url_expiry(&self) -> Duration {
        Duration::from_secs(self.s3.presigned_url_expiry_secs)
    }

    /// Directory of primary images and side-files
    pub fn main_cache_dir(&self) -> PathBuf {
        self.cache.dir.join("main")
    }

    /// Directory of thumbnails
    pub fn thumbnails_cache_dir(&self) -> PathBuf {
        self.cache.dir.join("thumbnails")
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            retention_period_secs: 0,
            max_images_display_count: default_max_images_display_count(),
            exit_on_backend_error: false,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            polling_mode: false,
            polling_period_secs: default_polling_period_secs(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            preview_filename: default_preview_filename(),
            geonames_filename: None,
            localization_filename: None,
            features_regexp: None,
            features_category_name: default_features_category_name(),
            features_class_name: default_features_class_name(),
            full_product_extension: None,
            full_product_protocol: String::new(),
            full_product_root_url: String::new(),
            full_product_signed_url: false,
            additional_product_files_regexp: None,
        }
    }
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: None,
            topic: default_notifications_topic(),
            consumer_group: default_consumer_group(),
            auto_offset_reset: default_auto_offset_reset(),
            session_timeout_ms: default_session_timeout_ms(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            base_path: String::new(),
            subscriber_queue_capacity: default_subscriber_queue_capacity(),
            cors_enabled: true,
            cors_origins: Vec::new(),
        }
    }
}
