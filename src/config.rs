//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/default.toml, config/local.toml)
//! 3. Environment variables (override, `MARKETVAULT__SECTION__KEY`)

use serde::Deserialize;
use std::path::PathBuf;

use crate::storage::AddressingStyle;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub source: SourceConfig,
    pub destination: DestinationsConfig,
    pub backup: BackupConfig,
    pub notification: NotificationConfig,
    pub auth: AuthConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
}

/// Audit database (backup history) configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file holding `backup_history`
    pub path: PathBuf,
}

/// Where snapshot data is read from
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Relational store to snapshot (SQLite file)
    pub database_path: PathBuf,
    /// Base URL of the object-storage REST API (e.g. "https://<project>.supabase.co")
    pub storage_url: String,
    /// Service key used for listing and downloading
    pub service_key: String,
    /// Buckets mirrored by the media job
    #[serde(default = "default_buckets")]
    pub buckets: Vec<String>,
    /// Entries per list call
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

/// Backup destinations
#[derive(Debug, Clone, Deserialize)]
pub struct DestinationsConfig {
    /// Private backup bucket
    pub primary: DestinationConfig,
    /// CDN-fronted bucket holding large media (inventoried, not mirrored)
    pub cdn: Option<DestinationConfig>,
}

/// One S3-compatible bucket
#[derive(Debug, Clone, Deserialize)]
pub struct DestinationConfig {
    /// Service endpoint, e.g. "https://s3.us-east-1.amazonaws.com"
    pub endpoint: String,
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_service")]
    pub service: String,
    #[serde(default)]
    pub style: AddressingStyle,
    /// Public base URL (custom domain / CDN)
    pub public_url: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

/// Backup job configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BackupConfig {
    /// Project identifier written into snapshot metadata
    pub project_id: String,
    /// Collections copied by the database job, in order
    #[serde(default = "default_collections")]
    pub collections: Vec<String>,
    /// Large-media record collections inventoried by the media job
    #[serde(default = "default_inventory")]
    pub inventory: Vec<InventorySourceConfig>,
    /// Parallel file transfers in one media run
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Per-request HTTP timeout
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
    /// Report `partial` instead of `success` when some collections failed
    #[serde(default)]
    pub partial_on_collection_errors: bool,
}

/// A record collection describing objects in the CDN tier
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct InventorySourceConfig {
    pub collection: String,
    #[serde(default = "default_id_field")]
    pub id_field: String,
    pub size_field: String,
    pub path_field: String,
}

/// Operator email notification
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Mail API endpoint accepting `{from, to, subject, html}`
    pub endpoint: String,
    pub api_key: Option<String>,
    pub from: String,
    #[serde(default)]
    pub recipients: Vec<String>,
}

/// Operator authentication
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// HMAC secret for operator session tokens (32+ bytes)
    pub session_secret: String,
    /// Capability required to trigger backups
    #[serde(default = "default_admin_capability")]
    pub admin_capability: String,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

const MIN_SESSION_SECRET_BYTES: usize = 32;
const MAX_CONCURRENCY: usize = 16;

pub fn default_collections() -> Vec<String> {
    [
        "profiles",
        "user_roles",
        "freelancer_profiles",
        "client_profiles",
        "services",
        "service_packages",
        "orders",
        "order_deliveries",
        "order_revisions",
        "reviews",
        "conversations",
        "messages",
        "payments",
        "payouts",
        "disputes",
        "notifications",
        "content_library_assets",
        "webhooks_log",
    ]
    .iter()
    .map(|name| name.to_string())
    .collect()
}

fn default_buckets() -> Vec<String> {
    ["avatars", "service-images", "order-deliveries", "message-attachments"]
        .iter()
        .map(|name| name.to_string())
        .collect()
}

pub fn default_inventory() -> Vec<InventorySourceConfig> {
    vec![
        InventorySourceConfig {
            collection: "content_library_assets".to_string(),
            id_field: default_id_field(),
            size_field: "file_size".to_string(),
            path_field: "storage_path".to_string(),
        },
        InventorySourceConfig {
            collection: "order_delivery_files".to_string(),
            id_field: default_id_field(),
            size_field: "file_size".to_string(),
            path_field: "file_path".to_string(),
        },
        InventorySourceConfig {
            collection: "portfolio_media".to_string(),
            id_field: default_id_field(),
            size_field: "size_bytes".to_string(),
            path_field: "media_path".to_string(),
        },
    ]
}

fn default_page_size() -> usize {
    1000
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_service() -> String {
    "s3".to_string()
}

fn default_id_field() -> String {
    "id".to_string()
}

fn default_max_concurrency() -> usize {
    6
}

fn default_request_timeout_seconds() -> u64 {
    60
}

fn default_admin_capability() -> String {
    "admin".to_string()
}

impl BackupConfig {
    /// Concurrency clamped to a sane worker-pool size.
    pub fn effective_concurrency(&self) -> usize {
        self.max_concurrency.clamp(1, MAX_CONCURRENCY)
    }
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (MARKETVAULT__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            // Start with default values
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("database.path", "data/marketvault.db")?
            .set_default("source.page_size", 1000)?
            .set_default("backup.max_concurrency", 6)?
            .set_default("backup.request_timeout_seconds", 60)?
            .set_default("backup.partial_on_collection_errors", false)?
            .set_default("notification.enabled", false)?
            .set_default("auth.admin_capability", "admin")?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            // Load from config/default.toml if it exists
            .add_source(File::with_name("config/default").required(false))
            // Load from config/local.toml if it exists (overrides default)
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables (MARKETVAULT__*)
            .add_source(
                Environment::with_prefix("MARKETVAULT")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("source.buckets")
                    .with_list_parse_key("backup.collections")
                    .with_list_parse_key("notification.recipients")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    fn validate(&self) -> Result<(), crate::error::AppError> {
        use crate::error::AppError;

        if self.auth.session_secret.len() < MIN_SESSION_SECRET_BYTES {
            return Err(AppError::Config(format!(
                "auth.session_secret must be at least {} bytes",
                MIN_SESSION_SECRET_BYTES
            )));
        }

        if self.backup.project_id.trim().is_empty() {
            return Err(AppError::Config(
                "backup.project_id must not be empty".to_string(),
            ));
        }

        if self.backup.collections.is_empty() {
            return Err(AppError::Config(
                "backup.collections must list at least one collection".to_string(),
            ));
        }

        if self.source.page_size == 0 {
            return Err(AppError::Config(
                "source.page_size must be greater than 0".to_string(),
            ));
        }

        if self.backup.request_timeout_seconds == 0 {
            return Err(AppError::Config(
                "backup.request_timeout_seconds must be greater than 0".to_string(),
            ));
        }

        if self.backup.max_concurrency != self.backup.effective_concurrency() {
            tracing::warn!(
                configured = self.backup.max_concurrency,
                effective = self.backup.effective_concurrency(),
                "backup.max_concurrency clamped"
            );
        }

        if self.notification.enabled && self.notification.recipients.is_empty() {
            return Err(AppError::Config(
                "notification.recipients is required when notification.enabled=true".to_string(),
            ));
        }

        Ok(())
    }
}
