//! Marketvault - disaster-recovery backups for the marketplace
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - Admin trigger endpoints (database / media)               │
//! │  - Backup history, health, metrics                          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Backup Jobs                           │
//! │  - DatabaseSnapshotJob, MediaSnapshotJob                    │
//! │  - BackupHistoryRecorder (audit log + notification)         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Sources / Storage Layer                     │
//! │  - Record source (SQLite), object source (storage REST)     │
//! │  - SigV4 signer + signed PUT client                         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers
//! - `auth`: operator session tokens
//! - `backup`: snapshot jobs, history, notifications
//! - `source`: data sources being backed up
//! - `storage`: request signing and object uploads
//! - `config`: Configuration management
//! - `error`: Error types

pub mod api;
pub mod auth;
pub mod backup;
pub mod config;
pub mod error;
pub mod metrics;
pub mod source;
pub mod storage;

use std::sync::Arc;
use std::time::Duration;

use backup::{
    BackupHistoryRecorder, DatabaseJobSettings, DatabaseSnapshotJob, EmailNotifier, HistoryStore,
    MediaJobSettings, MediaSnapshotJob, SchemaCatalog, SqliteHistoryStore,
};
use source::{SqliteRecordSource, StorageApiSource};
use storage::{Destination, ObjectPutClient};

/// Largest accepted request body on admin routes.
const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Backup history (audit log)
    pub history: Arc<dyn HistoryStore>,

    pub database_job: Arc<DatabaseSnapshotJob>,

    pub media_job: Arc<MediaSnapshotJob>,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Connect to the audit database
    /// 2. Open the record and object sources
    /// 3. Resolve destinations and the upload client
    /// 4. Build the notifier and both jobs
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        let timeout = Duration::from_secs(config.backup.request_timeout_seconds);

        // 1. Audit database
        let history: Arc<dyn HistoryStore> =
            Arc::new(SqliteHistoryStore::connect(&config.database.path).await?);

        // 2. Sources
        let records = Arc::new(SqliteRecordSource::open(&config.source.database_path).await?);
        let objects = Arc::new(StorageApiSource::new(
            &config.source.storage_url,
            &config.source.service_key,
            timeout,
        )?);
        tracing::info!("Sources initialized");

        // 3. Destinations
        let uploader = ObjectPutClient::new(timeout)?;
        let primary = Destination::from_config("primary", &config.destination.primary)?;
        if !primary.has_credentials() {
            tracing::warn!("Primary destination has no credentials; backup runs will fail");
        }
        let cdn = config
            .destination
            .cdn
            .as_ref()
            .map(|cdn| Destination::from_config("cdn", cdn))
            .transpose()?;

        // 4. Notifier, recorder and jobs
        let notifier = EmailNotifier::from_config(&config.notification, timeout)?;
        let recorder = BackupHistoryRecorder::new(history.clone(), notifier);

        let database_job = DatabaseSnapshotJob::new(
            records.clone(),
            uploader.clone(),
            primary.clone(),
            recorder.clone(),
            DatabaseJobSettings {
                project_id: config.backup.project_id.clone(),
                collections: config.backup.collections.clone(),
                schema: SchemaCatalog::marketplace(),
                partial_on_collection_errors: config.backup.partial_on_collection_errors,
            },
        );

        let media_job = MediaSnapshotJob::new(
            objects,
            records,
            uploader,
            primary,
            recorder,
            MediaJobSettings {
                buckets: config.source.buckets.clone(),
                inventory: config.backup.inventory.clone(),
                page_size: config.source.page_size,
                max_concurrency: config.backup.effective_concurrency(),
                cdn,
            },
        );

        tracing::info!("Application state initialized successfully");

        Ok(Self::from_parts(config, history, database_job, media_job))
    }

    /// Assemble state from already-built parts.
    pub fn from_parts(
        config: config::AppConfig,
        history: Arc<dyn HistoryStore>,
        database_job: DatabaseSnapshotJob,
        media_job: MediaSnapshotJob,
    ) -> Self {
        Self {
            config: Arc::new(config),
            history,
            database_job: Arc::new(database_job),
            media_job: Arc::new(media_job),
        }
    }
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower::ServiceBuilder;
    use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .nest("/admin", api::admin_router())
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BODY_BYTES)),
        )
        .with_state(state)
        .merge(api::metrics_router())
}

async fn health_check() -> &'static str {
    "OK"
}
