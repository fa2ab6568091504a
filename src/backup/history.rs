//! Backup history: the audit log and its side effects
//!
//! Each run produces one [`BackupHistoryRecord`]. The [`BackupHistoryRecorder`]
//! persists it and sends the operator notification, both best-effort: a
//! failing audit write or mail endpoint is logged and counted, never raised
//! back into the job.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use super::notify::Notifier;
use super::{BackupJobKind, BackupKind, BackupStatus, RunRequest};
use crate::error::AppError;
use crate::metrics::{BACKUP_DURATION_SECONDS, BACKUPS_TOTAL, HISTORY_WRITES_TOTAL, NOTIFICATIONS_TOTAL};

/// Audit row describing one completed run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupHistoryRecord {
    /// ULID, sortable by creation time
    pub id: String,
    pub backup_type: BackupJobKind,
    pub backup_kind: BackupKind,
    pub status: BackupStatus,
    /// Object key of the primary artifact (snapshot document or manifest)
    pub file_name: Option<String>,
    pub destination_url: Option<String>,
    pub byte_size: u64,
    pub duration_ms: u64,
    /// Collections or buckets that made it into the artifact
    pub units_backed_up: Vec<String>,
    pub component_counts: BTreeMap<String, u64>,
    pub error_message: Option<String>,
    pub triggered_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl BackupHistoryRecord {
    /// Empty record for a run that is about to start.
    ///
    /// Status starts as `Failed`; jobs upgrade it once output is uploaded.
    pub fn started(job: BackupJobKind, request: &RunRequest) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            backup_type: job,
            backup_kind: request.kind,
            status: BackupStatus::Failed,
            file_name: None,
            destination_url: None,
            byte_size: 0,
            duration_ms: 0,
            units_backed_up: Vec::new(),
            component_counts: BTreeMap::new(),
            error_message: None,
            triggered_by: request.triggered_by.clone(),
            created_at: Utc::now(),
        }
    }

    /// Mark the run as failed with `message`.
    pub fn fail(mut self, message: impl Into<String>) -> Self {
        self.status = BackupStatus::Failed;
        self.error_message = Some(message.into());
        self
    }

    pub fn count(&mut self, component: &str, value: u64) {
        self.component_counts.insert(component.to_string(), value);
    }
}

/// Audit log storage
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn insert(&self, record: &BackupHistoryRecord) -> Result<(), AppError>;

    /// Most recent records first.
    async fn recent(&self, limit: u32) -> Result<Vec<BackupHistoryRecord>, AppError>;
}

/// SQLite-backed audit log
#[derive(Clone)]
pub struct SqliteHistoryStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct HistoryRow {
    id: String,
    backup_type: String,
    backup_kind: String,
    status: String,
    file_name: Option<String>,
    destination_url: Option<String>,
    byte_size: i64,
    duration_ms: i64,
    units_backed_up: String,
    component_counts: String,
    error_message: Option<String>,
    triggered_by: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<HistoryRow> for BackupHistoryRecord {
    type Error = AppError;

    fn try_from(row: HistoryRow) -> Result<Self, Self::Error> {
        let id = row.id.clone();
        let invalid = |field: &str, detail: String| {
            AppError::Internal(anyhow::anyhow!(
                "backup_history {} has invalid {}: {}",
                id,
                field,
                detail
            ))
        };

        Ok(Self {
            backup_type: row
                .backup_type
                .parse()
                .map_err(|e| invalid("backup_type", e))?,
            backup_kind: row
                .backup_kind
                .parse()
                .map_err(|e| invalid("backup_kind", e))?,
            status: row.status.parse().map_err(|e| invalid("status", e))?,
            units_backed_up: serde_json::from_str(&row.units_backed_up)
                .map_err(|e| invalid("units_backed_up", e.to_string()))?,
            component_counts: serde_json::from_str(&row.component_counts)
                .map_err(|e| invalid("component_counts", e.to_string()))?,
            byte_size: row.byte_size.max(0) as u64,
            duration_ms: row.duration_ms.max(0) as u64,
            file_name: row.file_name,
            destination_url: row.destination_url,
            error_message: row.error_message,
            triggered_by: row.triggered_by,
            created_at: row.created_at,
            id: row.id,
        })
    }
}

impl SqliteHistoryStore {
    /// Open (creating if needed) the audit database and run migrations.
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        let connection_string = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&connection_string).await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!(path = %path.display(), "History database connected and migrated");

        Ok(Self { pool })
    }
}

#[async_trait]
impl HistoryStore for SqliteHistoryStore {
    async fn insert(&self, record: &BackupHistoryRecord) -> Result<(), AppError> {
        let units = serde_json::to_string(&record.units_backed_up)
            .map_err(|e| AppError::Internal(e.into()))?;
        let counts = serde_json::to_string(&record.component_counts)
            .map_err(|e| AppError::Internal(e.into()))?;

        sqlx::query(
            r#"
            INSERT INTO backup_history (
                id, backup_type, backup_kind, status, file_name, destination_url,
                byte_size, duration_ms, units_backed_up, component_counts,
                error_message, triggered_by, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(record.backup_type.as_str())
        .bind(record.backup_kind.as_str())
        .bind(record.status.as_str())
        .bind(&record.file_name)
        .bind(&record.destination_url)
        .bind(i64::try_from(record.byte_size).unwrap_or(i64::MAX))
        .bind(i64::try_from(record.duration_ms).unwrap_or(i64::MAX))
        .bind(units)
        .bind(counts)
        .bind(&record.error_message)
        .bind(&record.triggered_by)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn recent(&self, limit: u32) -> Result<Vec<BackupHistoryRecord>, AppError> {
        let rows: Vec<HistoryRow> = sqlx::query_as(
            r#"
            SELECT id, backup_type, backup_kind, status, file_name, destination_url,
                   byte_size, duration_ms, units_backed_up, component_counts,
                   error_message, triggered_by, created_at
            FROM backup_history
            ORDER BY created_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(BackupHistoryRecord::try_from).collect()
    }
}

/// Persists run records and announces them
#[derive(Clone)]
pub struct BackupHistoryRecorder {
    store: Arc<dyn HistoryStore>,
    notifier: Arc<dyn Notifier>,
}

impl BackupHistoryRecorder {
    pub fn new(store: Arc<dyn HistoryStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    pub fn store(&self) -> &Arc<dyn HistoryStore> {
        &self.store
    }

    /// Insert `record` into the audit log. Returns whether it was stored.
    pub async fn record(&self, record: &BackupHistoryRecord) -> bool {
        match self.store.insert(record).await {
            Ok(()) => {
                HISTORY_WRITES_TOTAL.with_label_values(&["success"]).inc();
                true
            }
            Err(e) => {
                HISTORY_WRITES_TOTAL.with_label_values(&["failure"]).inc();
                tracing::error!(
                    record_id = %record.id,
                    job = %record.backup_type,
                    error = %e,
                    "Failed to write backup history"
                );
                false
            }
        }
    }

    /// Send the operator notification for `record`. Returns whether it was sent.
    pub async fn notify(&self, record: &BackupHistoryRecord) -> bool {
        match self.notifier.notify(record).await {
            Ok(()) => {
                NOTIFICATIONS_TOTAL.with_label_values(&["sent"]).inc();
                true
            }
            Err(e) => {
                NOTIFICATIONS_TOTAL.with_label_values(&["failure"]).inc();
                tracing::warn!(
                    record_id = %record.id,
                    job = %record.backup_type,
                    error = %e,
                    "Failed to send backup notification"
                );
                false
            }
        }
    }

    /// Record, then notify. Always hands the record back unchanged.
    pub async fn finish(&self, record: BackupHistoryRecord) -> BackupHistoryRecord {
        BACKUPS_TOTAL
            .with_label_values(&[record.backup_type.as_str(), record.status.as_str()])
            .inc();
        BACKUP_DURATION_SECONDS
            .with_label_values(&[record.backup_type.as_str()])
            .observe(record.duration_ms as f64 / 1000.0);

        match record.status {
            BackupStatus::Failed => tracing::error!(
                record_id = %record.id,
                job = %record.backup_type,
                error = record.error_message.as_deref().unwrap_or(""),
                "Backup run failed"
            ),
            status => tracing::info!(
                record_id = %record.id,
                job = %record.backup_type,
                status = %status,
                bytes = record.byte_size,
                duration_ms = record.duration_ms,
                "Backup run completed"
            ),
        }

        self.record(&record).await;
        self.notify(&record).await;
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::notify::MockNotifier;
    use crate::error::NotifyError;
    use tempfile::TempDir;

    fn sample_record(status: BackupStatus) -> BackupHistoryRecord {
        let mut record = BackupHistoryRecord::started(
            BackupJobKind::Database,
            &RunRequest::new(BackupKind::Manual, Some("ops@example.com".to_string())),
        );
        record.status = status;
        record.file_name = Some("backups/database-2026-10-16T08-15-30-123Z.json".to_string());
        record.byte_size = 4096;
        record.duration_ms = 1250;
        record.units_backed_up = vec!["orders".to_string(), "profiles".to_string()];
        record.count("collections", 2);
        record.count("rows", 37);
        record
    }

    #[tokio::test]
    async fn sqlite_store_round_trips_records_newest_first() {
        let temp_dir = TempDir::new().unwrap();
        let store = SqliteHistoryStore::connect(&temp_dir.path().join("nested/history.db"))
            .await
            .unwrap();

        let mut older = sample_record(BackupStatus::Success);
        older.created_at = Utc::now() - chrono::Duration::minutes(5);
        let newer = sample_record(BackupStatus::Failed).fail("upload rejected: HTTP 403");

        store.insert(&older).await.unwrap();
        store.insert(&newer).await.unwrap();

        let recent = store.recent(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, newer.id);
        assert_eq!(recent[0].status, BackupStatus::Failed);
        assert_eq!(
            recent[0].error_message.as_deref(),
            Some("upload rejected: HTTP 403")
        );
        assert_eq!(recent[1].units_backed_up, older.units_backed_up);
        assert_eq!(recent[1].component_counts.get("rows"), Some(&37));
        assert_eq!(recent[1].triggered_by.as_deref(), Some("ops@example.com"));

        assert_eq!(store.recent(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn finish_records_then_notifies() {
        let mut store = MockHistoryStore::new();
        store.expect_insert().times(1).returning(|_| Ok(()));
        let mut notifier = MockNotifier::new();
        notifier
            .expect_notify()
            .withf(|record| record.status == BackupStatus::Success)
            .times(1)
            .returning(|_| Ok(()));

        let recorder = BackupHistoryRecorder::new(Arc::new(store), Arc::new(notifier));
        let record = sample_record(BackupStatus::Success);
        let finished = recorder.finish(record.clone()).await;
        assert_eq!(finished, record);
    }

    #[tokio::test]
    async fn history_write_failure_does_not_stop_notification() {
        let mut store = MockHistoryStore::new();
        store
            .expect_insert()
            .times(1)
            .returning(|_| Err(AppError::Database(sqlx::Error::PoolTimedOut)));
        let mut notifier = MockNotifier::new();
        notifier.expect_notify().times(1).returning(|_| Ok(()));

        let recorder = BackupHistoryRecorder::new(Arc::new(store), Arc::new(notifier));
        let finished = recorder.finish(sample_record(BackupStatus::Partial)).await;
        assert_eq!(finished.status, BackupStatus::Partial);
    }

    fn rejecting_notifier() -> MockNotifier {
        let mut notifier = MockNotifier::new();
        notifier
            .expect_notify()
            .times(1)
            .returning(|_| Err(NotifyError::Rejected { status: 503 }));
        notifier
    }

    #[tokio::test]
    async fn notify_reports_failure_without_error() {
        let recorder = BackupHistoryRecorder::new(
            Arc::new(MockHistoryStore::new()),
            Arc::new(rejecting_notifier()),
        );
        assert!(!recorder.notify(&sample_record(BackupStatus::Success)).await);
    }

    #[tokio::test]
    async fn notification_failure_is_swallowed_by_finish() {
        let mut store = MockHistoryStore::new();
        store.expect_insert().times(1).returning(|_| Ok(()));

        let recorder = BackupHistoryRecorder::new(Arc::new(store), Arc::new(rejecting_notifier()));
        let finished = recorder.finish(sample_record(BackupStatus::Success)).await;
        assert_eq!(finished.status, BackupStatus::Success);
    }
}
