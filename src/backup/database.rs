//! Database snapshot job
//!
//! Reads every configured collection, assembles one versioned JSON document
//! and uploads it to the primary destination under
//! `backups/database-<timestamp>.json`.
//!
//! A failing collection is recorded in the document as
//! `{"error": "...", "rows": []}` and the run continues. Only an infrastructure
//! failure (no credentials, serialization, upload) fails the run.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use super::history::{BackupHistoryRecord, BackupHistoryRecorder};
use super::{BackupJobKind, BackupKind, BackupStatus, RunRequest, UnitErrors, key_timestamp};
use crate::source::{RecordSource, Row};
use crate::storage::{Destination, ObjectPutClient};

/// Version stamped into every snapshot document.
pub const SNAPSHOT_FORMAT_VERSION: &str = "1.0";

/// Object key prefix for database snapshots.
pub const SNAPSHOT_PREFIX: &str = "backups";

/// Fault injected into a run to exercise the failure path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFault {
    /// Abort after every collection was read, before anything is uploaded.
    AfterCollection,
}

/// Static schema facts shipped with each snapshot
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SchemaCatalog {
    /// Enum type name to its allowed values
    pub enums: BTreeMap<String, Vec<String>>,
    /// Stored-function identifiers
    pub functions: Vec<String>,
}

impl SchemaCatalog {
    /// Enum and function inventory of the marketplace schema.
    pub fn marketplace() -> Self {
        let enums = [
            ("app_role", &["admin", "moderator", "seller", "buyer"][..]),
            (
                "order_status",
                &[
                    "pending",
                    "paid",
                    "in_progress",
                    "delivered",
                    "revision_requested",
                    "completed",
                    "cancelled",
                    "disputed",
                    "refunded",
                ][..],
            ),
            (
                "payout_status",
                &["pending", "processing", "paid", "failed"][..],
            ),
            (
                "dispute_status",
                &["open", "under_review", "resolved", "closed"][..],
            ),
            (
                "listing_status",
                &["draft", "pending_review", "active", "paused", "archived"][..],
            ),
        ]
        .into_iter()
        .map(|(name, values)| {
            (
                name.to_string(),
                values.iter().map(|value| value.to_string()).collect(),
            )
        })
        .collect();

        let functions = [
            "has_role",
            "handle_new_user",
            "update_updated_at_column",
            "calculate_order_fees",
            "release_escrow",
            "get_seller_stats",
        ]
        .into_iter()
        .map(str::to_string)
        .collect();

        Self { enums, functions }
    }
}

/// Document metadata block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub backup_kind: BackupKind,
    pub project_id: String,
    pub collection_count: usize,
}

/// One collection inside a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CollectionSnapshot {
    Rows { row_count: usize, rows: Vec<Row> },
    Failed { error: String, rows: Vec<Row> },
}

impl CollectionSnapshot {
    pub fn failed(error: impl ToString) -> Self {
        CollectionSnapshot::Failed {
            error: error.to_string(),
            rows: Vec::new(),
        }
    }

    pub fn row_count(&self) -> usize {
        match self {
            CollectionSnapshot::Rows { row_count, .. } => *row_count,
            CollectionSnapshot::Failed { .. } => 0,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, CollectionSnapshot::Failed { .. })
    }
}

/// The uploaded database snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotDocument {
    pub metadata: SnapshotMetadata,
    /// Exactly one entry per configured collection
    pub collections: BTreeMap<String, CollectionSnapshot>,
    pub schema_descriptors: BTreeMap<String, Vec<String>>,
    pub function_inventory: Vec<String>,
}

impl SnapshotDocument {
    /// Row counts per collection; failed collections count zero.
    pub fn row_counts(&self) -> BTreeMap<String, usize> {
        self.collections
            .iter()
            .map(|(name, snapshot)| (name.clone(), snapshot.row_count()))
            .collect()
    }
}

/// Tunables of the database job
#[derive(Debug, Clone)]
pub struct DatabaseJobSettings {
    pub project_id: String,
    pub collections: Vec<String>,
    pub schema: SchemaCatalog,
    /// Report `partial` instead of `success` when some collections failed
    pub partial_on_collection_errors: bool,
}

/// Collections read in one run
struct Collected {
    collections: BTreeMap<String, CollectionSnapshot>,
    succeeded: Vec<String>,
    total_rows: usize,
    errors: UnitErrors,
}

/// Full logical snapshot of the record store
#[derive(Clone)]
pub struct DatabaseSnapshotJob {
    records: Arc<dyn RecordSource>,
    uploader: ObjectPutClient,
    destination: Destination,
    recorder: BackupHistoryRecorder,
    settings: DatabaseJobSettings,
    fault: Option<InjectedFault>,
}

impl DatabaseSnapshotJob {
    pub fn new(
        records: Arc<dyn RecordSource>,
        uploader: ObjectPutClient,
        destination: Destination,
        recorder: BackupHistoryRecorder,
        settings: DatabaseJobSettings,
    ) -> Self {
        Self {
            records,
            uploader,
            destination,
            recorder,
            settings,
            fault: None,
        }
    }

    /// Same job, failing at `fault` on every run.
    pub fn with_injected_fault(mut self, fault: InjectedFault) -> Self {
        self.fault = Some(fault);
        self
    }

    pub fn settings(&self) -> &DatabaseJobSettings {
        &self.settings
    }

    /// Run one snapshot. Always returns the record that was written.
    pub async fn run(&self, request: RunRequest) -> BackupHistoryRecord {
        let record = BackupHistoryRecord::started(BackupJobKind::Database, &request);
        let span = tracing::info_span!(
            "backup_run",
            job = "database",
            kind = %request.kind,
            run_id = %record.id
        );

        async move {
            let started = Instant::now();
            let mut record = self.execute(record, &request).await;
            record.duration_ms = started.elapsed().as_millis() as u64;
            self.recorder.finish(record).await
        }
        .instrument(span)
        .await
    }

    async fn execute(
        &self,
        mut record: BackupHistoryRecord,
        request: &RunRequest,
    ) -> BackupHistoryRecord {
        if !self.destination.has_credentials() {
            return record.fail(format!(
                "destination `{}` has no credentials configured",
                self.destination.name
            ));
        }

        tracing::info!(
            collections = self.settings.collections.len(),
            "Starting database snapshot"
        );
        let collected = self.collect().await;

        record.units_backed_up = collected.succeeded.clone();
        record.count("collections", collected.succeeded.len() as u64);
        record.count("failed_collections", collected.errors.len() as u64);
        record.count("rows", collected.total_rows as u64);
        record.count("schema_enums", self.settings.schema.enums.len() as u64);
        record.count("functions", self.settings.schema.functions.len() as u64);

        if self.fault == Some(InjectedFault::AfterCollection) {
            record.units_backed_up.clear();
            return record.fail(format!(
                "simulated failure after reading {} collections",
                self.settings.collections.len()
            ));
        }

        let document = self.assemble(request.kind, record.created_at, collected.collections);
        let bytes = match serde_json::to_vec_pretty(&document) {
            Ok(bytes) => bytes,
            Err(e) => {
                record.units_backed_up.clear();
                return record.fail(format!("failed to serialize snapshot: {}", e));
            }
        };

        let key = format!(
            "{}/database-{}.json",
            SNAPSHOT_PREFIX,
            key_timestamp(record.created_at)
        );
        record.file_name = Some(key.clone());

        match self
            .uploader
            .put_object(&self.destination, &key, "application/json", bytes)
            .await
        {
            Ok(outcome) => {
                record.byte_size = outcome.bytes as u64;
                record.destination_url = Some(outcome.url);
                record.error_message = collected.errors.summary(5);
                record.status = if collected.errors.is_empty()
                    || !self.settings.partial_on_collection_errors
                {
                    BackupStatus::Success
                } else {
                    BackupStatus::Partial
                };
                record
            }
            Err(e) => {
                record.units_backed_up.clear();
                record.fail(format!("upload of {} failed: {}", key, e))
            }
        }
    }

    /// Read every configured collection, sequentially, in configured order.
    async fn collect(&self) -> Collected {
        let mut collected = Collected {
            collections: BTreeMap::new(),
            succeeded: Vec::new(),
            total_rows: 0,
            errors: UnitErrors::new(),
        };

        for name in &self.settings.collections {
            match self.records.fetch_all(name).await {
                Ok(rows) => {
                    tracing::debug!(collection = %name, rows = rows.len(), "Collection read");
                    collected.total_rows += rows.len();
                    collected.succeeded.push(name.clone());
                    collected.collections.insert(
                        name.clone(),
                        CollectionSnapshot::Rows {
                            row_count: rows.len(),
                            rows,
                        },
                    );
                }
                Err(e) => {
                    collected.errors.push(name, &e);
                    collected
                        .collections
                        .insert(name.clone(), CollectionSnapshot::failed(e));
                }
            }
        }

        collected
    }

    fn assemble(
        &self,
        kind: BackupKind,
        created_at: DateTime<Utc>,
        collections: BTreeMap<String, CollectionSnapshot>,
    ) -> SnapshotDocument {
        SnapshotDocument {
            metadata: SnapshotMetadata {
                version: SNAPSHOT_FORMAT_VERSION.to_string(),
                created_at,
                backup_kind: kind,
                project_id: self.settings.project_id.clone(),
                collection_count: collections.len(),
            },
            collections,
            schema_descriptors: self.settings.schema.enums.clone(),
            function_inventory: self.settings.schema.functions.clone(),
        }
    }
}
