//! Media snapshot job
//!
//! Mirrors every file of every configured bucket into
//! `media-backups/<timestamp>/<bucket>/<path>` on the primary destination,
//! then uploads a remote-storage inventory and a manifest describing the run.
//!
//! Enumeration walks folders with an explicit work queue, so nesting depth is
//! unbounded. Transfers run with bounded concurrency; their outcomes are folded
//! into the manifest sequentially.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::Instrument;

use super::history::{BackupHistoryRecord, BackupHistoryRecorder};
use super::{BackupJobKind, BackupStatus, RunRequest, UnitErrors, key_timestamp};
use crate::config::InventorySourceConfig;
use crate::source::{ObjectSource, RecordSource, Row, list_all};
use crate::storage::{Destination, ObjectPutClient};

/// Object key prefix for media snapshots.
pub const MEDIA_PREFIX: &str = "media-backups";

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// One file copied into the snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path inside the source bucket
    pub path: String,
    pub size_bytes: u64,
    pub destination_key: String,
}

/// One row of a remote-storage collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryItem {
    pub id: Option<String>,
    pub path: Option<String>,
    pub size_bytes: u64,
    /// Public URL on the CDN tier, when one is configured
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InventoryCollection {
    pub count: usize,
    pub total_bytes: u64,
    pub items: Vec<InventoryItem>,
}

/// Files held on the CDN tier, as listed in the record store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteInventory {
    pub generated_at: DateTime<Utc>,
    pub sources: BTreeMap<String, InventoryCollection>,
    pub total_count: usize,
    pub total_bytes: u64,
}

/// Per-collection totals carried in the manifest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventorySummary {
    pub count: usize,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ManifestTotals {
    pub buckets: usize,
    pub files: usize,
    pub bytes: u64,
}

/// Description of one media run, uploaded last
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaManifest {
    pub generated_at: DateTime<Utc>,
    /// Every configured bucket, even when it held nothing
    pub per_bucket: BTreeMap<String, Vec<FileEntry>>,
    pub remote_inventory: BTreeMap<String, InventorySummary>,
    pub totals: ManifestTotals,
    pub errors: Vec<String>,
}

/// Tunables of the media job
#[derive(Debug, Clone)]
pub struct MediaJobSettings {
    pub buckets: Vec<String>,
    pub inventory: Vec<InventorySourceConfig>,
    pub page_size: usize,
    pub max_concurrency: usize,
    /// CDN-fronted bucket the inventoried files live in
    pub cdn: Option<Destination>,
}

/// A file discovered during enumeration
#[derive(Debug, Clone)]
struct FileTask {
    bucket: String,
    path: String,
    content_type: Option<String>,
}

/// Mirror of bucket files plus CDN inventory
#[derive(Clone)]
pub struct MediaSnapshotJob {
    objects: Arc<dyn ObjectSource>,
    records: Arc<dyn RecordSource>,
    uploader: ObjectPutClient,
    destination: Destination,
    recorder: BackupHistoryRecorder,
    settings: MediaJobSettings,
}

impl MediaSnapshotJob {
    pub fn new(
        objects: Arc<dyn ObjectSource>,
        records: Arc<dyn RecordSource>,
        uploader: ObjectPutClient,
        destination: Destination,
        recorder: BackupHistoryRecorder,
        settings: MediaJobSettings,
    ) -> Self {
        Self {
            objects,
            records,
            uploader,
            destination,
            recorder,
            settings,
        }
    }

    pub fn settings(&self) -> &MediaJobSettings {
        &self.settings
    }

    /// Run one media snapshot. Always returns the record that was written.
    pub async fn run(&self, request: RunRequest) -> BackupHistoryRecord {
        let record = BackupHistoryRecord::started(BackupJobKind::Media, &request);
        let span = tracing::info_span!(
            "backup_run",
            job = "media",
            kind = %request.kind,
            run_id = %record.id
        );

        async move {
            let started = Instant::now();
            let mut record = self.execute(record).await;
            record.duration_ms = started.elapsed().as_millis() as u64;
            self.recorder.finish(record).await
        }
        .instrument(span)
        .await
    }

    async fn execute(&self, mut record: BackupHistoryRecord) -> BackupHistoryRecord {
        if !self.destination.has_credentials() {
            return record.fail(format!(
                "destination `{}` has no credentials configured",
                self.destination.name
            ));
        }

        let prefix = format!("{}/{}", MEDIA_PREFIX, key_timestamp(record.created_at));
        let mut errors = UnitErrors::new();
        let mut per_bucket: BTreeMap<String, Vec<FileEntry>> = BTreeMap::new();
        let mut listed_buckets = Vec::new();
        let mut tasks = Vec::new();

        tracing::info!(
            buckets = self.settings.buckets.len(),
            prefix = %prefix,
            "Starting media snapshot"
        );

        for bucket in &self.settings.buckets {
            per_bucket.insert(bucket.clone(), Vec::new());
            let (files, listed) = self.enumerate_bucket(bucket, &mut errors).await;
            if listed {
                listed_buckets.push(bucket.clone());
            }
            tracing::debug!(bucket = %bucket, files = files.len(), "Bucket enumerated");
            tasks.extend(files);
        }

        let outcomes: Vec<(String, Result<FileEntry, String>)> = stream::iter(tasks)
            .map(|task| self.transfer(task, &prefix))
            .buffer_unordered(self.settings.max_concurrency.max(1))
            .collect()
            .await;

        for (bucket, outcome) in outcomes {
            match outcome {
                Ok(entry) => per_bucket.entry(bucket).or_default().push(entry),
                Err(message) => errors.push(&bucket, message),
            }
        }
        for entries in per_bucket.values_mut() {
            entries.sort_by(|a, b| a.path.cmp(&b.path));
        }

        let files_copied: usize = per_bucket.values().map(Vec::len).sum();
        let bytes_copied: u64 = per_bucket
            .values()
            .flatten()
            .map(|entry| entry.size_bytes)
            .sum();

        let inventory = self.build_inventory(&mut errors).await;
        match serde_json::to_vec_pretty(&inventory) {
            Ok(bytes) => {
                let key = format!("{}/remote-inventory.json", prefix);
                if let Err(e) = self
                    .uploader
                    .put_object(&self.destination, &key, "application/json", bytes)
                    .await
                {
                    errors.push("remote-inventory.json", e);
                }
            }
            Err(e) => errors.push("remote-inventory.json", e),
        }

        record.units_backed_up = listed_buckets;
        record.byte_size = bytes_copied;
        record.count("buckets", self.settings.buckets.len() as u64);
        record.count("files", files_copied as u64);
        record.count("bytes", bytes_copied);
        record.count("inventory_items", inventory.total_count as u64);
        record.count("inventory_bytes", inventory.total_bytes);

        let manifest = MediaManifest {
            generated_at: Utc::now(),
            totals: ManifestTotals {
                buckets: per_bucket.len(),
                files: files_copied,
                bytes: bytes_copied,
            },
            per_bucket,
            remote_inventory: inventory
                .sources
                .iter()
                .map(|(name, collection)| {
                    (
                        name.clone(),
                        InventorySummary {
                            count: collection.count,
                            total_bytes: collection.total_bytes,
                        },
                    )
                })
                .collect(),
            errors: errors.as_slice().to_vec(),
        };

        let manifest_key = format!("{}/manifest.json", prefix);
        let manifest_upload = match serde_json::to_vec_pretty(&manifest) {
            Ok(bytes) => self
                .uploader
                .put_object(&self.destination, &manifest_key, "application/json", bytes)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match manifest_upload {
            Ok(outcome) => {
                record.file_name = Some(manifest_key);
                record.destination_url = Some(outcome.url);
            }
            Err(e) => errors.push("manifest.json", e),
        }
        record.count("errors", errors.len() as u64);

        record.status = if record.file_name.is_none() && files_copied == 0 {
            BackupStatus::Failed
        } else if errors.is_empty() {
            BackupStatus::Success
        } else {
            BackupStatus::Partial
        };
        record.error_message = errors.summary(5);
        record
    }

    /// Every file under `bucket`, plus whether the bucket root could be listed.
    async fn enumerate_bucket(&self, bucket: &str, errors: &mut UnitErrors) -> (Vec<FileTask>, bool) {
        let mut files = Vec::new();
        let mut root_listed = false;
        let mut queue = VecDeque::from([String::new()]);

        while let Some(prefix) = queue.pop_front() {
            let entries = match list_all(
                self.objects.as_ref(),
                bucket,
                &prefix,
                self.settings.page_size,
            )
            .await
            {
                Ok(entries) => entries,
                Err(e) => {
                    let unit = if prefix.is_empty() {
                        bucket.to_string()
                    } else {
                        format!("{}/{}", bucket, prefix)
                    };
                    errors.push(&unit, format!("listing failed: {}", e));
                    continue;
                }
            };
            if prefix.is_empty() {
                root_listed = true;
            }

            for entry in entries {
                if entry.name.is_empty() {
                    continue;
                }
                let path = if prefix.is_empty() {
                    entry.name.clone()
                } else {
                    format!("{}/{}", prefix, entry.name)
                };
                if entry.is_folder() {
                    queue.push_back(path);
                } else {
                    files.push(FileTask {
                        bucket: bucket.to_string(),
                        path,
                        content_type: entry.content_type,
                    });
                }
            }
        }

        (files, root_listed)
    }

    /// Download one file and re-upload it under `prefix`.
    async fn transfer(&self, task: FileTask, prefix: &str) -> (String, Result<FileEntry, String>) {
        let unit_path = task.path.clone();
        let bytes = match self.objects.download(&task.bucket, &task.path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                return (
                    task.bucket,
                    Err(format!("{}: download failed: {}", unit_path, e)),
                );
            }
        };

        let destination_key = format!("{}/{}/{}", prefix, task.bucket, task.path);
        let content_type = task.content_type.as_deref().unwrap_or(DEFAULT_CONTENT_TYPE);
        match self
            .uploader
            .put_object(&self.destination, &destination_key, content_type, bytes)
            .await
        {
            Ok(outcome) => (
                task.bucket,
                Ok(FileEntry {
                    path: task.path,
                    size_bytes: outcome.bytes as u64,
                    destination_key,
                }),
            ),
            Err(e) => (
                task.bucket,
                Err(format!("{}: upload failed: {}", unit_path, e)),
            ),
        }
    }

    /// Read the configured remote-storage collections into an inventory.
    async fn build_inventory(&self, errors: &mut UnitErrors) -> RemoteInventory {
        let mut sources = BTreeMap::new();

        for source in &self.settings.inventory {
            match self.records.fetch_all(&source.collection).await {
                Ok(rows) => {
                    let items: Vec<InventoryItem> = rows
                        .iter()
                        .map(|row| inventory_item(row, source, self.settings.cdn.as_ref()))
                        .collect();
                    let total_bytes = items.iter().map(|item| item.size_bytes).sum();
                    sources.insert(
                        source.collection.clone(),
                        InventoryCollection {
                            count: items.len(),
                            total_bytes,
                            items,
                        },
                    );
                }
                Err(e) => errors.push(&format!("inventory {}", source.collection), e),
            }
        }

        RemoteInventory {
            generated_at: Utc::now(),
            total_count: sources.values().map(|c: &InventoryCollection| c.count).sum(),
            total_bytes: sources.values().map(|c: &InventoryCollection| c.total_bytes).sum(),
            sources,
        }
    }
}

fn inventory_item(
    row: &Row,
    source: &InventorySourceConfig,
    cdn: Option<&Destination>,
) -> InventoryItem {
    let path = row.get(&source.path_field).and_then(value_to_string);
    let url = match (cdn, path.as_deref()) {
        (Some(cdn), Some(path)) => cdn.object_url(path),
        _ => None,
    };
    InventoryItem {
        id: row.get(&source.id_field).and_then(value_to_string),
        size_bytes: row
            .get(&source.size_field)
            .and_then(value_to_size)
            .unwrap_or(0),
        path,
        url,
    }
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn value_to_size(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
