//! Disaster-recovery backup jobs
//!
//! Two independent jobs drive the signer/uploader:
//! - [`DatabaseSnapshotJob`]: one versioned JSON document of every record collection
//! - [`MediaSnapshotJob`]: mirrors bucket files and inventories the CDN tier
//!
//! Every run ends in exactly one [`BackupHistoryRecord`], written and announced
//! by the [`BackupHistoryRecorder`]. Unit-level failures (one collection, one
//! file) are accumulated, never thrown past the enumerating loop.

pub mod database;
pub mod history;
pub mod media;
pub mod notify;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

pub use database::{
    CollectionSnapshot, DatabaseJobSettings, DatabaseSnapshotJob, InjectedFault, SchemaCatalog,
    SnapshotDocument, SnapshotMetadata,
};
pub use history::{BackupHistoryRecord, BackupHistoryRecorder, HistoryStore, SqliteHistoryStore};
pub use media::{
    FileEntry, InventoryCollection, InventoryItem, InventorySummary, ManifestTotals,
    MediaJobSettings, MediaManifest, MediaSnapshotJob, RemoteInventory,
};
pub use notify::{
    DisabledNotifier, EmailNotifier, HttpMailTransport, MailMessage, MailTransport, Notifier,
    render_message,
};

/// Why a run was started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    #[default]
    Manual,
    Scheduled,
}

/// Which job produced a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupJobKind {
    Database,
    Media,
}

/// Outcome of a run
///
/// `Partial`: output was produced but at least one unit failed.
/// `Failed`: no output could be produced or uploaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    Success,
    Partial,
    Failed,
}

impl BackupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Manual => "manual",
            BackupKind::Scheduled => "scheduled",
        }
    }
}

impl BackupJobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupJobKind::Database => "database",
            BackupJobKind::Media => "media",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            BackupJobKind::Database => "Database",
            BackupJobKind::Media => "Media",
        }
    }
}

impl BackupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStatus::Success => "success",
            BackupStatus::Partial => "partial",
            BackupStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "manual" => Ok(BackupKind::Manual),
            "scheduled" => Ok(BackupKind::Scheduled),
            other => Err(format!("unknown backup kind: {:?}", other)),
        }
    }
}

impl fmt::Display for BackupJobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupJobKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "database" => Ok(BackupJobKind::Database),
            "media" => Ok(BackupJobKind::Media),
            other => Err(format!("unknown backup type: {:?}", other)),
        }
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "success" => Ok(BackupStatus::Success),
            "partial" => Ok(BackupStatus::Partial),
            "failed" => Ok(BackupStatus::Failed),
            other => Err(format!("unknown backup status: {:?}", other)),
        }
    }
}

/// Input of one job invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunRequest {
    pub kind: BackupKind,
    /// Operator identity, already authorized by the caller
    pub triggered_by: Option<String>,
}

impl RunRequest {
    pub fn new(kind: BackupKind, triggered_by: Option<String>) -> Self {
        Self { kind, triggered_by }
    }
}

/// ISO-8601 UTC timestamp with `:` and `.` replaced by `-`.
///
/// `2026-10-16T08:15:30.123Z` becomes `2026-10-16T08-15-30-123Z`, safe in
/// object keys and file names.
pub fn key_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-")
}

/// Unit-level error accumulator threaded through enumeration loops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitErrors {
    errors: Vec<String>,
}

impl UnitErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure of `unit` and keep going.
    pub fn push(&mut self, unit: &str, error: impl fmt::Display) {
        let message = format!("{}: {}", unit, error);
        tracing::warn!(unit = %unit, error = %error, "Backup unit failed");
        self.errors.push(message);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.errors
    }

    pub fn into_vec(self) -> Vec<String> {
        self.errors
    }

    /// Short summary for history records and notifications.
    pub fn summary(&self, max_listed: usize) -> Option<String> {
        if self.errors.is_empty() {
            return None;
        }
        let listed = self
            .errors
            .iter()
            .take(max_listed)
            .cloned()
            .collect::<Vec<_>>()
            .join("; ");
        let remaining = self.errors.len().saturating_sub(max_listed);
        Some(if remaining > 0 {
            format!(
                "{} unit error(s): {} (and {} more)",
                self.errors.len(),
                listed,
                remaining
            )
        } else {
            format!("{} unit error(s): {}", self.errors.len(), listed)
        })
    }
}
