//! Snapshot data sources
//!
//! The backup jobs read through two narrow contracts:
//! - [`RecordSource`]: full scans of named record collections
//! - [`ObjectSource`]: paginated listing and download of bucket objects
//!
//! Concrete implementations live next to them; tests swap in fakes.

mod objects;
mod records;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SourceError;

pub use objects::StorageApiSource;
pub use records::SqliteRecordSource;

/// One record, column name to JSON value.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Relational data source
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Every row of `collection`, all columns.
    ///
    /// Missing collections report [`SourceError::NotFound`], permission
    /// failures [`SourceError::Denied`].
    async fn fetch_all(&self, collection: &str) -> Result<Vec<Row>, SourceError>;
}

/// Entry returned by a bucket listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectEntry {
    /// Name relative to the listed prefix
    pub name: String,
    /// Content identifier; `None` marks a folder
    pub id: Option<String>,
    pub size: Option<u64>,
    pub content_type: Option<String>,
}

impl ObjectEntry {
    pub fn is_folder(&self) -> bool {
        self.id.is_none()
    }
}

/// Object-storage source to mirror
#[async_trait]
pub trait ObjectSource: Send + Sync {
    /// One page of entries directly under `prefix` ("" for the bucket root).
    async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ObjectEntry>, SourceError>;

    /// Full contents of the object at `path`.
    async fn download(&self, bucket: &str, path: &str) -> Result<Vec<u8>, SourceError>;
}

/// List every entry under `prefix`, following pages until a short one.
pub async fn list_all(
    source: &dyn ObjectSource,
    bucket: &str,
    prefix: &str,
    page_size: usize,
) -> Result<Vec<ObjectEntry>, SourceError> {
    let page_size = page_size.max(1);
    let mut entries = Vec::new();
    let mut offset = 0;

    loop {
        let page = source.list(bucket, prefix, page_size, offset).await?;
        let fetched = page.len();
        entries.extend(page);
        if fetched < page_size {
            return Ok(entries);
        }
        offset += fetched;
    }
}
