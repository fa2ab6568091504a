//! Object-storage REST source
//!
//! Lists and downloads objects through the storage REST API:
//! - `POST {base}/storage/v1/object/list/{bucket}`
//! - `GET  {base}/storage/v1/object/{bucket}/{path}`

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{ObjectEntry, ObjectSource};
use crate::error::{AppError, SourceError};
use crate::storage::signer::encode_key_path;

/// Storage REST client authenticated with a service key
#[derive(Clone)]
pub struct StorageApiSource {
    http: reqwest::Client,
    base_url: String,
    service_key: String,
}

#[derive(Debug, Deserialize)]
struct ListedObject {
    name: String,
    id: Option<String>,
    #[serde(default)]
    metadata: Option<ListedMetadata>,
}

#[derive(Debug, Deserialize)]
struct ListedMetadata {
    size: Option<u64>,
    mimetype: Option<String>,
}

impl From<ListedObject> for ObjectEntry {
    fn from(listed: ListedObject) -> Self {
        let (size, content_type) = listed
            .metadata
            .map(|metadata| (metadata.size, metadata.mimetype))
            .unwrap_or((None, None));
        ObjectEntry {
            name: listed.name,
            id: listed.id,
            size,
            content_type,
        }
    }
}

impl StorageApiSource {
    pub fn new(base_url: &str, service_key: &str, timeout: Duration) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("marketvault/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Internal(e.into()))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key: service_key.to_string(),
        })
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .bearer_auth(&self.service_key)
            .header("apikey", &self.service_key)
    }
}

fn status_error(bucket: &str, status: reqwest::StatusCode, body: String) -> SourceError {
    match status.as_u16() {
        404 => SourceError::NotFound(bucket.to_string()),
        401 | 403 => SourceError::Denied {
            collection: bucket.to_string(),
            message: body,
        },
        _ => SourceError::Query(format!("HTTP {}: {}", status, body)),
    }
}

#[async_trait]
impl ObjectSource for StorageApiSource {
    async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ObjectEntry>, SourceError> {
        let url = format!(
            "{}/storage/v1/object/list/{}",
            self.base_url,
            urlencoding::encode(bucket)
        );
        let body = serde_json::json!({
            "prefix": prefix,
            "limit": limit,
            "offset": offset,
            "sortBy": { "column": "name", "order": "asc" },
        });

        let response = self
            .authorized(self.http.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(|e| SourceError::Transport(format!("list {}/{}: {}", bucket, prefix, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(bucket, status, body));
        }

        let listed: Vec<ListedObject> = response
            .json()
            .await
            .map_err(|e| SourceError::Query(format!("invalid listing for {}: {}", bucket, e)))?;

        Ok(listed.into_iter().map(ObjectEntry::from).collect())
    }

    async fn download(&self, bucket: &str, path: &str) -> Result<Vec<u8>, SourceError> {
        let url = format!(
            "{}/storage/v1/object/{}/{}",
            self.base_url,
            urlencoding::encode(bucket),
            encode_key_path(path.trim_start_matches('/'))
        );

        let response = self
            .authorized(self.http.get(&url))
            .send()
            .await
            .map_err(|e| SourceError::Transport(format!("download {}/{}: {}", bucket, path, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(bucket, status, body));
        }

        response
            .bytes()
            .await
            .map(|bytes| bytes.to_vec())
            .map_err(|e| SourceError::Transport(format!("download {}/{}: {}", bucket, path, e)))
    }
}
