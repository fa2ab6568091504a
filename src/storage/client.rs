//! Signed single-object PUT client
//!
//! Uploads one payload per call to an S3-compatible bucket. The same code
//! path serves the private backup bucket and the CDN-fronted bucket; only the
//! [`Destination`] differs. No retries here; retry policy belongs to callers.

use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use url::Url;

use super::signer::{self, CanonicalHeaders, Credentials, SigningContext};
use crate::config::DestinationConfig;
use crate::error::{AppError, UploadError};
use crate::metrics::{OBJECT_PUT_BYTES, OBJECT_PUTS_TOTAL};

/// Longest error body kept from a rejected upload.
const MAX_ERROR_BODY_BYTES: usize = 2048;

/// How the bucket name is placed in the request URL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressingStyle {
    /// `https://<bucket>.<endpoint-host>/<key>`
    #[default]
    VirtualHosted,
    /// `https://<endpoint-host>/<bucket>/<key>`
    Path,
}

/// A bucket on an S3-compatible service plus the credentials to write to it
#[derive(Debug, Clone)]
pub struct Destination {
    /// Label used in logs ("primary", "cdn")
    pub name: String,
    pub endpoint: Url,
    pub bucket: String,
    pub region: String,
    pub service: String,
    pub style: AddressingStyle,
    /// Public base URL (custom domain / CDN) used for returned object URLs
    pub public_url: Option<String>,
    pub credentials: Option<Credentials>,
}

/// Where a single object lives on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectTarget {
    pub url: Url,
    /// Value of the `host` header, including a non-default port
    pub host: String,
    /// URI-encoded path, as signed
    pub canonical_path: String,
}

/// Result of a successful upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOutcome {
    pub key: String,
    pub url: String,
    pub bytes: usize,
}

impl Destination {
    /// Build a destination from configuration.
    ///
    /// Missing credentials are allowed here; uploads then fail with
    /// [`UploadError::MissingCredentials`] and jobs record a failed run.
    pub fn from_config(name: &str, config: &DestinationConfig) -> Result<Self, AppError> {
        let endpoint = Url::parse(&config.endpoint).map_err(|e| {
            AppError::Config(format!("destination.{}.endpoint is invalid: {}", name, e))
        })?;
        if endpoint.host_str().is_none() {
            return Err(AppError::Config(format!(
                "destination.{}.endpoint must include a host",
                name
            )));
        }

        let credentials = match (
            non_empty(config.access_key_id.as_deref()),
            non_empty(config.secret_access_key.as_deref()),
        ) {
            (Some(key_id), Some(secret)) => Some(Credentials::new(key_id, secret)),
            _ => None,
        };

        Ok(Self {
            name: name.to_string(),
            endpoint,
            bucket: config.bucket.clone(),
            region: config.region.clone(),
            service: config.service.clone(),
            style: config.style,
            public_url: config.public_url.clone(),
            credentials,
        })
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    /// Resolve request URL, host header and canonical path for `key`.
    pub fn object_target(&self, key: &str) -> Result<ObjectTarget, UploadError> {
        let endpoint_host = self.endpoint.host_str().ok_or_else(|| {
            UploadError::InvalidDestination(format!("{} endpoint has no host", self.name))
        })?;
        if self.bucket.trim().is_empty() {
            return Err(UploadError::InvalidDestination(format!(
                "{} bucket is empty",
                self.name
            )));
        }

        // URL parsing drops `.`/`..` segments (encoded or not), so the sent
        // path would no longer match the signed one.
        if key
            .split('/')
            .any(|segment| segment == "." || segment == "..")
        {
            return Err(UploadError::InvalidDestination(format!(
                "object key `{}` contains a dot segment",
                key
            )));
        }

        let port = self
            .endpoint
            .port()
            .map(|port| format!(":{}", port))
            .unwrap_or_default();
        let encoded_key = signer::encode_key_path(key.trim_start_matches('/'));

        let (host, canonical_path) = match self.style {
            AddressingStyle::VirtualHosted => (
                format!("{}.{}{}", self.bucket, endpoint_host, port),
                format!("/{}", encoded_key),
            ),
            AddressingStyle::Path => (
                format!("{}{}", endpoint_host, port),
                format!(
                    "{}/{}/{}",
                    self.endpoint.path().trim_end_matches('/'),
                    self.bucket,
                    encoded_key
                ),
            ),
        };

        let url = Url::parse(&format!(
            "{}://{}{}",
            self.endpoint.scheme(),
            host,
            canonical_path
        ))
        .map_err(|e| UploadError::InvalidDestination(format!("{}: {}", self.name, e)))?;

        Ok(ObjectTarget {
            url,
            host,
            canonical_path,
        })
    }

    /// URL reported for an uploaded object.
    pub fn public_url_for(&self, key: &str, target: &ObjectTarget) -> String {
        match self.public_url.as_deref() {
            Some(base) => format!(
                "{}/{}",
                base.trim_end_matches('/'),
                signer::encode_key_path(key.trim_start_matches('/'))
            ),
            None => target.url.to_string(),
        }
    }

    /// Public URL of `key`, or `None` if no URL can be formed.
    pub fn object_url(&self, key: &str) -> Option<String> {
        self.object_target(key)
            .ok()
            .map(|target| self.public_url_for(key, &target))
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

/// HTTP client issuing SigV4-signed PUTs
#[derive(Debug, Clone)]
pub struct ObjectPutClient {
    http: reqwest::Client,
}

impl ObjectPutClient {
    /// Create a client whose every request (connect + transfer) is bounded by `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("marketvault/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Internal(e.into()))?;
        Ok(Self { http })
    }

    pub fn with_http_client(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// Upload `bytes` to `key` in `destination`.
    ///
    /// # Errors
    /// - `MissingCredentials` if the destination has none
    /// - `Status` for any non-2xx answer (including clock-skew rejections)
    /// - `Transport` when no response arrived, `timed_out` set on timeouts
    pub async fn put_object(
        &self,
        destination: &Destination,
        key: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<PutOutcome, UploadError> {
        let result = self.send(destination, key, content_type, bytes).await;
        match &result {
            Ok(outcome) => {
                OBJECT_PUTS_TOTAL.with_label_values(&["success"]).inc();
                OBJECT_PUT_BYTES.inc_by(outcome.bytes as f64);
            }
            Err(UploadError::Transport { .. }) => {
                OBJECT_PUTS_TOTAL.with_label_values(&["transport"]).inc();
            }
            Err(_) => {
                OBJECT_PUTS_TOTAL.with_label_values(&["rejected"]).inc();
            }
        }
        result
    }

    async fn send(
        &self,
        destination: &Destination,
        key: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<PutOutcome, UploadError> {
        let credentials = destination
            .credentials
            .as_ref()
            .ok_or_else(|| UploadError::MissingCredentials(destination.name.clone()))?;
        let target = destination.object_target(key)?;

        let signed = signer::sign(&SigningContext {
            credentials,
            region: &destination.region,
            service: &destination.service,
            host: &target.host,
            method: "PUT",
            canonical_path: &target.canonical_path,
            query_string: "",
            headers: CanonicalHeaders::new().with("content-type", content_type)?,
            payload: &bytes,
            timestamp: Utc::now(),
        })?;

        let size = bytes.len();
        let mut request = self.http.put(target.url.clone());
        for (name, value) in signed.request_headers() {
            request = request.header(name, value);
        }

        tracing::debug!(
            destination = %destination.name,
            bucket = %destination.bucket,
            key = %key,
            bytes = size,
            "Uploading object"
        );

        let response = request.body(bytes).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UploadError::Status {
                status: status.as_u16(),
                body: truncate_body(body),
            });
        }

        Ok(PutOutcome {
            key: key.to_string(),
            url: destination.public_url_for(key, &target),
            bytes: size,
        })
    }
}

fn truncate_body(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY_BYTES {
        let mut cut = MAX_ERROR_BODY_BYTES;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}
