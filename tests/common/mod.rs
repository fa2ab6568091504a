//! Common test utilities for E2E tests
//!
//! In-memory stand-ins for every external collaborator plus a fake
//! S3-compatible endpoint that re-computes and checks each SigV4 signature.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, NaiveDateTime, Utc};
use tokio::net::TcpListener;

use marketvault::AppState;
use marketvault::auth::{OperatorSession, create_session_token};
use marketvault::backup::{
    BackupHistoryRecord, BackupHistoryRecorder, DatabaseJobSettings, DatabaseSnapshotJob,
    EmailNotifier, HistoryStore, MailTransport, MediaJobSettings, MediaSnapshotJob, SchemaCatalog,
};
use marketvault::config::{self, AppConfig};
use marketvault::error::{AppError, NotifyError, SourceError};
use marketvault::source::{ObjectEntry, ObjectSource, RecordSource, Row};
use marketvault::storage::signer::{self, AMZ_DATE_FORMAT};
use marketvault::storage::{
    AddressingStyle, CanonicalHeaders, Credentials, Destination, ObjectPutClient, SigningContext,
};

pub const ACCESS_KEY_ID: &str = "AKIDEXAMPLE";
pub const SECRET_ACCESS_KEY: &str = "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY";
pub const BUCKET: &str = "market-backups";
pub const SESSION_SECRET: &str = "test-secret-key-that-is-32-bytes-long!";
pub const OPERATOR_EMAIL: &str = "ops@example.com";

/// Build a JSON row from a `json!` object literal.
pub fn row(value: serde_json::Value) -> Row {
    value.as_object().cloned().unwrap_or_default()
}

// =============================================================================
// Fake S3 endpoint
// =============================================================================

/// Object received by the fake endpoint
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Clone)]
struct FakeS3State {
    credentials: Credentials,
    objects: Arc<Mutex<BTreeMap<String, StoredObject>>>,
    reject_status: Arc<Mutex<Option<u16>>>,
    failing_keys: Arc<Mutex<Vec<String>>>,
    signature_failures: Arc<AtomicUsize>,
    requests: Arc<AtomicUsize>,
}

/// S3-compatible PUT endpoint on 127.0.0.1, path-style addressing
pub struct FakeS3 {
    pub addr: SocketAddr,
    state: FakeS3State,
}

impl FakeS3 {
    pub async fn start() -> Self {
        let state = FakeS3State {
            credentials: Credentials::new(ACCESS_KEY_ID, SECRET_ACCESS_KEY),
            objects: Arc::new(Mutex::new(BTreeMap::new())),
            reject_status: Arc::new(Mutex::new(None)),
            failing_keys: Arc::new(Mutex::new(Vec::new())),
            signature_failures: Arc::new(AtomicUsize::new(0)),
            requests: Arc::new(AtomicUsize::new(0)),
        };

        let app = Router::new()
            .fallback(handle_request)
            .with_state(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Destination signed with the credentials this endpoint expects.
    pub fn destination(&self) -> Destination {
        self.destination_with(Some(Credentials::new(ACCESS_KEY_ID, SECRET_ACCESS_KEY)))
    }

    pub fn destination_with(&self, credentials: Option<Credentials>) -> Destination {
        Destination {
            name: "primary".to_string(),
            endpoint: url::Url::parse(&self.endpoint()).unwrap(),
            bucket: BUCKET.to_string(),
            region: "us-east-1".to_string(),
            service: "s3".to_string(),
            style: AddressingStyle::Path,
            public_url: None,
            credentials,
        }
    }

    /// Stored objects keyed by object key (bucket stripped, percent-decoded).
    pub fn objects(&self) -> BTreeMap<String, StoredObject> {
        self.state.objects.lock().unwrap().clone()
    }

    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.state.objects.lock().unwrap().get(key).cloned()
    }

    pub fn object_json(&self, key: &str) -> serde_json::Value {
        let object = self
            .object(key)
            .unwrap_or_else(|| panic!("object {key} was not uploaded"));
        serde_json::from_slice(&object.body).unwrap()
    }

    /// Answer every PUT with `status`.
    pub fn reject_all(&self, status: u16) {
        *self.state.reject_status.lock().unwrap() = Some(status);
    }

    /// Answer PUTs whose key contains `fragment` with 500.
    pub fn fail_keys_containing(&self, fragment: &str) {
        self.state
            .failing_keys
            .lock()
            .unwrap()
            .push(fragment.to_string());
    }

    pub fn signature_failures(&self) -> usize {
        self.state.signature_failures.load(Ordering::SeqCst)
    }

    pub fn request_count(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }
}

async fn handle_request(
    State(state): State<FakeS3State>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.requests.fetch_add(1, Ordering::SeqCst);

    if method != Method::PUT {
        return (StatusCode::METHOD_NOT_ALLOWED, "only PUT").into_response();
    }

    if let Err(reason) = verify_signature(&state.credentials, &method, &uri, &headers, &body) {
        state.signature_failures.fetch_add(1, Ordering::SeqCst);
        return (
            StatusCode::FORBIDDEN,
            format!("<Error><Code>SignatureDoesNotMatch</Code><Message>{reason}</Message></Error>"),
        )
            .into_response();
    }

    let Some(encoded_key) = uri.path().strip_prefix(&format!("/{}/", BUCKET)) else {
        return (StatusCode::NOT_FOUND, "<Error><Code>NoSuchBucket</Code></Error>").into_response();
    };
    let key = urlencoding::decode(encoded_key).unwrap().into_owned();

    if let Some(status) = *state.reject_status.lock().unwrap() {
        let status = StatusCode::from_u16(status).unwrap();
        return (status, "<Error><Code>AccessDenied</Code></Error>").into_response();
    }
    if state
        .failing_keys
        .lock()
        .unwrap()
        .iter()
        .any(|fragment| key.contains(fragment.as_str()))
    {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "<Error><Code>InternalError</Code></Error>",
        )
            .into_response();
    }

    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.objects.lock().unwrap().insert(
        key,
        StoredObject {
            content_type,
            body: body.to_vec(),
        },
    );

    StatusCode::OK.into_response()
}

fn required_header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| format!("missing header {name}"))
}

/// Recompute the request signature the way an S3 server does.
fn verify_signature(
    credentials: &Credentials,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), String> {
    let authorization = required_header(headers, "authorization")?;
    let fields = authorization
        .strip_prefix("AWS4-HMAC-SHA256 ")
        .ok_or("unexpected algorithm")?;
    let mut parts = HashMap::new();
    for field in fields.split(", ") {
        let (name, value) = field.split_once('=').ok_or("malformed authorization")?;
        parts.insert(name, value);
    }

    let credential = parts.get("Credential").ok_or("missing Credential")?;
    let scope: Vec<&str> = credential.split('/').collect();
    if scope.len() != 5 || scope[0] != credentials.access_key_id() || scope[4] != "aws4_request" {
        return Err(format!("bad credential scope {credential}"));
    }
    let (region, service) = (scope[2], scope[3]);

    let payload_hash = required_header(headers, "x-amz-content-sha256")?;
    if payload_hash != signer::hex_sha256(body) {
        return Err("payload hash mismatch".to_string());
    }

    let amz_date = required_header(headers, "x-amz-date")?;
    let timestamp: DateTime<Utc> = NaiveDateTime::parse_from_str(amz_date, AMZ_DATE_FORMAT)
        .map_err(|e| e.to_string())?
        .and_utc();

    let signed_names = parts.get("SignedHeaders").ok_or("missing SignedHeaders")?;
    let mut extra = CanonicalHeaders::new();
    for name in signed_names.split(';') {
        if matches!(name, "host" | "x-amz-date" | "x-amz-content-sha256") {
            continue;
        }
        extra
            .insert(name, required_header(headers, name)?)
            .map_err(|e| e.to_string())?;
    }

    let expected = signer::sign(&SigningContext {
        credentials,
        region,
        service,
        host: required_header(headers, "host")?,
        method: method.as_str(),
        canonical_path: uri.path(),
        query_string: uri.query().unwrap_or(""),
        headers: extra,
        payload: body,
        timestamp,
    })
    .map_err(|e| e.to_string())?;

    let provided = parts.get("Signature").ok_or("missing Signature")?;
    if expected.signature() != *provided {
        return Err("signature mismatch".to_string());
    }
    if expected.signed_headers().signed_names() != *signed_names {
        return Err("signed header list mismatch".to_string());
    }
    Ok(())
}

// =============================================================================
// Collaborator fakes
// =============================================================================

/// Record store with canned results per collection
#[derive(Default)]
pub struct FakeRecordSource {
    collections: HashMap<String, Result<Vec<Row>, SourceError>>,
    calls: Mutex<Vec<String>>,
}

impl FakeRecordSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(mut self, collection: &str, rows: Vec<Row>) -> Self {
        self.collections.insert(collection.to_string(), Ok(rows));
        self
    }

    pub fn with_error(mut self, collection: &str, error: SourceError) -> Self {
        self.collections.insert(collection.to_string(), Err(error));
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RecordSource for FakeRecordSource {
    async fn fetch_all(&self, collection: &str) -> Result<Vec<Row>, SourceError> {
        self.calls.lock().unwrap().push(collection.to_string());
        self.collections
            .get(collection)
            .cloned()
            .unwrap_or_else(|| Err(SourceError::NotFound(collection.to_string())))
    }
}

/// Bucket tree held in memory; folders are implied by `/` in paths
#[derive(Default)]
pub struct FakeObjectSource {
    buckets: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
    failing_downloads: HashSet<(String, String)>,
    download_delay: Option<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl FakeObjectSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bucket(mut self, bucket: &str) -> Self {
        self.buckets.entry(bucket.to_string()).or_default();
        self
    }

    pub fn with_file(mut self, bucket: &str, path: &str, body: &[u8]) -> Self {
        self.buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(path.to_string(), body.to_vec());
        self
    }

    pub fn with_failing_download(mut self, bucket: &str, path: &str) -> Self {
        self.failing_downloads
            .insert((bucket.to_string(), path.to_string()));
        self
    }

    pub fn with_download_delay(mut self, delay: Duration) -> Self {
        self.download_delay = Some(delay);
        self
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectSource for FakeObjectSource {
    async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ObjectEntry>, SourceError> {
        let files = self
            .buckets
            .get(bucket)
            .ok_or_else(|| SourceError::NotFound(bucket.to_string()))?;
        let base = if prefix.is_empty() {
            String::new()
        } else {
            format!("{prefix}/")
        };

        let mut entries: BTreeMap<String, ObjectEntry> = BTreeMap::new();
        for (path, body) in files {
            let Some(rest) = path.strip_prefix(&base) else {
                continue;
            };
            let entry = match rest.split_once('/') {
                Some((folder, _)) => ObjectEntry {
                    name: folder.to_string(),
                    id: None,
                    size: None,
                    content_type: None,
                },
                None => ObjectEntry {
                    name: rest.to_string(),
                    id: Some(format!("{bucket}:{path}")),
                    size: Some(body.len() as u64),
                    content_type: Some(guess_content_type(rest).to_string()),
                },
            };
            entries.insert(entry.name.clone(), entry);
        }

        Ok(entries.into_values().skip(offset).take(limit).collect())
    }

    async fn download(&self, bucket: &str, path: &str) -> Result<Vec<u8>, SourceError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.download_delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self
            .failing_downloads
            .contains(&(bucket.to_string(), path.to_string()))
        {
            return Err(SourceError::Transport(format!(
                "connection reset while downloading {bucket}/{path}"
            )));
        }
        self.buckets
            .get(bucket)
            .and_then(|files| files.get(path))
            .cloned()
            .ok_or_else(|| SourceError::NotFound(format!("{bucket}/{path}")))
    }
}

fn guess_content_type(name: &str) -> &'static str {
    match name.rsplit_once('.').map(|(_, ext)| ext) {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("pdf") => "application/pdf",
        _ => "application/octet-stream",
    }
}

/// Audit log kept in memory
#[derive(Default)]
pub struct InMemoryHistoryStore {
    records: Mutex<Vec<BackupHistoryRecord>>,
    failing: bool,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            failing: true,
        }
    }

    pub fn records(&self) -> Vec<BackupHistoryRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn insert(&self, record: &BackupHistoryRecord) -> Result<(), AppError> {
        if self.failing {
            return Err(AppError::Internal(anyhow::anyhow!("history table unavailable")));
        }
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn recent(&self, limit: u32) -> Result<Vec<BackupHistoryRecord>, AppError> {
        let mut records = self.records();
        records.reverse();
        records.truncate(limit as usize);
        Ok(records)
    }
}

/// Sent message captured by [`RecordingMailTransport`]
#[derive(Debug, Clone)]
pub struct SentMail {
    pub to: Vec<String>,
    pub subject: String,
    pub html: String,
}

#[derive(Default)]
pub struct RecordingMailTransport {
    sent: Mutex<Vec<SentMail>>,
    failing: bool,
}

impl RecordingMailTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            failing: true,
        }
    }

    pub fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailTransport for RecordingMailTransport {
    async fn send(&self, to: &[String], subject: &str, html: &str) -> Result<(), NotifyError> {
        if self.failing {
            return Err(NotifyError::Rejected { status: 503 });
        }
        self.sent.lock().unwrap().push(SentMail {
            to: to.to_vec(),
            subject: subject.to_string(),
            html: html.to_string(),
        });
        Ok(())
    }
}

// =============================================================================
// Job harness
// =============================================================================

/// Fake S3 plus in-memory history and mail, wired into a recorder
pub struct Harness {
    pub s3: FakeS3,
    pub history: Arc<InMemoryHistoryStore>,
    pub mail: Arc<RecordingMailTransport>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_parts(InMemoryHistoryStore::new(), RecordingMailTransport::new()).await
    }

    pub async fn with_parts(history: InMemoryHistoryStore, mail: RecordingMailTransport) -> Self {
        Self {
            s3: FakeS3::start().await,
            history: Arc::new(history),
            mail: Arc::new(mail),
        }
    }

    pub fn recorder(&self) -> BackupHistoryRecorder {
        let notifier = EmailNotifier::new(self.mail.clone(), vec![OPERATOR_EMAIL.to_string()]);
        BackupHistoryRecorder::new(self.history.clone(), Arc::new(notifier))
    }

    pub fn uploader(&self) -> ObjectPutClient {
        ObjectPutClient::new(Duration::from_secs(5)).unwrap()
    }

    pub fn database_job(
        &self,
        records: Arc<dyn RecordSource>,
        collections: &[&str],
    ) -> DatabaseSnapshotJob {
        DatabaseSnapshotJob::new(
            records,
            self.uploader(),
            self.s3.destination(),
            self.recorder(),
            DatabaseJobSettings {
                project_id: "market-test".to_string(),
                collections: collections.iter().map(|c| c.to_string()).collect(),
                schema: SchemaCatalog::marketplace(),
                partial_on_collection_errors: false,
            },
        )
    }

    pub fn media_job(
        &self,
        objects: Arc<dyn ObjectSource>,
        records: Arc<dyn RecordSource>,
        buckets: &[&str],
    ) -> MediaSnapshotJob {
        MediaSnapshotJob::new(
            objects,
            records,
            self.uploader(),
            self.s3.destination(),
            self.recorder(),
            MediaJobSettings {
                buckets: buckets.iter().map(|b| b.to_string()).collect(),
                inventory: config::default_inventory(),
                page_size: 2,
                max_concurrency: 4,
                cdn: None,
            },
        )
    }
}

// =============================================================================
// HTTP test server
// =============================================================================

pub fn test_config(endpoint: &str) -> AppConfig {
    AppConfig {
        server: config::ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        },
        database: config::DatabaseConfig {
            path: "/tmp/unused-history.db".into(),
        },
        source: config::SourceConfig {
            database_path: "/tmp/unused-source.db".into(),
            storage_url: "http://127.0.0.1:9".to_string(),
            service_key: "service-key".to_string(),
            buckets: vec!["avatars".to_string()],
            page_size: 100,
        },
        destination: config::DestinationsConfig {
            primary: config::DestinationConfig {
                endpoint: endpoint.to_string(),
                bucket: BUCKET.to_string(),
                region: "us-east-1".to_string(),
                service: "s3".to_string(),
                style: AddressingStyle::Path,
                public_url: None,
                access_key_id: Some(ACCESS_KEY_ID.to_string()),
                secret_access_key: Some(SECRET_ACCESS_KEY.to_string()),
            },
            cdn: None,
        },
        backup: config::BackupConfig {
            project_id: "market-test".to_string(),
            collections: vec!["profiles".to_string(), "orders".to_string()],
            inventory: Vec::new(),
            max_concurrency: 4,
            request_timeout_seconds: 5,
            partial_on_collection_errors: false,
        },
        notification: config::NotificationConfig {
            enabled: true,
            endpoint: "http://127.0.0.1:9/emails".to_string(),
            api_key: None,
            from: "backups@example.com".to_string(),
            recipients: vec![OPERATOR_EMAIL.to_string()],
        },
        auth: config::AuthConfig {
            session_secret: SESSION_SECRET.to_string(),
            admin_capability: "admin".to_string(),
        },
        logging: config::LoggingConfig {
            level: "info".to_string(),
            format: "pretty".to_string(),
        },
    }
}

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub harness: Harness,
    pub client: reqwest::Client,
}

impl TestServer {
    /// Serve the admin API over fake collaborators.
    pub async fn new(records: FakeRecordSource, objects: FakeObjectSource) -> Self {
        let harness = Harness::new().await;
        let records: Arc<dyn RecordSource> = Arc::new(records);
        let config = test_config(&harness.s3.endpoint());

        let database_job = harness.database_job(records.clone(), &["profiles", "orders"]);
        let media_job = harness.media_job(Arc::new(objects), records, &["avatars"]);
        let state = AppState::from_parts(
            config,
            harness.history.clone(),
            database_job,
            media_job,
        );

        let app = marketvault::build_router(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr: format!("http://{}", addr),
            state,
            harness,
            client: reqwest::Client::new(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// Bearer token for an operator holding `capabilities`.
    pub fn token(&self, capabilities: &[&str]) -> String {
        let session = OperatorSession::new(
            "op-1",
            OPERATOR_EMAIL,
            capabilities,
            chrono::Duration::hours(1),
        );
        create_session_token(&session, SESSION_SECRET).unwrap()
    }

    pub fn admin_token(&self) -> String {
        self.token(&["admin"])
    }
}
