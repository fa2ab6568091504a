//! Operator notifications
//!
//! One HTML email per run: a summary on success/partial, a distinct alert on
//! failure. Delivery goes through an HTTP mail API (`POST {endpoint}` with a
//! JSON body); every dynamic value is HTML-escaped before templating.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use html_escape::encode_text;

use super::BackupStatus;
use super::history::BackupHistoryRecord;
use crate::config::NotificationConfig;
use crate::error::{AppError, NotifyError};

/// Sends the notification for a finished run
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, record: &BackupHistoryRecord) -> Result<(), NotifyError>;
}

/// Delivers one rendered message
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, to: &[String], subject: &str, html: &str) -> Result<(), NotifyError>;
}

/// Rendered message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    pub subject: String,
    pub html: String,
}

/// Notifier used when notifications are disabled or nobody would receive them
#[derive(Debug, Clone, Default)]
pub struct DisabledNotifier;

#[async_trait]
impl Notifier for DisabledNotifier {
    async fn notify(&self, record: &BackupHistoryRecord) -> Result<(), NotifyError> {
        tracing::debug!(record_id = %record.id, "Notifications disabled, skipping");
        Ok(())
    }
}

/// Templated email notifier
#[derive(Clone)]
pub struct EmailNotifier {
    transport: Arc<dyn MailTransport>,
    recipients: Vec<String>,
}

impl EmailNotifier {
    pub fn new(transport: Arc<dyn MailTransport>, recipients: Vec<String>) -> Self {
        Self {
            transport,
            recipients,
        }
    }

    /// Build the notifier described by `config`.
    pub fn from_config(
        config: &NotificationConfig,
        timeout: Duration,
    ) -> Result<Arc<dyn Notifier>, AppError> {
        if !config.enabled || config.recipients.is_empty() {
            tracing::info!("Backup notifications disabled");
            return Ok(Arc::new(DisabledNotifier));
        }

        let transport = HttpMailTransport::new(
            &config.endpoint,
            config.api_key.clone(),
            &config.from,
            timeout,
        )?;
        Ok(Arc::new(Self::new(
            Arc::new(transport),
            config.recipients.clone(),
        )))
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    async fn notify(&self, record: &BackupHistoryRecord) -> Result<(), NotifyError> {
        if self.recipients.is_empty() {
            tracing::debug!(record_id = %record.id, "No notification recipients, skipping");
            return Ok(());
        }

        let message = render_message(record);
        self.transport
            .send(&self.recipients, &message.subject, &message.html)
            .await?;

        tracing::info!(
            record_id = %record.id,
            recipients = self.recipients.len(),
            subject = %message.subject,
            "Backup notification sent"
        );
        Ok(())
    }
}

/// HTTP mail API client
#[derive(Clone)]
pub struct HttpMailTransport {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    from: String,
}

impl HttpMailTransport {
    pub fn new(
        endpoint: &str,
        api_key: Option<String>,
        from: &str,
        timeout: Duration,
    ) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("marketvault/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Internal(e.into()))?;

        Ok(Self {
            http,
            endpoint: endpoint.to_string(),
            api_key,
            from: from.to_string(),
        })
    }
}

#[async_trait]
impl MailTransport for HttpMailTransport {
    async fn send(&self, to: &[String], subject: &str, html: &str) -> Result<(), NotifyError> {
        let body = serde_json::json!({
            "from": self.from,
            "to": to,
            "subject": subject,
            "html": html,
        });

        let mut request = self.http.post(&self.endpoint).json(&body);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            tracing::warn!(status = %status, body = %detail, "Mail endpoint rejected message");
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

/// Render the message for `record`.
pub fn render_message(record: &BackupHistoryRecord) -> MailMessage {
    match record.status {
        BackupStatus::Failed => render_failure(record),
        BackupStatus::Success | BackupStatus::Partial => render_summary(record),
    }
}

fn render_summary(record: &BackupHistoryRecord) -> MailMessage {
    let title = record.backup_type.title();
    let subject = format!("✅ {} backup completed ({})", title, record.status);

    let mut rows = vec![
        row("Status", record.status.as_str()),
        row("Kind", record.backup_kind.as_str()),
        row("File", record.file_name.as_deref().unwrap_or("-")),
        row("Size", &format_bytes(record.byte_size)),
        row("Duration", &format_duration(record.duration_ms)),
        row(
            "Units",
            &format!(
                "{} ({})",
                record.units_backed_up.len(),
                record.units_backed_up.join(", ")
            ),
        ),
    ];
    for (component, count) in &record.component_counts {
        rows.push(row(component, &count.to_string()));
    }
    if let Some(url) = record.destination_url.as_deref() {
        rows.push(row("Location", url));
    }
    rows.push(row(
        "Triggered by",
        record.triggered_by.as_deref().unwrap_or("scheduler"),
    ));
    rows.push(row("Run ID", &record.id));

    let warning = record
        .error_message
        .as_deref()
        .map(|message| {
            format!(
                "<p style=\"color:#b45309\"><strong>Some units failed:</strong> {}</p>",
                encode_text(message)
            )
        })
        .unwrap_or_default();

    let html = format!(
        "<h2>{} backup completed</h2>{}<table>{}</table><p>Completed at {}</p>",
        encode_text(title),
        warning,
        rows.concat(),
        encode_text(&record.created_at.to_rfc3339())
    );

    MailMessage { subject, html }
}

fn render_failure(record: &BackupHistoryRecord) -> MailMessage {
    let title = record.backup_type.title();
    let subject = format!("❌ {} backup FAILED", title);

    let rows = [
        row("Kind", record.backup_kind.as_str()),
        row("Duration", &format_duration(record.duration_ms)),
        row(
            "Triggered by",
            record.triggered_by.as_deref().unwrap_or("scheduler"),
        ),
        row("Run ID", &record.id),
    ];

    let html = format!(
        "<h2 style=\"color:#b91c1c\">{} backup FAILED</h2>\
         <pre style=\"background:#fef2f2;padding:12px\">{}</pre>\
         <table>{}</table><p>Failed at {}</p>",
        encode_text(title),
        encode_text(record.error_message.as_deref().unwrap_or("unknown error")),
        rows.concat(),
        encode_text(&record.created_at.to_rfc3339())
    );

    MailMessage { subject, html }
}

fn row(label: &str, value: &str) -> String {
    format!(
        "<tr><td><strong>{}</strong></td><td>{}</td></tr>",
        encode_text(label),
        encode_text(value)
    )
}

/// Human-readable byte size, binary units.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

fn format_duration(duration_ms: u64) -> String {
    format!("{:.1}s", duration_ms as f64 / 1000.0)
}
