//! Admin API endpoints
//!
//! Backup triggers and history.
//! All routes require an operator with the admin capability.

use axum::{
    Router,
    body::Bytes,
    extract::{Query, State},
    response::Json,
    routing::{get, post},
};
use serde::Deserialize;

use crate::AppState;
use crate::auth::CurrentOperator;
use crate::backup::{BackupHistoryRecord, BackupKind, InjectedFault, RunRequest};
use crate::error::AppError;

const DEFAULT_HISTORY_LIMIT: u32 = 20;
const MAX_HISTORY_LIMIT: u32 = 100;

/// Create admin router
///
/// Routes:
/// - POST /admin/backups/database - Run a database snapshot
/// - POST /admin/backups/media - Run a media snapshot
/// - GET /admin/backups - Recent backup history
pub fn admin_router() -> Router<AppState> {
    Router::new()
        .route("/backups", get(list_backups))
        .route("/backups/database", post(trigger_database_backup))
        .route("/backups/media", post(trigger_media_backup))
}

/// Trigger request body
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TriggerRequest {
    pub kind: BackupKind,
    /// Fail the database run after collection, before upload
    pub simulate_failure: bool,
}

/// Parse an optional trigger body. An empty body means the defaults;
/// anything else must be a valid [`TriggerRequest`].
fn parse_trigger(body: &[u8]) -> Result<TriggerRequest, AppError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(TriggerRequest::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| AppError::Validation(format!("invalid trigger body: {}", e)))
}

/// POST /admin/backups/database
///
/// Runs to completion inside the request. The response carries the history
/// record, whatever its status.
async fn trigger_database_backup(
    State(state): State<AppState>,
    CurrentOperator(operator): CurrentOperator,
    body: Bytes,
) -> Result<Json<BackupHistoryRecord>, AppError> {
    let body = parse_trigger(&body)?;
    let request = RunRequest::new(body.kind, Some(operator.email.clone()));

    tracing::info!(
        operator_id = %operator.operator_id,
        kind = %body.kind,
        simulate_failure = body.simulate_failure,
        "Database backup requested"
    );

    let record = if body.simulate_failure {
        state
            .database_job
            .as_ref()
            .clone()
            .with_injected_fault(InjectedFault::AfterCollection)
            .run(request)
            .await
    } else {
        state.database_job.run(request).await
    };

    Ok(Json(record))
}

/// POST /admin/backups/media
async fn trigger_media_backup(
    State(state): State<AppState>,
    CurrentOperator(operator): CurrentOperator,
    body: Bytes,
) -> Result<Json<BackupHistoryRecord>, AppError> {
    let body = parse_trigger(&body)?;
    if body.simulate_failure {
        return Err(AppError::Validation(
            "simulateFailure is only supported for database backups".to_string(),
        ));
    }

    tracing::info!(
        operator_id = %operator.operator_id,
        kind = %body.kind,
        "Media backup requested"
    );

    let record = state
        .media_job
        .run(RunRequest::new(body.kind, Some(operator.email)))
        .await;

    Ok(Json(record))
}

/// History query parameters
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<u32>,
}

/// GET /admin/backups
///
/// Most recent runs first.
async fn list_backups(
    State(state): State<AppState>,
    CurrentOperator(_operator): CurrentOperator,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<BackupHistoryRecord>>, AppError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    let records = state.history.recent(limit).await?;
    Ok(Json(records))
}
