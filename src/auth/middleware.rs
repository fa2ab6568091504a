//! Authentication extractor
//!
//! Protects backup routes: only operators holding the configured admin
//! capability may trigger runs or read history.

use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::{HeaderMap, request::Parts},
};

use super::session::{OperatorSession, verify_session_token};
use crate::AppState;
use crate::error::AppError;

fn extract_token_from_headers(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

fn authorize(headers: &HeaderMap, state: &AppState) -> Result<OperatorSession, AppError> {
    let token = extract_token_from_headers(headers).ok_or(AppError::Unauthorized)?;
    let session = verify_session_token(token, &state.config.auth.session_secret)?;

    if !session.has_capability(&state.config.auth.admin_capability) {
        tracing::warn!(
            operator_id = %session.operator_id,
            "Operator lacks admin capability"
        );
        return Err(AppError::Forbidden);
    }

    Ok(session)
}

/// Extractor for the current authorized operator
///
/// # Usage
/// ```ignore
/// async fn handler(
///     CurrentOperator(session): CurrentOperator,
/// ) -> impl IntoResponse {
///     format!("Hello, {}", session.email)
/// }
/// ```
#[derive(Debug, Clone)]
pub struct CurrentOperator(pub OperatorSession);

#[async_trait]
impl<S> FromRequestParts<S> for CurrentOperator
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        if let Some(session) = parts.extensions.get::<OperatorSession>().cloned() {
            return Ok(CurrentOperator(session));
        }

        let state = AppState::from_ref(state);
        let session = authorize(&parts.headers, &state)?;
        parts.extensions.insert(session.clone());

        Ok(CurrentOperator(session))
    }
}
