//! Bearer-token check for mutating routes.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, Method};
use axum::middleware::Next;
use axum::response::Response;
use handoff_adapters::TokenVerifier;

use crate::AppError;

/// Reads pass through; everything else needs a valid `Authorization: Bearer` token.
pub async fn require_bearer(
    State(verifier): State<Arc<TokenVerifier>>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if matches!(*request.method(), Method::GET | Method::HEAD) {
        return Ok(next.run(request).await);
    }

    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| AppError::Unauthorized("missing bearer token".into()))?;
    verifier.verify(token).map_err(|err| {
        tracing::debug!(error = %err, "token rejected");
        AppError::Unauthorized("invalid or expired token".into())
    })?;
    Ok(next.run(request).await)
}
