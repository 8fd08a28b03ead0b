//! Axum routers for the job repository and every pipeline stage.
//!
//! Each service binary mounts one router, then [`finish`] adds the health
//! check, bearer-token auth on mutating routes and request tracing.

use std::sync::Arc;

use anyhow::Context;
use axum::body::Bytes;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{middleware, Json, Router};
use handoff_adapters::TokenVerifier;
use handoff_stages::{run_reconcile, Reconcile, ReconcileSummary};
use serde::de::DeserializeOwned;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

pub mod auth;
pub mod dispatch;
pub mod error;
pub mod intake;
pub mod jobs;
pub mod output;
pub mod tasks;
pub mod transfer;

pub use error::{AppError, AppResult};

pub const CRATE_NAME: &str = "handoff-web";

pub fn finish(router: Router, verifier: Option<Arc<TokenVerifier>>) -> Router {
    let router = router.route("/healthz", get(healthz));
    let router = match verifier {
        Some(verifier) => router.layer(middleware::from_fn_with_state(verifier, auth::require_bearer)),
        None => router,
    };
    router.layer(TraceLayer::new_for_http())
}

pub async fn serve(listener: TcpListener, router: Router) -> anyhow::Result<()> {
    let addr = listener.local_addr().context("reading bound address")?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, router).await.context("serving http")?;
    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

/// Decodes a JSON body. Malformed or unknown fields are a 400.
pub(crate) fn parse_json<T: DeserializeOwned>(body: &Bytes) -> AppResult<T> {
    serde_json::from_slice(body).map_err(|e| AppError::BadRequest(format!("invalid body: {e}")))
}

pub(crate) async fn retry(reconciler: &dyn Reconcile) -> AppResult<Json<ReconcileSummary>> {
    Ok(Json(run_reconcile(reconciler).await?))
}

pub(crate) fn text(status: StatusCode, body: impl Into<String>) -> (StatusCode, String) {
    (status, body.into())
}
