use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use handoff_core::Job;
use handoff_stages::{parse_timeout, run_reconcile, Dispatch, DispatchOutcome, ReconcileSummary};
use handoff_storage::TaskRepository;
use serde::Deserialize;
use tracing::info_span;
use tracing::Instrument;

use crate::{parse_json, tasks, text, AppError, AppResult};

#[derive(Debug, Default, Deserialize)]
struct RetryRequest {
    #[serde(rename = "TimeoutDuration", default)]
    timeout_duration: Option<String>,
}

/// Dispatch routes plus the task repository it hosts.
pub fn router(dispatch: Arc<Dispatch>, tasks: Arc<TaskRepository>) -> Router {
    Router::new()
        .route("/matchTask", post(match_task))
        .route("/handleNewJob", post(handle_new_job))
        .route("/pipelineStatus/{job_id}/{task_id}", post(pipeline_status))
        .route("/retry", post(retry_dispatch))
        .with_state(dispatch)
        .merge(tasks::router(tasks))
}

async fn match_task(State(dispatch): State<Arc<Dispatch>>, body: Bytes) -> AppResult<Json<bool>> {
    let job: Job = parse_json(&body)?;
    Ok(Json(dispatch.match_task(&job).await?))
}

async fn handle_new_job(
    State(dispatch): State<Arc<Dispatch>>,
    body: Bytes,
) -> AppResult<(StatusCode, String)> {
    let job: Job = parse_json(&body)?;
    Ok(match dispatch.handle_job(&job).await? {
        DispatchOutcome::Matched { job, .. } => text(StatusCode::OK, job.id),
        DispatchOutcome::NoPipeline(_) => text(StatusCode::NO_CONTENT, ""),
    })
}

async fn pipeline_status(
    State(dispatch): State<Arc<Dispatch>>,
    Path((job_id, task_id)): Path<(String, String)>,
    body: String,
) -> AppResult<StatusCode> {
    dispatch.pipeline_status(&job_id, &task_id, &body).await?;
    Ok(StatusCode::OK)
}

async fn retry_dispatch(
    State(dispatch): State<Arc<Dispatch>>,
    body: Bytes,
) -> AppResult<Json<ReconcileSummary>> {
    let request: RetryRequest = if body.iter().all(u8::is_ascii_whitespace) {
        RetryRequest::default()
    } else {
        parse_json(&body)?
    };
    let Some(raw) = request.timeout_duration else {
        return Ok(Json(run_reconcile(dispatch.as_ref()).await?));
    };

    let window = parse_timeout(&raw)
        .ok_or_else(|| AppError::BadRequest(format!("invalid TimeoutDuration {raw:?}")))?;
    let summary = dispatch
        .reconcile_with_window(window)
        .instrument(info_span!("reconcile", stage = "dispatch", window = %raw))
        .await?;
    Ok(Json(summary))
}
