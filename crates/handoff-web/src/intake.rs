use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use handoff_core::Job;
use handoff_stages::{Intake, IntakeOutcome, ReconcileSummary};

use crate::{parse_json, retry, text, AppResult};

pub fn router(intake: Arc<Intake>) -> Router {
    Router::new()
        .route("/notifyNewFile", post(notify_new_file))
        .route("/retry", post(retry_intake))
        .with_state(intake)
}

async fn notify_new_file(
    State(intake): State<Arc<Intake>>,
    body: Bytes,
) -> AppResult<(StatusCode, String)> {
    let job: Job = parse_json(&body)?;
    Ok(match intake.notify_new_file(job).await? {
        IntakeOutcome::Forwarded(job) => text(StatusCode::OK, job.id),
        IntakeOutcome::NoPipeline(_) => text(StatusCode::NO_CONTENT, ""),
        IntakeOutcome::AlreadyProcessed(job) => text(StatusCode::ALREADY_REPORTED, job.id),
    })
}

async fn retry_intake(State(intake): State<Arc<Intake>>) -> AppResult<Json<ReconcileSummary>> {
    retry(intake.as_ref()).await
}
