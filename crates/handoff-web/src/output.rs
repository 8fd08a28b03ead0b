//! Gateway-to-edge output transfer: the output-sender and output-receiver services.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use handoff_adapters::HEADER_CONTENT_SHA256;
use handoff_core::Job;
use handoff_stages::{OutputReceiver, OutputSender, ReconcileSummary};

use crate::{parse_json, retry, text, AppResult};

pub fn output_sender_router(sender: Arc<OutputSender>) -> Router {
    Router::new()
        .route("/handleNewJob", post(sender_handle_job))
        .route("/file/{job_id}/{file_id}", get(serve_file))
        .route("/archiveFile/{job_id}", post(archive_file))
        .route("/rejectFile/{job_id}", post(reject_file).delete(unreject_file))
        .route("/retry", post(sender_retry))
        .with_state(sender)
}

pub fn output_receiver_router(receiver: Arc<OutputReceiver>) -> Router {
    Router::new()
        .route("/handleNewJob", post(receiver_handle_job))
        .route("/retry", post(receiver_retry))
        .with_state(receiver)
}

async fn sender_handle_job(
    State(sender): State<Arc<OutputSender>>,
    body: Bytes,
) -> AppResult<(StatusCode, String)> {
    let job: Job = parse_json(&body)?;
    let job = sender.handle_job(&job).await?;
    Ok(text(StatusCode::OK, job.id))
}

async fn serve_file(
    State(sender): State<Arc<OutputSender>>,
    Path((job_id, file_id)): Path<(String, usize)>,
) -> AppResult<(HeaderMap, Vec<u8>)> {
    let (bytes, sha256) = sender.file(&job_id, file_id).await?;
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    if let Ok(value) = HeaderValue::from_str(&sha256) {
        headers.insert(HEADER_CONTENT_SHA256, value);
    }
    Ok((headers, bytes))
}

async fn archive_file(
    State(sender): State<Arc<OutputSender>>,
    Path(job_id): Path<String>,
) -> AppResult<Json<Job>> {
    Ok(Json(sender.archive(&job_id).await?))
}

async fn reject_file(
    State(sender): State<Arc<OutputSender>>,
    Path(job_id): Path<String>,
) -> AppResult<(StatusCode, String)> {
    let path = sender.reject(&job_id).await?;
    Ok(text(StatusCode::OK, path.display().to_string()))
}

async fn unreject_file(
    State(sender): State<Arc<OutputSender>>,
    Path(job_id): Path<String>,
) -> AppResult<StatusCode> {
    sender.unreject(&job_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn sender_retry(State(sender): State<Arc<OutputSender>>) -> AppResult<Json<ReconcileSummary>> {
    retry(sender.as_ref()).await
}

async fn receiver_handle_job(
    State(receiver): State<Arc<OutputReceiver>>,
    body: Bytes,
) -> AppResult<(StatusCode, String)> {
    let job: Job = parse_json(&body)?;
    let job = receiver.handle_job(&job).await?;
    Ok(text(StatusCode::OK, job.id))
}

async fn receiver_retry(
    State(receiver): State<Arc<OutputReceiver>>,
) -> AppResult<Json<ReconcileSummary>> {
    retry(receiver.as_ref()).await
}
