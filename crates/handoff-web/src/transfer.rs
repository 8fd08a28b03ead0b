//! Edge-to-gateway input transfer: the input-sender and input-receiver services.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use handoff_adapters::{HEADER_CONTENT_SHA256, HEADER_FILENAME, HEADER_JOB_ID};
use handoff_core::Job;
use handoff_stages::{InputReceiver, InputSender, ReconcileSummary};

use crate::{parse_json, retry, text, AppError, AppResult};

pub fn input_sender_router(sender: Arc<InputSender>) -> Router {
    Router::new()
        .route("/handleNewJob", post(sender_handle_job))
        .route("/retry", post(sender_retry))
        .with_state(sender)
}

pub fn input_receiver_router(receiver: Arc<InputReceiver>) -> Router {
    Router::new()
        .route("/transmitJob", post(transmit_job))
        .route("/transmitFile", post(transmit_file))
        .route("/retry", post(receiver_retry))
        .with_state(receiver)
}

async fn sender_handle_job(
    State(sender): State<Arc<InputSender>>,
    body: Bytes,
) -> AppResult<(StatusCode, String)> {
    let job: Job = parse_json(&body)?;
    let job = sender.handle_job(&job).await?;
    Ok(text(StatusCode::OK, job.id))
}

async fn sender_retry(State(sender): State<Arc<InputSender>>) -> AppResult<Json<ReconcileSummary>> {
    retry(sender.as_ref()).await
}

async fn transmit_job(
    State(receiver): State<Arc<InputReceiver>>,
    body: Bytes,
) -> AppResult<StatusCode> {
    let job: Job = parse_json(&body)?;
    receiver.transmit_job(job).await?;
    Ok(StatusCode::OK)
}

fn required_header<'a>(headers: &'a HeaderMap, name: &str) -> AppResult<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::BadRequest(format!("missing {name} header")))
}

async fn transmit_file(
    State(receiver): State<Arc<InputReceiver>>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<(StatusCode, String)> {
    let file_name = required_header(&headers, HEADER_FILENAME)?;
    let job_id = required_header(&headers, HEADER_JOB_ID)?;
    let checksum = headers
        .get(HEADER_CONTENT_SHA256)
        .and_then(|v| v.to_str().ok());
    let job = receiver
        .transmit_file(job_id, file_name, checksum, &body)
        .await?;
    Ok(text(StatusCode::OK, job.id))
}

async fn receiver_retry(
    State(receiver): State<Arc<InputReceiver>>,
) -> AppResult<Json<ReconcileSummary>> {
    retry(receiver.as_ref()).await
}
