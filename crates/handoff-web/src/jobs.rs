//! Job repository service: `/job` CRUD plus the pipeline write-back route.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, put};
use axum::{Json, Router};
use handoff_core::{Job, JobPatch, Owner, PipelineDetails};
use handoff_storage::{CreateStatus, JobRepository};

use crate::{parse_json, text, AppError, AppResult};

pub fn router(repo: Arc<JobRepository>) -> Router {
    Router::new()
        .route("/job", get(list_jobs).post(create_job))
        .route("/job/owner/{owner}", get(jobs_by_owner))
        .route("/job/{job_id}", get(get_job).put(update_job).delete(delete_job))
        .route("/job/{job_id}/pipeline/{task_id}", put(report_pipeline))
        .with_state(repo)
}

async fn create_job(
    State(repo): State<Arc<JobRepository>>,
    body: Bytes,
) -> AppResult<(StatusCode, String)> {
    let job: Job = parse_json(&body)?;
    let (status, job) = repo.create(job).await?;
    Ok(match status {
        CreateStatus::Created => text(StatusCode::CREATED, job.id),
        CreateStatus::Exists => text(StatusCode::CONFLICT, job.id),
    })
}

async fn list_jobs(State(repo): State<Arc<JobRepository>>) -> AppResult<Json<Vec<Job>>> {
    Ok(Json(repo.get_all().await?))
}

async fn get_job(
    State(repo): State<Arc<JobRepository>>,
    Path(job_id): Path<String>,
) -> AppResult<Json<Job>> {
    Ok(Json(repo.get_by_id(&job_id).await?))
}

async fn jobs_by_owner(
    State(repo): State<Arc<JobRepository>>,
    Path(owner): Path<String>,
) -> AppResult<Json<Vec<Job>>> {
    let owner: Owner = owner
        .parse()
        .map_err(|e: handoff_core::ValidationError| AppError::BadRequest(e.to_string()))?;
    Ok(Json(repo.get_by_owner(owner).await?))
}

async fn update_job(
    State(repo): State<Arc<JobRepository>>,
    Path(job_id): Path<String>,
    body: Bytes,
) -> AppResult<Json<Job>> {
    let patch: JobPatch = parse_json(&body)?;
    Ok(Json(repo.update(&job_id, &patch).await?))
}

async fn delete_job(
    State(repo): State<Arc<JobRepository>>,
    Path(job_id): Path<String>,
) -> AppResult<StatusCode> {
    repo.delete(&job_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Written by the pipeline before it calls dispatch's status route.
async fn report_pipeline(
    State(repo): State<Arc<JobRepository>>,
    Path((job_id, task_id)): Path<(String, String)>,
    body: Bytes,
) -> AppResult<Json<Job>> {
    let details: PipelineDetails = parse_json(&body)?;
    let Some(status) = details.status.filter(|s| s.is_finished()) else {
        return Err(AppError::BadRequest(
            "pipeline status must be Complete or Failed".into(),
        ));
    };
    if !details.task_id.is_empty() && details.task_id != task_id {
        return Err(AppError::BadRequest(format!(
            "body task {} does not match {task_id}",
            details.task_id
        )));
    }
    let job = repo.get_by_id(&job_id).await?;
    if job.pipeline_details.task_id != task_id {
        return Err(AppError::BadRequest(format!(
            "job {job_id} is not running task {task_id}"
        )));
    }

    let patch = JobPatch::new()
        .pipeline_status(status)
        .qc_flags(details.qc_flags)
        .output_files(details.output_files)
        .results(details.results);
    Ok(Json(repo.update(&job_id, &patch).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use handoff_core::{FileInfo, PipelineStatus};
    use handoff_storage::MemoryStore;
    use http_body_util::BodyExt;
    use serde_json::json;
    use tower::ServiceExt;

    fn repo() -> Arc<JobRepository> {
        Arc::new(JobRepository::new(Arc::new(MemoryStore::new())))
    }

    fn request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_text(resp: axum::response::Response) -> String {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn new_job() -> serde_json::Value {
        json!({
            "Owner": "intake",
            "InputFile": {"Hostname": "gw", "DirName": "/in", "Name": "x.tiff", "Extension": "tiff"}
        })
    }

    #[tokio::test]
    async fn create_returns_id_and_conflicts_on_duplicate_file() {
        let repo = repo();
        let app = router(repo.clone());

        let first = app.clone().oneshot(request("POST", "/job", new_job())).await.unwrap();
        assert_eq!(first.status(), StatusCode::CREATED);
        let id = body_text(first).await;

        let second = app.clone().oneshot(request("POST", "/job", new_job())).await.unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);
        assert_eq!(body_text(second).await, id);

        let invalid = app
            .oneshot(request("POST", "/job", json!({"InputFile": {"Hostname": "gw"}})))
            .await
            .unwrap();
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn owner_listing_rejects_unknown_owners() {
        let app = router(repo());
        app.clone().oneshot(request("POST", "/job", new_job())).await.unwrap();

        let listed = app
            .clone()
            .oneshot(Request::builder().uri("/job/owner/intake").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let jobs: Vec<Job> = serde_json::from_str(&body_text(listed).await).unwrap();
        assert_eq!(jobs.len(), 1);

        let unknown = app
            .oneshot(Request::builder().uri("/job/owner/robot").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(unknown.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn patch_uses_dotted_keys_and_rejects_unknown_ones() {
        let repo = repo();
        let app = router(repo.clone());
        let (_, job) = repo
            .create(Job {
                input_file: FileInfo {
                    hostname: "gw".into(),
                    dir_name: "/in".into(),
                    name: "x.tiff".into(),
                    extension: "tiff".into(),
                    ..Default::default()
                },
                ..Default::default()
            })
            .await
            .unwrap();
        let uri = format!("/job/{}", job.id);

        let ok = app
            .clone()
            .oneshot(request("PUT", &uri, json!({"Owner": "dispatch", "PipelineDetails.TaskId": "t1"})))
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        let updated: Job = serde_json::from_str(&body_text(ok).await).unwrap();
        assert_eq!(updated.owner, Owner::Dispatch);
        assert_eq!(updated.pipeline_details.task_id, "t1");

        let unknown = app
            .clone()
            .oneshot(request("PUT", &uri, json!({"PipelineDetails.Bogus": 1})))
            .await
            .unwrap();
        assert_eq!(unknown.status(), StatusCode::BAD_REQUEST);

        let missing = app
            .oneshot(request("PUT", "/job/nope", json!({"Owner": "none"})))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn pipeline_write_back_checks_task_and_status() {
        let repo = repo();
        let app = router(repo.clone());
        let (_, job) = repo
            .create(serde_json::from_value(new_job()).unwrap())
            .await
            .unwrap();
        repo.update(&job.id, &JobPatch::new().task_id("t1")).await.unwrap();
        let uri = format!("/job/{}/pipeline/t1", job.id);

        let processing = app
            .clone()
            .oneshot(request("PUT", &uri, json!({"Status": "Processing"})))
            .await
            .unwrap();
        assert_eq!(processing.status(), StatusCode::BAD_REQUEST);

        let wrong_task = app
            .clone()
            .oneshot(request(
                "PUT",
                &format!("/job/{}/pipeline/t2", job.id),
                json!({"Status": "Complete"}),
            ))
            .await
            .unwrap();
        assert_eq!(wrong_task.status(), StatusCode::BAD_REQUEST);

        let done = app
            .oneshot(request(
                "PUT",
                &uri,
                json!({"Status": "Complete", "QCFlags": "ok", "OutputFiles": [{"DirName": "/out", "Name": "a.csv"}]}),
            ))
            .await
            .unwrap();
        assert_eq!(done.status(), StatusCode::OK);
        let stored = repo.get_by_id(&job.id).await.unwrap();
        assert_eq!(stored.pipeline_details.status, Some(PipelineStatus::Complete));
        assert_eq!(stored.pipeline_details.qc_flags, "ok");
        assert_eq!(stored.pipeline_details.output_files.len(), 1);
    }

    #[tokio::test]
    async fn delete_then_get_is_not_found() {
        let repo = repo();
        let app = router(repo.clone());
        let (_, job) = repo
            .create(serde_json::from_value(new_job()).unwrap())
            .await
            .unwrap();
        let uri = format!("/job/{}", job.id);

        let deleted = app
            .clone()
            .oneshot(Request::builder().method("DELETE").uri(&uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(deleted.status(), StatusCode::NO_CONTENT);
        let gone = app
            .oneshot(Request::builder().uri(&uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(gone.status(), StatusCode::NOT_FOUND);
    }
}
