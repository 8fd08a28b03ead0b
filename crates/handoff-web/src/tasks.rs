//! Task repository routes, mounted by dispatch.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use handoff_core::Task;
use handoff_storage::TaskRepository;

use crate::{parse_json, text, AppResult};

pub fn router(repo: Arc<TaskRepository>) -> Router {
    Router::new()
        .route("/task", get(list_tasks).post(create_task).put(update_task))
        .route(
            "/task/{task_id}",
            get(get_task).put(update_task_at).delete(delete_task),
        )
        .with_state(repo)
}

async fn create_task(
    State(repo): State<Arc<TaskRepository>>,
    body: Bytes,
) -> AppResult<(StatusCode, String)> {
    let task: Task = parse_json(&body)?;
    let task = repo.create(task).await?;
    Ok(text(StatusCode::CREATED, task.id))
}

async fn list_tasks(State(repo): State<Arc<TaskRepository>>) -> AppResult<Json<Vec<Task>>> {
    Ok(Json(repo.get_all().await?))
}

async fn get_task(
    State(repo): State<Arc<TaskRepository>>,
    Path(task_id): Path<String>,
) -> AppResult<Json<Task>> {
    Ok(Json(repo.get_by_id(&task_id).await?))
}

async fn update_task(
    State(repo): State<Arc<TaskRepository>>,
    body: Bytes,
) -> AppResult<Json<Task>> {
    let task: Task = parse_json(&body)?;
    Ok(Json(repo.update(&task).await?))
}

async fn update_task_at(
    State(repo): State<Arc<TaskRepository>>,
    Path(task_id): Path<String>,
    body: Bytes,
) -> AppResult<Json<Task>> {
    let mut task: Task = parse_json(&body)?;
    task.id = task_id;
    Ok(Json(repo.update(&task).await?))
}

async fn delete_task(
    State(repo): State<Arc<TaskRepository>>,
    Path(task_id): Path<String>,
) -> AppResult<StatusCode> {
    repo.delete(&task_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
