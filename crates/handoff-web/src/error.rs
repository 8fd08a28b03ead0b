use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use handoff_stages::{ErrorKind, StageError};
use handoff_storage::{RepoError, StoreError};
use serde_json::json;

/// Error returned by every handler. Renders as `{"error", "code"}`.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Stage(#[from] StageError),

    #[error(transparent)]
    Repo(#[from] RepoError),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn status(&self) -> StatusCode {
        self.classify().0
    }

    fn classify(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Stage(err) => match err.kind() {
                ErrorKind::BadRequest => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
                ErrorKind::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND"),
                ErrorKind::Conflict => (StatusCode::CONFLICT, "CONFLICT"),
                ErrorKind::BadGateway => (StatusCode::BAD_GATEWAY, "BAD_GATEWAY"),
                ErrorKind::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            },
            AppError::Repo(err) => match err {
                RepoError::NotFound { .. } => (StatusCode::NOT_FOUND, "NOT_FOUND"),
                RepoError::AlreadyHasId | RepoError::Invalid(_) => {
                    (StatusCode::BAD_REQUEST, "VALIDATION_ERROR")
                }
                RepoError::Conflict { .. } | RepoError::Store(StoreError::Conflict) => {
                    (StatusCode::CONFLICT, "CONFLICT")
                }
                RepoError::DeleteIncomplete { .. } | RepoError::Store(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
                }
            },
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            AppError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.classify();
        let message = if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
            match &self {
                AppError::Stage(StageError::Forward { .. }) => self.to_string(),
                _ => "an internal error occurred".to_string(),
            }
        } else {
            self.to_string()
        };

        let body = json!({
            "error": message,
            "code": code,
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use handoff_adapters::PortError;

    #[test]
    fn statuses_follow_error_kinds() {
        assert_eq!(
            AppError::from(StageError::Invalid("x".into())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::from(StageError::forward("dispatch", PortError::Unavailable("x".into())))
                .status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            AppError::from(RepoError::Conflict {
                entity: "job",
                id: "1".into()
            })
            .status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::from(RepoError::Store(StoreError::Unavailable("down".into()))).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
