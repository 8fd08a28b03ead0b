//! Port contracts between stages, plus their HTTP and in-process implementations.
//!
//! A controller only ever talks to its neighbours through these traits, so the
//! same controller runs against a remote repository in production and against
//! an in-memory one in tests.

use std::time::Duration;

use async_trait::async_trait;
use handoff_core::{Job, JobPatch, Owner, PipelineParams, Task};
use handoff_storage::{CreateStatus, JobRepository, RepoError, StoreError, TaskRepository};
use reqwest::StatusCode;
use thiserror::Error;

pub mod auth;
pub mod http;

pub use auth::{AuthError, Claims, TokenSigner, TokenVerifier};
pub use http::{
    HttpClient, HttpClientConfig, HttpInputTransfer, HttpJobHandler, HttpJobRepo,
    HttpOutputSource, HttpPipelineLauncher, HttpTaskMatcher, HttpTaskRepo,
};

pub const CRATE_NAME: &str = "handoff-adapters";

pub const HEADER_FILENAME: &str = "filename";
pub const HEADER_JOB_ID: &str = "jobid";
pub const HEADER_CONTENT_SHA256: &str = "x-content-sha256";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid: {0}")]
    Invalid(String),
}

impl PortError {
    /// Connectivity failures leave the job retryable rather than failed.
    pub fn is_network(&self) -> bool {
        matches!(self, PortError::Unavailable(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, PortError::Conflict(_))
    }

    pub fn from_status(status: StatusCode, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            StatusCode::NOT_FOUND => PortError::NotFound(message),
            StatusCode::CONFLICT => PortError::Conflict(message),
            s if classify_status(s) == RetryDisposition::Retryable => {
                PortError::Unavailable(format!("{s}: {message}"))
            }
            s => PortError::Rejected {
                status: s.as_u16(),
                message,
            },
        }
    }
}

impl From<reqwest::Error> for PortError {
    fn from(err: reqwest::Error) -> Self {
        match classify_reqwest_error(&err) {
            RetryDisposition::Retryable => PortError::Unavailable(err.to_string()),
            RetryDisposition::NonRetryable => match err.status() {
                Some(status) => PortError::from_status(status, err.to_string()),
                None => PortError::Invalid(err.to_string()),
            },
        }
    }
}

impl From<RepoError> for PortError {
    fn from(err: RepoError) -> Self {
        match err {
            RepoError::NotFound { .. } => PortError::NotFound(err.to_string()),
            RepoError::Conflict { .. } => PortError::Conflict(err.to_string()),
            RepoError::AlreadyHasId | RepoError::Invalid(_) => PortError::Invalid(err.to_string()),
            RepoError::Store(StoreError::Conflict) => PortError::Conflict(err.to_string()),
            RepoError::DeleteIncomplete { .. } | RepoError::Store(_) => {
                PortError::Unavailable(err.to_string())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[async_trait]
pub trait JobRepoPort: Send + Sync {
    async fn create(&self, job: Job) -> Result<(CreateStatus, Job), PortError>;
    async fn get_by_id(&self, id: &str) -> Result<Job, PortError>;
    async fn get_by_owner(&self, owner: Owner) -> Result<Vec<Job>, PortError>;
    async fn update(&self, id: &str, patch: &JobPatch) -> Result<Job, PortError>;
}

#[async_trait]
pub trait TaskRepoPort: Send + Sync {
    async fn get_all(&self) -> Result<Vec<Task>, PortError>;
    async fn get_by_id(&self, id: &str) -> Result<Task, PortError>;
}

/// The next stage's `/handleNewJob` endpoint.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle_job(&self, job: &Job) -> Result<(), PortError>;
}

#[async_trait]
pub trait TaskMatcherPort: Send + Sync {
    async fn match_task(&self, job: &Job) -> Result<bool, PortError>;
}

/// Input-file transmission from the edge sender to the gateway receiver.
#[async_trait]
pub trait InputTransfer: Send + Sync {
    async fn transmit_job(&self, job: &Job) -> Result<(), PortError>;
    async fn transmit_file(
        &self,
        job_id: &str,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<(), PortError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedFile {
    pub bytes: Vec<u8>,
    pub sha256: Option<String>,
}

/// Output-file side of the gateway, pulled by the edge receiver.
#[async_trait]
pub trait OutputSource: Send + Sync {
    async fn fetch_file(&self, job_id: &str, index: usize) -> Result<FetchedFile, PortError>;
    async fn archive(&self, job_id: &str) -> Result<(), PortError>;
}

#[async_trait]
pub trait PipelineLauncher: Send + Sync {
    async fn launch(&self, pipeline_id: &str, params: &PipelineParams) -> Result<(), PortError>;
}

#[async_trait]
impl JobRepoPort for JobRepository {
    async fn create(&self, job: Job) -> Result<(CreateStatus, Job), PortError> {
        Ok(JobRepository::create(self, job).await?)
    }

    async fn get_by_id(&self, id: &str) -> Result<Job, PortError> {
        Ok(JobRepository::get_by_id(self, id).await?)
    }

    async fn get_by_owner(&self, owner: Owner) -> Result<Vec<Job>, PortError> {
        Ok(JobRepository::get_by_owner(self, owner).await?)
    }

    async fn update(&self, id: &str, patch: &JobPatch) -> Result<Job, PortError> {
        Ok(JobRepository::update(self, id, patch).await?)
    }
}

#[async_trait]
impl TaskRepoPort for TaskRepository {
    async fn get_all(&self) -> Result<Vec<Task>, PortError> {
        Ok(TaskRepository::get_all(self).await?)
    }

    async fn get_by_id(&self, id: &str) -> Result<Task, PortError> {
        Ok(TaskRepository::get_by_id(self, id).await?)
    }
}
