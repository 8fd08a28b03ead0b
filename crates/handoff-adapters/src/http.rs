//! HTTP implementations of the ports.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use handoff_core::{Job, JobPatch, Owner, PipelineParams, Task};
use handoff_storage::{CreateStatus, FileStore};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, info_span, Instrument};

use crate::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchedFile, InputTransfer, JobHandler,
    JobRepoPort, OutputSource, PipelineLauncher, PortError, RetryDisposition, TaskMatcherPort,
    TaskRepoPort, TokenSigner, HEADER_CONTENT_SHA256, HEADER_FILENAME, HEADER_JOB_ID,
};

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Shared outbound client. Idempotent reads are retried with backoff;
/// handoff calls are sent once and left to reconciliation.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    signer: Option<Arc<TokenSigner>>,
    backoff: BackoffPolicy,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig, signer: Option<TokenSigner>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            signer: signer.map(Arc::new),
            backoff: config.backoff,
        })
    }

    /// Sends the request and returns the response whatever its status.
    pub async fn execute<F>(
        &self,
        method: Method,
        url: &str,
        idempotent: bool,
        decorate: F,
    ) -> Result<Response, PortError>
    where
        F: Fn(RequestBuilder) -> RequestBuilder + Send + Sync,
    {
        let span = info_span!("http_call", %method, url);
        self.execute_with_retries(method, url, idempotent, decorate)
            .instrument(span)
            .await
    }

    async fn execute_with_retries<F>(
        &self,
        method: Method,
        url: &str,
        idempotent: bool,
        decorate: F,
    ) -> Result<Response, PortError>
    where
        F: Fn(RequestBuilder) -> RequestBuilder + Send + Sync,
    {
        let max_retries = if idempotent { self.backoff.max_retries } else { 0 };
        let mut attempt = 0;
        loop {
            let mut request = decorate(self.client.request(method.clone(), url));
            if let Some(signer) = &self.signer {
                let token = signer
                    .sign()
                    .map_err(|e| PortError::Invalid(format!("signing request: {e}")))?;
                request = request.bearer_auth(token);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if !status.is_success()
                        && classify_status(status) == RetryDisposition::Retryable
                        && attempt < max_retries
                    {
                        debug!(%status, attempt, "retrying");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < max_retries
                    {
                        debug!(error = %err, attempt, "retrying");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(err.into());
                }
            }
        }
    }

    /// Like [`execute`](Self::execute), but maps any non-success status to a [`PortError`].
    pub async fn send<F>(
        &self,
        method: Method,
        url: &str,
        idempotent: bool,
        decorate: F,
    ) -> Result<Response, PortError>
    where
        F: Fn(RequestBuilder) -> RequestBuilder + Send + Sync,
    {
        let resp = self.execute(method, url, idempotent, decorate).await?;
        ensure_success(resp).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, PortError> {
        let resp = self.send(Method::GET, url, true, |r| r).await?;
        Ok(resp.json().await?)
    }
}

async fn ensure_success(resp: Response) -> Result<Response, PortError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(PortError::from_status(status, body.trim().to_string()))
}

fn join(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

#[derive(Debug, Clone)]
pub struct HttpJobRepo {
    http: HttpClient,
    base: String,
}

impl HttpJobRepo {
    pub fn new(http: HttpClient, base: impl Into<String>) -> Self {
        Self {
            http,
            base: base.into(),
        }
    }
}

#[async_trait]
impl JobRepoPort for HttpJobRepo {
    async fn create(&self, job: Job) -> Result<(CreateStatus, Job), PortError> {
        let url = join(&self.base, "job");
        let resp = self
            .http
            .execute(Method::POST, &url, false, |r| r.json(&job))
            .await?;
        let status = resp.status();
        let created = match status {
            StatusCode::CREATED | StatusCode::OK => CreateStatus::Created,
            StatusCode::CONFLICT => CreateStatus::Exists,
            _ => {
                let body = resp.text().await.unwrap_or_default();
                return Err(PortError::from_status(status, body.trim()));
            }
        };
        let id = resp.text().await?.trim().to_string();
        let stored = JobRepoPort::get_by_id(self, &id).await?;
        Ok((created, stored))
    }

    async fn get_by_id(&self, id: &str) -> Result<Job, PortError> {
        self.http.get_json(&join(&self.base, &format!("job/{id}"))).await
    }

    async fn get_by_owner(&self, owner: Owner) -> Result<Vec<Job>, PortError> {
        self.http
            .get_json(&join(&self.base, &format!("job/owner/{owner}")))
            .await
    }

    async fn update(&self, id: &str, patch: &JobPatch) -> Result<Job, PortError> {
        let url = join(&self.base, &format!("job/{id}"));
        let resp = self
            .http
            .send(Method::PUT, &url, false, |r| r.json(patch))
            .await?;
        Ok(resp.json().await?)
    }
}

#[derive(Debug, Clone)]
pub struct HttpTaskRepo {
    http: HttpClient,
    base: String,
}

impl HttpTaskRepo {
    pub fn new(http: HttpClient, base: impl Into<String>) -> Self {
        Self {
            http,
            base: base.into(),
        }
    }
}

#[async_trait]
impl TaskRepoPort for HttpTaskRepo {
    async fn get_all(&self) -> Result<Vec<Task>, PortError> {
        self.http.get_json(&join(&self.base, "task")).await
    }

    async fn get_by_id(&self, id: &str) -> Result<Task, PortError> {
        self.http.get_json(&join(&self.base, &format!("task/{id}"))).await
    }
}

/// Hands a job to the stage behind `base` via `POST /handleNewJob`.
#[derive(Debug, Clone)]
pub struct HttpJobHandler {
    http: HttpClient,
    base: String,
}

impl HttpJobHandler {
    pub fn new(http: HttpClient, base: impl Into<String>) -> Self {
        Self {
            http,
            base: base.into(),
        }
    }
}

#[async_trait]
impl JobHandler for HttpJobHandler {
    async fn handle_job(&self, job: &Job) -> Result<(), PortError> {
        let url = join(&self.base, "handleNewJob");
        self.http
            .send(Method::POST, &url, false, |r| r.json(job))
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HttpTaskMatcher {
    http: HttpClient,
    base: String,
}

impl HttpTaskMatcher {
    pub fn new(http: HttpClient, base: impl Into<String>) -> Self {
        Self {
            http,
            base: base.into(),
        }
    }
}

#[async_trait]
impl TaskMatcherPort for HttpTaskMatcher {
    async fn match_task(&self, job: &Job) -> Result<bool, PortError> {
        let url = join(&self.base, "matchTask");
        let resp = self
            .http
            .send(Method::POST, &url, true, |r| r.json(job))
            .await?;
        Ok(resp.json().await?)
    }
}

#[derive(Debug, Clone)]
pub struct HttpInputTransfer {
    http: HttpClient,
    base: String,
}

impl HttpInputTransfer {
    pub fn new(http: HttpClient, base: impl Into<String>) -> Self {
        Self {
            http,
            base: base.into(),
        }
    }
}

#[async_trait]
impl InputTransfer for HttpInputTransfer {
    async fn transmit_job(&self, job: &Job) -> Result<(), PortError> {
        let url = join(&self.base, "transmitJob");
        self.http
            .send(Method::POST, &url, true, |r| r.json(job))
            .await?;
        Ok(())
    }

    async fn transmit_file(
        &self,
        job_id: &str,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<(), PortError> {
        let url = join(&self.base, "transmitFile");
        let checksum = FileStore::sha256_hex(&bytes);
        self.http
            .send(Method::POST, &url, true, |r| {
                r.header(HEADER_FILENAME, file_name)
                    .header(HEADER_JOB_ID, job_id)
                    .header(HEADER_CONTENT_SHA256, &checksum)
                    .body(bytes.clone())
            })
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HttpOutputSource {
    http: HttpClient,
    base: String,
}

impl HttpOutputSource {
    pub fn new(http: HttpClient, base: impl Into<String>) -> Self {
        Self {
            http,
            base: base.into(),
        }
    }
}

#[async_trait]
impl OutputSource for HttpOutputSource {
    async fn fetch_file(&self, job_id: &str, index: usize) -> Result<FetchedFile, PortError> {
        let url = join(&self.base, &format!("file/{job_id}/{index}"));
        let resp = self.http.send(Method::GET, &url, true, |r| r).await?;
        let sha256 = resp
            .headers()
            .get(HEADER_CONTENT_SHA256)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = resp.bytes().await?.to_vec();
        Ok(FetchedFile { bytes, sha256 })
    }

    async fn archive(&self, job_id: &str) -> Result<(), PortError> {
        let url = join(&self.base, &format!("archiveFile/{job_id}"));
        self.http.send(Method::POST, &url, false, |r| r).await?;
        Ok(())
    }
}

/// Posts launch parameters to `{base}/{pipeline_id}`.
#[derive(Debug, Clone)]
pub struct HttpPipelineLauncher {
    http: HttpClient,
    base: String,
}

impl HttpPipelineLauncher {
    pub fn new(http: HttpClient, base: impl Into<String>) -> Self {
        Self {
            http,
            base: base.into(),
        }
    }
}

#[async_trait]
impl PipelineLauncher for HttpPipelineLauncher {
    async fn launch(&self, pipeline_id: &str, params: &PipelineParams) -> Result<(), PortError> {
        let url = join(&self.base, pipeline_id);
        self.http
            .send(Method::POST, &url, false, |r| r.json(params))
            .await?;
        Ok(())
    }
}
