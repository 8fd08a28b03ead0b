//! Gateway-side stage that lands input files sent from the edge.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use handoff_adapters::{BackoffPolicy, JobHandler, JobRepoPort};
use handoff_core::{ensure_plain_file_name, messages, Job, JobPatch, JobStatus, Owner};
use handoff_storage::FileStore;
use tracing::{debug, info, warn};

use crate::{file_exists, persist, Disposition, JobCache, Reconcile, ReconcileSummary, StageError};

/// Directory marker separating the edge-local prefix from the part kept on the gateway.
const INPUT_MARKER: &str = "/input/";

#[derive(Clone)]
pub struct InputReceiver {
    jobs: Arc<dyn JobRepoPort>,
    next: Arc<dyn JobHandler>,
    cache: JobCache,
    files: FileStore,
    hostname: String,
    backoff: BackoffPolicy,
}

impl InputReceiver {
    pub fn new(
        jobs: Arc<dyn JobRepoPort>,
        next: Arc<dyn JobHandler>,
        input_folder: impl Into<PathBuf>,
        hostname: impl Into<String>,
    ) -> Self {
        Self {
            jobs,
            next,
            cache: JobCache::new(),
            files: FileStore::new(input_folder),
            hostname: hostname.into(),
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn cache(&self) -> &JobCache {
        &self.cache
    }

    pub async fn transmit_job(&self, job: Job) -> Result<(), StageError> {
        if job.id.is_empty() {
            return Err(StageError::Invalid("job id must not be empty".into()));
        }
        debug!(job_id = %job.id, "job announced");
        self.cache.insert(job).await;
        Ok(())
    }

    /// Lands the file, then forwards the job to dispatch in the background.
    pub async fn transmit_file(
        &self,
        job_id: &str,
        file_name: &str,
        checksum: Option<&str>,
        bytes: &[u8],
    ) -> Result<Job, StageError> {
        let job = self.receive_file(job_id, file_name, checksum, bytes).await?;
        let this = self.clone();
        let background = job.clone();
        tokio::spawn(async move {
            if let Err(err) = this.forward(&background).await {
                warn!(job_id = %background.id, error = %err, "handoff to dispatch failed");
            }
        });
        Ok(job)
    }

    pub async fn receive_file(
        &self,
        job_id: &str,
        file_name: &str,
        checksum: Option<&str>,
        bytes: &[u8],
    ) -> Result<Job, StageError> {
        ensure_plain_file_name(file_name)?;
        let job = match self.cache.get(job_id).await {
            Some(job) => job,
            None => self.jobs.get_by_id(job_id).await.map_err(StageError::Repo)?,
        };
        if job.input_file.name != file_name {
            return Err(StageError::Invalid(format!(
                "file {file_name:?} does not belong to job {job_id}"
            )));
        }
        if let Some(expected) = checksum {
            let actual = FileStore::sha256_hex(bytes);
            if !expected.eq_ignore_ascii_case(&actual) {
                return Err(StageError::Invalid(format!(
                    "checksum mismatch for {file_name}: expected {expected}, got {actual}"
                )));
            }
        }

        let relative = target_dir(&job.input_file.dir_name)?;
        let stored = self
            .files
            .write_atomic(&relative, file_name, bytes)
            .await
            .map_err(|err| StageError::Internal(format!("{err:#}")))?;
        let dir_name = stored
            .path
            .parent()
            .unwrap_or(self.files.root())
            .display()
            .to_string();

        let patch = JobPatch::new()
            .owner(Owner::InputReceiver)
            .input_location(self.hostname.clone(), dir_name)
            .status(JobStatus::Incomplete)
            .clear_error();
        let job = persist(self.jobs.as_ref(), &self.backoff, job_id, &patch).await?;
        self.cache.remove(job_id).await;
        info!(job_id, path = %stored.path.display(), bytes = stored.byte_size, "input file received");
        Ok(job)
    }

    pub async fn forward(&self, job: &Job) -> Result<(), StageError> {
        self.next
            .handle_job(job)
            .await
            .map_err(|err| StageError::forward("dispatch", err))
    }

    async fn revalidate(&self, job: &Job) -> Result<Disposition, StageError> {
        let local = job.input_file.hostname == self.hostname;
        if !local || !file_exists(&job.input_file.path()).await {
            let patch = JobPatch::new()
                .owner(Owner::None)
                .status(JobStatus::FileError)
                .error(Owner::InputReceiver, messages::FILE_INVALID);
            persist(self.jobs.as_ref(), &self.backoff, &job.id, &patch).await?;
            warn!(job_id = %job.id, input = %job.full_input_location(), "received file is gone");
            return Ok(Disposition::Terminated);
        }
        self.forward(job).await?;
        Ok(Disposition::Forwarded)
    }
}

/// Keeps the part of `dir_name` below the last `/input/` marker.
fn target_dir(dir_name: &str) -> Result<PathBuf, StageError> {
    let relative = dir_name
        .rsplit_once(INPUT_MARKER)
        .map(|(_, rest)| rest)
        .unwrap_or_default();
    if relative.split(['/', '\\']).any(|seg| seg == "..") {
        return Err(StageError::Invalid(format!(
            "directory {dir_name:?} escapes the input folder"
        )));
    }
    Ok(Path::new(relative.trim_matches('/')).to_path_buf())
}

#[async_trait]
impl Reconcile for InputReceiver {
    fn stage(&self) -> Owner {
        Owner::InputReceiver
    }

    async fn reconcile(&self) -> Result<ReconcileSummary, StageError> {
        let jobs = self
            .jobs
            .get_by_owner(Owner::InputReceiver)
            .await
            .map_err(StageError::Repo)?;

        let mut summary = ReconcileSummary::default();
        for job in jobs {
            let disposition = self.revalidate(&job).await.unwrap_or_else(|err| {
                warn!(job_id = %job.id, error = %err, "input receiver retry failed");
                Disposition::Failed
            });
            summary.record(disposition);
        }
        Ok(summary)
    }
}
