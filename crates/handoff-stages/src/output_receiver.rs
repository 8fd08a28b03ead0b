//! Edge-side stage that pulls output files back from the gateway.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use handoff_adapters::{BackoffPolicy, JobRepoPort, OutputSource, PortError};
use handoff_core::{messages, ErrorDetails, FileStatus, Job, JobPatch, JobStatus, Owner};
use handoff_storage::FileStore;
use thiserror::Error;
use tracing::{info, warn};

use crate::{persist, Disposition, Reconcile, ReconcileSummary, StageError};

#[derive(Debug, Error)]
enum PullFailure {
    #[error("fetch: {0}")]
    Fetch(PortError),
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    Checksum { expected: String, actual: String },
    #[error("write: {0}")]
    Write(String),
}

impl PullFailure {
    fn file_status(&self) -> (FileStatus, &'static str) {
        match self {
            PullFailure::Fetch(_) => (FileStatus::TransmissionFailed, messages::FILE_TRANSMITTING),
            PullFailure::Checksum { .. } | PullFailure::Write(_) => {
                (FileStatus::WriteFailed, messages::FILE_WRITE)
            }
        }
    }
}

#[derive(Clone)]
pub struct OutputReceiver {
    jobs: Arc<dyn JobRepoPort>,
    source: Arc<dyn OutputSource>,
    files: FileStore,
    hostname: String,
    backoff: BackoffPolicy,
}

impl OutputReceiver {
    pub fn new(
        jobs: Arc<dyn JobRepoPort>,
        source: Arc<dyn OutputSource>,
        output_folder: impl Into<PathBuf>,
        hostname: impl Into<String>,
    ) -> Self {
        Self {
            jobs,
            source,
            files: FileStore::new(output_folder),
            hostname: hostname.into(),
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub async fn handle_job(&self, job: &Job) -> Result<Job, StageError> {
        let job = self.accept(job).await?;
        let this = self.clone();
        let background = job.clone();
        tokio::spawn(async move {
            if let Err(err) = this.receive(&background).await {
                warn!(job_id = %background.id, error = %err, "receiving output files failed");
            }
        });
        Ok(job)
    }

    pub async fn accept(&self, job: &Job) -> Result<Job, StageError> {
        let patch = JobPatch::new().owner(Owner::OutputReceiver);
        persist(self.jobs.as_ref(), &self.backoff, &job.id, &patch).await
    }

    /// Pulls every deliverable file concurrently, asks the sender to archive,
    /// then releases the job.
    pub async fn receive(&self, job: &Job) -> Result<Job, StageError> {
        let mut files = job.pipeline_details.output_files.clone();
        let pulls = files
            .iter()
            .enumerate()
            .filter(|(_, file)| !file.is_failed())
            .map(|(index, file)| {
                let name = file.name.clone();
                async move { (index, self.pull(&job.id, index, &name).await) }
            });
        let results = join_all(pulls).await;

        let mut error: Option<ErrorDetails> = None;
        for (index, result) in results {
            let Err(failure) = result else { continue };
            warn!(job_id = %job.id, index, error = %failure, "output file pull failed");
            let (status, message) = failure.file_status();
            files[index].mark(status, Owner::OutputReceiver, Some(message));
            error.get_or_insert_with(|| ErrorDetails::new(Owner::OutputReceiver, message));
        }
        if let Some(details) = &error {
            let patch = JobPatch::new()
                .output_files(files)
                .status(JobStatus::FileError)
                .error_details(Some(details.clone()));
            persist(self.jobs.as_ref(), &self.backoff, &job.id, &patch).await?;
        }

        match self.source.archive(&job.id).await {
            Ok(()) => {}
            Err(err) if err.is_network() => {
                return Err(StageError::forward("output-sender", err));
            }
            Err(err) => {
                warn!(job_id = %job.id, error = %err, "sender refused to archive");
                error.get_or_insert_with(|| {
                    ErrorDetails::new(Owner::OutputReceiver, messages::FILE_ARCHIVING)
                });
            }
        }

        // The sender records its own archive failures on the job.
        let stored = self.jobs.get_by_id(&job.id).await.map_err(StageError::Repo)?;
        if stored.status == JobStatus::FileError && error.is_none() {
            error = stored
                .error_details
                .or_else(|| Some(ErrorDetails::new(Owner::OutputSender, messages::FILE_ARCHIVING)));
        }

        let status = if error.is_some() {
            JobStatus::FileError
        } else {
            JobStatus::Complete
        };
        let patch = JobPatch::new()
            .owner(Owner::None)
            .status(status)
            .output_file_host(self.hostname.clone())
            .error_details(error);
        let job = persist(self.jobs.as_ref(), &self.backoff, &job.id, &patch).await?;
        info!(job_id = %job.id, status = ?job.status, "job finished");
        Ok(job)
    }

    async fn pull(&self, job_id: &str, index: usize, name: &str) -> Result<(), PullFailure> {
        let fetched = self
            .source
            .fetch_file(job_id, index)
            .await
            .map_err(PullFailure::Fetch)?;
        if let Some(expected) = fetched.sha256 {
            let actual = FileStore::sha256_hex(&fetched.bytes);
            if !expected.eq_ignore_ascii_case(&actual) {
                return Err(PullFailure::Checksum { expected, actual });
            }
        }
        let base = Path::new(name)
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| PullFailure::Write(format!("no file name in {name:?}")))?;
        self.files
            .write_atomic(Path::new(""), base, &fetched.bytes)
            .await
            .map_err(|err| PullFailure::Write(format!("{err:#}")))?;
        Ok(())
    }
}

#[async_trait]
impl Reconcile for OutputReceiver {
    fn stage(&self) -> Owner {
        Owner::OutputReceiver
    }

    async fn reconcile(&self) -> Result<ReconcileSummary, StageError> {
        let jobs = self
            .jobs
            .get_by_owner(Owner::OutputReceiver)
            .await
            .map_err(StageError::Repo)?;

        let mut summary = ReconcileSummary::default();
        for job in jobs {
            let disposition = match self.receive(&job).await {
                Ok(_) => Disposition::Terminated,
                Err(err) => {
                    warn!(job_id = %job.id, error = %err, "output receiver retry failed");
                    Disposition::Failed
                }
            };
            summary.record(disposition);
        }
        Ok(summary)
    }
}
