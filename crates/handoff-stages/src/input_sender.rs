//! Edge-side stage that pushes a job's input file to the gateway.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use handoff_adapters::{BackoffPolicy, InputTransfer, JobRepoPort, PortError};
use handoff_core::{
    ensure_plain_file_name, ensure_safe_dir, messages, Job, JobPatch, JobStatus, Owner,
};
use tracing::{info, warn};

use crate::{file_exists, persist, Disposition, Reconcile, ReconcileSummary, StageError};

#[derive(Clone)]
pub struct InputSender {
    jobs: Arc<dyn JobRepoPort>,
    transfer: Arc<dyn InputTransfer>,
    hostname: String,
    backoff: BackoffPolicy,
}

impl InputSender {
    pub fn new(
        jobs: Arc<dyn JobRepoPort>,
        transfer: Arc<dyn InputTransfer>,
        hostname: impl Into<String>,
    ) -> Self {
        Self {
            jobs,
            transfer,
            hostname: hostname.into(),
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Takes ownership and starts the transfer in the background.
    pub async fn handle_job(&self, job: &Job) -> Result<Job, StageError> {
        let job = self.accept(job).await?;
        let this = self.clone();
        let background = job.clone();
        tokio::spawn(async move {
            if let Err(err) = this.transmit(&background).await {
                warn!(job_id = %background.id, error = %err, "input transfer failed");
            }
        });
        Ok(job)
    }

    /// Checks the input file is local and readable, then records ownership.
    pub async fn accept(&self, job: &Job) -> Result<Job, StageError> {
        if let Err(reason) = self.check_input(job).await {
            let patch = JobPatch::new()
                .owner(Owner::None)
                .status(JobStatus::FileError)
                .error(Owner::InputSender, reason.clone());
            persist(self.jobs.as_ref(), &self.backoff, &job.id, &patch).await?;
            return Err(StageError::Invalid(reason));
        }

        let patch = JobPatch::new().owner(Owner::InputSender).clear_error();
        persist(self.jobs.as_ref(), &self.backoff, &job.id, &patch).await
    }

    async fn check_input(&self, job: &Job) -> Result<(), String> {
        let file = &job.input_file;
        ensure_plain_file_name(&file.name).map_err(|e| e.to_string())?;
        ensure_safe_dir(&file.dir_name).map_err(|e| e.to_string())?;
        if file.hostname != self.hostname {
            return Err(format!(
                "input file is on {}, not on {}",
                file.hostname, self.hostname
            ));
        }
        if !file_exists(&file.path()).await {
            return Err(format!("{} does not exist", job.full_input_location()));
        }
        Ok(())
    }

    /// Sends the job, then its file. Failures are recorded but keep the owner.
    pub async fn transmit(&self, job: &Job) -> Result<(), StageError> {
        let Err(err) = self.send(job).await else {
            info!(job_id = %job.id, input = %job.full_input_location(), "input file transmitted");
            return Ok(());
        };

        let status = if err.is_network() {
            JobStatus::Incomplete
        } else {
            JobStatus::TransmissionFailed
        };
        let patch = JobPatch::new()
            .status(status)
            .error(Owner::InputSender, messages::FILE_TRANSMITTING);
        persist(self.jobs.as_ref(), &self.backoff, &job.id, &patch).await?;
        Err(StageError::forward("input-receiver", err))
    }

    async fn send(&self, job: &Job) -> Result<(), PortError> {
        self.transfer.transmit_job(job).await?;
        let path = job.input_file.path();
        let bytes = self
            .read_with_retry(&path)
            .await
            .map_err(|err| PortError::Invalid(format!("reading {}: {err}", path.display())))?;
        self.transfer
            .transmit_file(&job.id, &job.input_file.name, bytes)
            .await
    }

    async fn read_with_retry(&self, path: &Path) -> std::io::Result<Vec<u8>> {
        let mut attempt = 0;
        loop {
            match tokio::fs::read(path).await {
                Err(_) if attempt < self.backoff.max_retries => {
                    tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl Reconcile for InputSender {
    fn stage(&self) -> Owner {
        Owner::InputSender
    }

    async fn reconcile(&self) -> Result<ReconcileSummary, StageError> {
        let jobs = self
            .jobs
            .get_by_owner(Owner::InputSender)
            .await
            .map_err(StageError::Repo)?;

        let mut summary = ReconcileSummary::default();
        for job in jobs {
            let disposition = match self.transmit(&job).await {
                Ok(()) => Disposition::Forwarded,
                Err(err) => {
                    warn!(job_id = %job.id, error = %err, "input transfer retry failed");
                    Disposition::Failed
                }
            };
            summary.record(disposition);
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::{mk_job, repos, RecordingTransfer};
    use handoff_storage::JobRepository;
    use tempfile::tempdir;

    fn quick() -> BackoffPolicy {
        BackoffPolicy {
            max_retries: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    async fn stored_job(jobs: &JobRepository, dir: &Path, name: &str) -> Job {
        let mut job = mk_job("edge", &dir.display().to_string(), name);
        job.owner = Owner::Intake;
        jobs.create(job).await.unwrap().1
    }

    #[tokio::test]
    async fn local_file_is_accepted_and_transmitted() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("x.tiff"), b"pixels").unwrap();
        let (jobs, _) = repos();
        let transfer = Arc::new(RecordingTransfer::default());
        let sender = InputSender::new(jobs.clone(), transfer.clone(), "edge").with_backoff(quick());

        let job = stored_job(&jobs, dir.path(), "x.tiff").await;
        let accepted = sender.accept(&job).await.unwrap();
        assert_eq!(accepted.owner, Owner::InputSender);

        sender.transmit(&accepted).await.unwrap();
        assert_eq!(transfer.jobs.lock().unwrap().len(), 1);
        let files = transfer.files.lock().unwrap();
        assert_eq!(files[0].1, "x.tiff");
        assert_eq!(files[0].2, b"pixels");
    }

    #[tokio::test]
    async fn missing_file_releases_the_job_with_file_error() {
        let dir = tempdir().unwrap();
        let (jobs, _) = repos();
        let sender = InputSender::new(jobs.clone(), Arc::new(RecordingTransfer::default()), "edge");

        let job = stored_job(&jobs, dir.path(), "gone.tiff").await;
        let err = sender.accept(&job).await.unwrap_err();
        assert!(matches!(err, StageError::Invalid(_)));

        let stored = jobs.get_by_id(&job.id).await.unwrap();
        assert_eq!(stored.owner, Owner::None);
        assert_eq!(stored.status, JobStatus::FileError);
        assert_eq!(stored.error_details.unwrap().owner, Owner::InputSender);
    }

    #[tokio::test]
    async fn foreign_host_is_rejected() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("x.tiff"), b"pixels").unwrap();
        let (jobs, _) = repos();
        let sender = InputSender::new(jobs.clone(), Arc::new(RecordingTransfer::default()), "other");

        let job = stored_job(&jobs, dir.path(), "x.tiff").await;
        assert!(sender.accept(&job).await.is_err());
        assert_eq!(jobs.get_by_id(&job.id).await.unwrap().owner, Owner::None);
    }

    #[tokio::test]
    async fn network_failure_keeps_owner_and_incomplete_status() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("x.tiff"), b"pixels").unwrap();
        let (jobs, _) = repos();
        let transfer = Arc::new(RecordingTransfer {
            fail: Some(PortError::Unavailable("timeout".into())),
            ..Default::default()
        });
        let sender = InputSender::new(jobs.clone(), transfer, "edge").with_backoff(quick());

        let job = stored_job(&jobs, dir.path(), "x.tiff").await;
        let job = sender.accept(&job).await.unwrap();
        assert!(sender.transmit(&job).await.is_err());

        let stored = jobs.get_by_id(&job.id).await.unwrap();
        assert_eq!(stored.owner, Owner::InputSender);
        assert_eq!(stored.status, JobStatus::Incomplete);
        assert_eq!(
            stored.error_details.unwrap().error,
            messages::FILE_TRANSMITTING
        );

        let summary = sender.reconcile().await.unwrap();
        assert_eq!(summary.failed, 1);
    }

    #[tokio::test]
    async fn rejected_transfer_marks_transmission_failed() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("x.tiff"), b"pixels").unwrap();
        let (jobs, _) = repos();
        let transfer = Arc::new(RecordingTransfer {
            fail: Some(PortError::Rejected {
                status: 400,
                message: "checksum mismatch".into(),
            }),
            ..Default::default()
        });
        let sender = InputSender::new(jobs.clone(), transfer, "edge").with_backoff(quick());

        let job = stored_job(&jobs, dir.path(), "x.tiff").await;
        let job = sender.accept(&job).await.unwrap();
        assert!(sender.transmit(&job).await.is_err());
        let stored = jobs.get_by_id(&job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::TransmissionFailed);
        assert_eq!(stored.owner, Owner::InputSender);
    }
}
