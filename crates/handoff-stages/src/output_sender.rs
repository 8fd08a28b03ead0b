//! Gateway-side stage that serves output files and archives a finished job.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use handoff_adapters::{BackoffPolicy, JobHandler, JobRepoPort, TaskRepoPort};
use handoff_core::{
    init_output_files, messages, now_nanos, ErrorDetails, FileStatus, Job, JobPatch, JobStatus,
    Owner,
};
use handoff_storage::FileStore;
use tokio::fs;
use tracing::{info, warn};

use crate::{file_exists, persist, Disposition, JobCache, Reconcile, ReconcileSummary, StageError};

#[derive(Clone)]
pub struct OutputSender {
    jobs: Arc<dyn JobRepoPort>,
    tasks: Arc<dyn TaskRepoPort>,
    next: Arc<dyn JobHandler>,
    cache: JobCache,
    archive_folder: PathBuf,
    reject_folder: PathBuf,
    backoff: BackoffPolicy,
}

impl OutputSender {
    pub fn new(
        jobs: Arc<dyn JobRepoPort>,
        tasks: Arc<dyn TaskRepoPort>,
        next: Arc<dyn JobHandler>,
        archive_folder: impl Into<PathBuf>,
        reject_folder: impl Into<PathBuf>,
    ) -> Self {
        Self {
            jobs,
            tasks,
            next,
            cache: JobCache::new(),
            archive_folder: archive_folder.into(),
            reject_folder: reject_folder.into(),
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

    pub async fn handle_job(&self, job: &Job) -> Result<Job, StageError> {
        let job = self.accept(job).await?;
        let this = self.clone();
        let background = job.clone();
        tokio::spawn(async move {
            let _ = this.forward(&background).await;
        });
        Ok(job)
    }

    pub async fn accept(&self, job: &Job) -> Result<Job, StageError> {
        let stored = self.jobs.get_by_id(&job.id).await.map_err(StageError::Repo)?;
        let mut files = stored.pipeline_details.output_files.clone();
        init_output_files(&mut files, Owner::OutputSender);

        let mut patch = JobPatch::new().owner(Owner::OutputSender).output_files(files);
        if stored.status != JobStatus::FileError {
            patch = patch.status(JobStatus::Incomplete);
        }
        let job = persist(self.jobs.as_ref(), &self.backoff, &job.id, &patch).await?;
        self.cache.insert(job.clone()).await;
        Ok(job)
    }

    /// Hands the job to the output receiver. A failure is recorded and the owner kept.
    pub async fn forward(&self, job: &Job) -> Result<(), StageError> {
        let Err(err) = self.next.handle_job(job).await else {
            info!(job_id = %job.id, "job handed to output receiver");
            return Ok(());
        };
        warn!(job_id = %job.id, error = %err, "handoff to output receiver failed");
        let mut patch = JobPatch::new().error(Owner::OutputSender, messages::PUBLISHING);
        // A file error outlives the retry; only the details change.
        if job.status != JobStatus::FileError {
            patch = patch.status(JobStatus::TransmissionFailed);
        }
        persist(self.jobs.as_ref(), &self.backoff, &job.id, &patch).await?;
        Err(StageError::forward("output-receiver", err))
    }

    /// Content and SHA-256 of the `index`th output file.
    pub async fn file(&self, job_id: &str, index: usize) -> Result<(Vec<u8>, String), StageError> {
        let job = match self.cache.get(job_id).await {
            Some(job) => job,
            None => self.jobs.get_by_id(job_id).await.map_err(StageError::Repo)?,
        };
        if !matches!(job.owner, Owner::OutputSender | Owner::OutputReceiver) {
            return Err(StageError::Invalid(format!(
                "job {job_id} is owned by {}",
                job.owner
            )));
        }
        let file = job
            .pipeline_details
            .output_files
            .get(index)
            .ok_or_else(|| StageError::NotFound(format!("output file {index} of job {job_id}")))?;
        let path = file.path();
        let bytes = fs::read(&path)
            .await
            .map_err(|err| io_error(&path, err))?;
        let sha256 = FileStore::sha256_hex(&bytes);
        Ok((bytes, sha256))
    }

    /// Moves the input file and every deliverable output file into the archive
    /// folder and releases the job.
    pub async fn archive(&self, job_id: &str) -> Result<Job, StageError> {
        let job = self.jobs.get_by_id(job_id).await.map_err(StageError::Repo)?;
        if !matches!(job.owner, Owner::OutputSender | Owner::OutputReceiver) {
            return Err(StageError::Invalid(format!(
                "job {job_id} is owned by {}",
                job.owner
            )));
        }
        let stamp = now_nanos();

        let input_name = archive_name(&job.input_file.name, job_id, stamp, "input");
        let input_target = self.archive_folder.join(&input_name);
        if let Err(err) = move_file(&job.input_file.path(), &input_target).await {
            let patch = JobPatch::new()
                .owner(Owner::None)
                .status(JobStatus::FileError)
                .error(Owner::OutputSender, messages::FILE_ARCHIVING);
            persist(self.jobs.as_ref(), &self.backoff, job_id, &patch).await?;
            self.cache.remove(job_id).await;
            return Err(StageError::Internal(format!(
                "archiving {}: {err}",
                job.full_input_location()
            )));
        }

        let mut files = job.pipeline_details.output_files.clone();
        let mut file_error =
            job.status == JobStatus::FileError || files.iter().any(|f| f.is_failed());
        let mut error = job.error_details.clone();
        for file in files.iter_mut().filter(|f| !f.is_failed()) {
            let failure = if !file_exists(&file.path()).await {
                Some((FileStatus::Invalid, messages::FILE_INVALID))
            } else {
                let name = archive_name(&file.name, job_id, stamp, "output");
                match move_file(&file.path(), &self.archive_folder.join(&name)).await {
                    Ok(()) => {
                        file.mark(FileStatus::Complete, Owner::OutputSender, None);
                        file.archive_name = name.clone();
                        file.viewable = name;
                        None
                    }
                    Err(err) => {
                        warn!(job_id, file = %file.path().display(), error = %err, "archiving output failed");
                        Some((FileStatus::ArchiveFailed, messages::FILE_ARCHIVING))
                    }
                }
            };
            if let Some((status, message)) = failure {
                file.mark(status, Owner::OutputSender, Some(message));
                file_error = true;
                error.get_or_insert_with(|| ErrorDetails::new(Owner::OutputSender, message));
            }
        }

        let status = if file_error {
            JobStatus::FileError
        } else {
            error = None;
            JobStatus::Complete
        };
        let patch = JobPatch::new()
            .owner(Owner::None)
            .status(status)
            .error_details(error)
            .input_archive(input_name.clone(), input_name)
            .output_files(files);
        let job = persist(self.jobs.as_ref(), &self.backoff, job_id, &patch).await?;
        self.cache.remove(job_id).await;
        info!(job_id, status = ?job.status, "job archived");
        Ok(job)
    }

    /// Copies the archived input file into the reject folder of its model.
    pub async fn reject(&self, job_id: &str) -> Result<PathBuf, StageError> {
        let (job, target) = self.reject_target(job_id).await?;
        let source = self.archive_folder.join(&job.input_file.archive_name);
        if let Some(dir) = target.parent() {
            fs::create_dir_all(dir)
                .await
                .map_err(|err| io_error(dir, err))?;
        }
        fs::copy(&source, &target)
            .await
            .map_err(|err| io_error(&source, err))?;
        info!(job_id, path = %target.display(), "input file rejected");
        Ok(target)
    }

    pub async fn unreject(&self, job_id: &str) -> Result<(), StageError> {
        let (_, target) = self.reject_target(job_id).await?;
        fs::remove_file(&target)
            .await
            .map_err(|err| io_error(&target, err))?;

        if let Some(dir) = target.parent() {
            let mut entries = fs::read_dir(dir).await.map_err(|err| io_error(dir, err))?;
            let empty = entries
                .next_entry()
                .await
                .map_err(|err| io_error(dir, err))?
                .is_none();
            if empty {
                fs::remove_dir(dir).await.map_err(|err| io_error(dir, err))?;
            }
        }
        Ok(())
    }

    async fn reject_target(&self, job_id: &str) -> Result<(Job, PathBuf), StageError> {
        let job = self.jobs.get_by_id(job_id).await.map_err(StageError::Repo)?;
        if job.input_file.archive_name.is_empty() {
            return Err(StageError::Invalid(format!("job {job_id} has not been archived")));
        }
        let task = self
            .tasks
            .get_by_id(&job.pipeline_details.task_id)
            .await
            .map_err(StageError::Repo)?;
        let target = self
            .reject_folder
            .join(task.model_name())
            .join(&job.input_file.name);
        Ok((job, target))
    }
}

/// `name.ext` becomes `name_archive_{id}_{stamp}_{kind}.ext`.
fn archive_name(name: &str, job_id: &str, stamp: i64, kind: &str) -> String {
    let base = Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(name);
    let suffix = format!("_archive_{job_id}_{stamp}_{kind}");
    match base.split_once('.') {
        Some((stem, ext)) => format!("{stem}{suffix}.{ext}"),
        None => format!("{base}{suffix}"),
    }
}

async fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if let Some(dir) = to.parent() {
        fs::create_dir_all(dir).await?;
    }
    if fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    // Rename fails across filesystems.
    fs::copy(from, to).await?;
    fs::remove_file(from).await
}

fn io_error(path: &Path, err: io::Error) -> StageError {
    let message = format!("{}: {err}", path.display());
    if err.kind() == io::ErrorKind::NotFound {
        StageError::NotFound(message)
    } else {
        StageError::Internal(message)
    }
}

#[async_trait]
impl Reconcile for OutputSender {
    fn stage(&self) -> Owner {
        Owner::OutputSender
    }

    async fn reconcile(&self) -> Result<ReconcileSummary, StageError> {
        let owned = self
            .jobs
            .get_by_owner(Owner::OutputSender)
            .await
            .map_err(StageError::Repo)?;
        let receiving = self
            .jobs
            .get_by_owner(Owner::OutputReceiver)
            .await
            .map_err(StageError::Repo)?;
        self.cache
            .replace_all(owned.iter().cloned().chain(receiving))
            .await;

        let mut summary = ReconcileSummary::default();
        for job in owned {
            // Reset before forwarding; a failed forward records its own error.
            let stale = job.status != JobStatus::Incomplete || job.error_details.is_some();
            if job.status != JobStatus::FileError && stale {
                let patch = JobPatch::new().status(JobStatus::Incomplete).clear_error();
                if let Err(err) = persist(self.jobs.as_ref(), &self.backoff, &job.id, &patch).await {
                    warn!(job_id = %job.id, error = %err, "resetting job status failed");
                    summary.record(Disposition::Failed);
                    continue;
                }
            }
            let disposition = match self.forward(&job).await {
                Ok(()) => Disposition::Forwarded,
                Err(_) => Disposition::Failed,
            };
            summary.record(disposition);
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{mk_job, mk_task, repos, RecordingHandler};
    use handoff_adapters::PortError;
    use handoff_core::OutputFile;
    use handoff_storage::{JobRepository, TaskRepository};
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        root: TempDir,
        sender: OutputSender,
        jobs: Arc<JobRepository>,
        tasks: Arc<TaskRepository>,
    }

    fn fixture(receiver: Arc<RecordingHandler>) -> Fixture {
        let root = tempdir().unwrap();
        let (jobs, tasks) = repos();
        let sender = OutputSender::new(
            jobs.clone(),
            tasks.clone(),
            receiver,
            root.path().join("archive"),
            root.path().join("reject"),
        );
        Fixture {
            root,
            sender,
            jobs,
            tasks,
        }
    }

    /// Stores a dispatched job with its input file and the named outputs on disk.
    async fn job_with_outputs(f: &Fixture, present: &[&str], absent: &[&str]) -> Job {
        let input_dir = f.root.path().join("in");
        let output_dir = f.root.path().join("out");
        std::fs::create_dir_all(&input_dir).unwrap();
        std::fs::create_dir_all(&output_dir).unwrap();
        std::fs::write(input_dir.join("x.tiff"), b"input").unwrap();
        for name in present {
            std::fs::write(output_dir.join(name), name.as_bytes()).unwrap();
        }

        let task = f.tasks.create(mk_task("true")).await.unwrap();
        let mut job = mk_job("gw", &input_dir.display().to_string(), "x.tiff");
        job.owner = Owner::Dispatch;
        job.pipeline_details.task_id = task.id;
        job.pipeline_details.output_files = present
            .iter()
            .chain(absent)
            .map(|name| OutputFile {
                dir_name: output_dir.display().to_string(),
                name: name.to_string(),
                extension: "csv".into(),
                ..Default::default()
            })
            .collect();
        f.jobs.create(job).await.unwrap().1
    }

    #[test]
    fn archive_names_keep_the_extension() {
        assert_eq!(
            archive_name("x.ome.tiff", "j1", 42, "input"),
            "x_archive_j1_42_input.ome.tiff"
        );
        assert_eq!(archive_name("README", "j1", 42, "output"), "README_archive_j1_42_output");
    }

    #[tokio::test]
    async fn accept_takes_ownership_and_serves_files_with_checksums() {
        let receiver = Arc::new(RecordingHandler::default());
        let f = fixture(receiver.clone());
        let job = job_with_outputs(&f, &["a.csv"], &[]).await;

        let accepted = f.sender.accept(&job).await.unwrap();
        assert_eq!(accepted.owner, Owner::OutputSender);
        assert_eq!(
            accepted.pipeline_details.output_files[0].status,
            Some(FileStatus::Incomplete)
        );
        assert_eq!(f.sender.cache().len().await, 1);

        let (bytes, sha) = f.sender.file(&job.id, 0).await.unwrap();
        assert_eq!(bytes, b"a.csv");
        assert_eq!(sha, FileStore::sha256_hex(b"a.csv"));
        assert!(matches!(
            f.sender.file(&job.id, 5).await,
            Err(StageError::NotFound(_))
        ));

        f.sender.forward(&accepted).await.unwrap();
        assert_eq!(receiver.calls().len(), 1);
    }

    #[tokio::test]
    async fn files_are_only_served_while_in_output_stages() {
        let f = fixture(Arc::new(RecordingHandler::default()));
        let job = job_with_outputs(&f, &["a.csv"], &[]).await;
        assert!(matches!(
            f.sender.file(&job.id, 0).await,
            Err(StageError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn archive_moves_files_and_completes_the_job() {
        let f = fixture(Arc::new(RecordingHandler::default()));
        let job = job_with_outputs(&f, &["a.csv", "b.csv"], &[]).await;
        f.sender.accept(&job).await.unwrap();

        let archived = f.sender.archive(&job.id).await.unwrap();
        assert_eq!(archived.owner, Owner::None);
        assert_eq!(archived.status, JobStatus::Complete);
        assert!(archived.error_details.is_none());
        let input_archive = f.root.path().join("archive").join(&archived.input_file.archive_name);
        assert!(input_archive.exists());
        assert!(!job.input_file.path().exists());
        for file in &archived.pipeline_details.output_files {
            assert_eq!(file.status, Some(FileStatus::Complete));
            assert!(f.root.path().join("archive").join(&file.archive_name).exists());
        }
        assert!(f.sender.cache().is_empty().await);
    }

    #[tokio::test]
    async fn missing_output_at_archive_time_is_a_file_error() {
        let f = fixture(Arc::new(RecordingHandler::default()));
        let job = job_with_outputs(&f, &["a.csv"], &["b.csv"]).await;
        f.sender.accept(&job).await.unwrap();

        let archived = f.sender.archive(&job.id).await.unwrap();
        assert_eq!(archived.status, JobStatus::FileError);
        let files = &archived.pipeline_details.output_files;
        assert_eq!(files[0].status, Some(FileStatus::Complete));
        assert_eq!(files[1].status, Some(FileStatus::Invalid));
        assert_eq!(archived.error_details.unwrap().error, messages::FILE_INVALID);
    }

    #[tokio::test]
    async fn missing_input_at_archive_time_releases_with_file_error() {
        let f = fixture(Arc::new(RecordingHandler::default()));
        let job = job_with_outputs(&f, &["a.csv"], &[]).await;
        f.sender.accept(&job).await.unwrap();
        std::fs::remove_file(job.input_file.path()).unwrap();

        let err = f.sender.archive(&job.id).await.unwrap_err();
        assert!(matches!(err, StageError::Internal(_)));
        let stored = f.jobs.get_by_id(&job.id).await.unwrap();
        assert_eq!(stored.owner, Owner::None);
        assert_eq!(stored.status, JobStatus::FileError);
    }

    #[tokio::test]
    async fn reject_and_unreject_round_trip_through_the_model_folder() {
        let f = fixture(Arc::new(RecordingHandler::default()));
        let job = job_with_outputs(&f, &["a.csv"], &[]).await;
        assert!(matches!(
            f.sender.reject(&job.id).await,
            Err(StageError::Invalid(_))
        ));
        f.sender.accept(&job).await.unwrap();
        f.sender.archive(&job.id).await.unwrap();

        let target = f.sender.reject(&job.id).await.unwrap();
        assert_eq!(target, f.root.path().join("reject/segment/x.tiff"));
        assert_eq!(std::fs::read(&target).unwrap(), b"input");

        f.sender.unreject(&job.id).await.unwrap();
        assert!(!f.root.path().join("reject/segment").exists());
        assert!(matches!(
            f.sender.unreject(&job.id).await,
            Err(StageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn failed_forward_is_retried_by_reconcile() {
        let receiver = Arc::new(RecordingHandler::failing(PortError::Unavailable("down".into())));
        let f = fixture(receiver.clone());
        let job = job_with_outputs(&f, &["a.csv"], &[]).await;
        let job = f.sender.accept(&job).await.unwrap();

        assert!(f.sender.forward(&job).await.is_err());
        let stored = f.jobs.get_by_id(&job.id).await.unwrap();
        assert_eq!(stored.owner, Owner::OutputSender);
        assert_eq!(stored.status, JobStatus::TransmissionFailed);

        receiver.heal();
        let summary = f.sender.reconcile().await.unwrap();
        assert_eq!(summary.forwarded, 1);
        let stored = f.jobs.get_by_id(&job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Incomplete);
        assert!(stored.error_details.is_none());
        assert_eq!(receiver.calls().len(), 1);
    }

    #[tokio::test]
    async fn archive_requires_an_output_stage_owner() {
        let f = fixture(Arc::new(RecordingHandler::default()));
        let job = job_with_outputs(&f, &["a.csv"], &[]).await;
        assert!(matches!(
            f.sender.archive(&job.id).await,
            Err(StageError::Invalid(_))
        ));

        f.sender.accept(&job).await.unwrap();
        let first = f.sender.archive(&job.id).await.unwrap();
        assert_eq!(first.status, JobStatus::Complete);

        // A repeated archive call leaves the finished job alone.
        assert!(matches!(
            f.sender.archive(&job.id).await,
            Err(StageError::Invalid(_))
        ));
        let stored = f.jobs.get_by_id(&job.id).await.unwrap();
        assert_eq!(stored.owner, Owner::None);
        assert_eq!(stored.status, JobStatus::Complete);
        assert!(stored.error_details.is_none());
    }

    #[tokio::test]
    async fn file_error_survives_a_failed_forward_and_reconcile() {
        let receiver = Arc::new(RecordingHandler::failing(PortError::Unavailable("down".into())));
        let f = fixture(receiver.clone());
        let job = job_with_outputs(&f, &["a.csv"], &["b.csv"]).await;
        let mut files = job.pipeline_details.output_files.clone();
        files[1].mark(FileStatus::Invalid, Owner::Dispatch, Some(messages::FILE_INVALID));
        let patch = JobPatch::new()
            .status(JobStatus::FileError)
            .error(Owner::Dispatch, messages::FILE_INVALID)
            .output_files(files);
        f.jobs.update(&job.id, &patch).await.unwrap();

        let job = f.sender.accept(&job).await.unwrap();
        assert_eq!(job.status, JobStatus::FileError);
        assert!(f.sender.forward(&job).await.is_err());
        let stored = f.jobs.get_by_id(&job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::FileError);
        assert_eq!(stored.error_details.unwrap().error, messages::PUBLISHING);

        receiver.heal();
        let summary = f.sender.reconcile().await.unwrap();
        assert_eq!(summary.forwarded, 1);
        assert_eq!(
            f.jobs.get_by_id(&job.id).await.unwrap().status,
            JobStatus::FileError
        );

        f.jobs
            .update(&job.id, &JobPatch::new().owner(Owner::OutputReceiver))
            .await
            .unwrap();
        let archived = f.sender.archive(&job.id).await.unwrap();
        assert_eq!(archived.status, JobStatus::FileError);
        let files = &archived.pipeline_details.output_files;
        assert_eq!(files[0].status, Some(FileStatus::Complete));
        assert_eq!(files[1].status, Some(FileStatus::Invalid));
        assert!(archived.error_details.is_some());
    }
}
