//! Matches jobs to tasks, launches pipelines and routes their results.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use handoff_adapters::{BackoffPolicy, JobHandler, JobRepoPort, PipelineLauncher, TaskRepoPort};
use handoff_core::{
    find_task, init_output_files, messages, now_nanos, FileStatus, Job, JobPatch, JobStatus,
    Owner, PipelineParams, PipelineStatus, Task,
};
use tracing::{info, warn};

use crate::{file_exists, persist, Disposition, Reconcile, ReconcileSummary, StageError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Matched { job: Job, task: Task },
    NoPipeline(Job),
}

#[derive(Clone)]
pub struct Dispatch {
    jobs: Arc<dyn JobRepoPort>,
    tasks: Arc<dyn TaskRepoPort>,
    launcher: Arc<dyn PipelineLauncher>,
    next: Arc<dyn JobHandler>,
    hostname: String,
    job_repo_url: String,
    public_url: String,
    window: Duration,
    backoff: BackoffPolicy,
}

impl Dispatch {
    pub fn new(
        jobs: Arc<dyn JobRepoPort>,
        tasks: Arc<dyn TaskRepoPort>,
        launcher: Arc<dyn PipelineLauncher>,
        next: Arc<dyn JobHandler>,
        hostname: impl Into<String>,
    ) -> Self {
        Self {
            jobs,
            tasks,
            launcher,
            next,
            hostname: hostname.into(),
            job_repo_url: String::new(),
            public_url: String::new(),
            window: Duration::from_secs(3600),
            backoff: BackoffPolicy::default(),
        }
    }

    /// Bases the pipeline uses to call back into the job repository and dispatch.
    pub fn with_callback_urls(
        mut self,
        job_repo_url: impl Into<String>,
        public_url: impl Into<String>,
    ) -> Self {
        self.job_repo_url = job_repo_url.into();
        self.public_url = public_url.into();
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    async fn find(&self, job: &Job) -> Result<Option<Task>, StageError> {
        let tasks = self.tasks.get_all().await.map_err(StageError::Repo)?;
        Ok(find_task(job, &tasks)?.cloned())
    }

    pub async fn match_task(&self, job: &Job) -> Result<bool, StageError> {
        Ok(self.find(job).await?.is_some())
    }

    /// Accepts the job and launches its pipeline in the background.
    pub async fn handle_job(&self, job: &Job) -> Result<DispatchOutcome, StageError> {
        let outcome = self.accept(job).await?;
        if let DispatchOutcome::Matched { job, task } = &outcome {
            let this = self.clone();
            let (job, task) = (job.clone(), task.clone());
            tokio::spawn(async move {
                let _ = this.launch(&job, &task).await;
            });
        }
        Ok(outcome)
    }

    pub async fn accept(&self, job: &Job) -> Result<DispatchOutcome, StageError> {
        match self.find(job).await? {
            None => {
                let patch = JobPatch::new()
                    .owner(Owner::None)
                    .status(JobStatus::NoPipeline)
                    .error(Owner::Dispatch, messages::NO_MATCHING_TASK);
                let job = persist(self.jobs.as_ref(), &self.backoff, &job.id, &patch).await?;
                info!(job_id = %job.id, "no task matches job");
                Ok(DispatchOutcome::NoPipeline(job))
            }
            Some(task) => {
                let patch = JobPatch::new()
                    .owner(Owner::Dispatch)
                    .task_id(task.id.clone())
                    .output_file_host(self.hostname.clone())
                    .pipeline_status(PipelineStatus::Processing)
                    .clear_error();
                let job = persist(self.jobs.as_ref(), &self.backoff, &job.id, &patch).await?;
                info!(job_id = %job.id, task_id = %task.id, "job dispatched");
                Ok(DispatchOutcome::Matched { job, task })
            }
        }
    }

    pub async fn launch(&self, job: &Job, task: &Task) -> Result<(), StageError> {
        let params = PipelineParams::for_job(job, task, &self.job_repo_url, &self.public_url);
        match self.launcher.launch(&task.pipeline_id, &params).await {
            Ok(()) => {
                info!(job_id = %job.id, pipeline = %task.pipeline_id, "pipeline launched");
                Ok(())
            }
            Err(err) => {
                warn!(job_id = %job.id, pipeline = %task.pipeline_id, error = %err, "pipeline launch failed");
                Err(StageError::forward("pipeline", err))
            }
        }
    }

    /// Completion callback from the pipeline. The job record must already carry
    /// the reported outcome.
    pub async fn pipeline_status(
        &self,
        job_id: &str,
        task_id: &str,
        body: &str,
    ) -> Result<Owner, StageError> {
        let reported = PipelineStatus::parse_reported(body).ok_or_else(|| {
            StageError::Invalid(format!("pipeline status must be Complete or Failed, got {body:?}"))
        })?;
        let job = self.jobs.get_by_id(job_id).await.map_err(StageError::Repo)?;
        if job.owner != Owner::Dispatch {
            return Err(StageError::Invalid(format!(
                "job {job_id} is owned by {}",
                job.owner
            )));
        }
        if job.pipeline_details.task_id != task_id {
            return Err(StageError::Invalid(format!(
                "job {job_id} is not running task {task_id}"
            )));
        }
        if job.pipeline_details.status != Some(reported) {
            return Err(StageError::Invalid(format!(
                "job {job_id} records pipeline status {:?}, not {reported:?}",
                job.pipeline_details.status
            )));
        }
        self.complete_pipeline(&job).await
    }

    /// Finishes a job whose pipeline reported. Returns the resulting owner.
    pub async fn complete_pipeline(&self, job: &Job) -> Result<Owner, StageError> {
        if job.has_output_files() {
            return self.pass_to_sender(job).await;
        }

        let patch = if job.pipeline_details.status == Some(PipelineStatus::Complete) {
            JobPatch::new()
                .owner(Owner::None)
                .status(JobStatus::Complete)
                .clear_error()
        } else {
            JobPatch::new()
                .owner(Owner::None)
                .status(JobStatus::PipelineError)
                .error(Owner::Dispatch, messages::PIPELINE_FAILED)
        };
        let job = persist(self.jobs.as_ref(), &self.backoff, &job.id, &patch).await?;
        info!(job_id = %job.id, status = ?job.status, "job finished without output files");
        Ok(Owner::None)
    }

    async fn pass_to_sender(&self, job: &Job) -> Result<Owner, StageError> {
        let mut files = job.pipeline_details.output_files.clone();
        init_output_files(&mut files, Owner::OutputSender);

        let local = job.pipeline_details.output_file_host == self.hostname;
        let (mut candidates, mut missing) = (0, 0);
        if local {
            for file in files.iter_mut().filter(|f| !f.is_failed()) {
                candidates += 1;
                if !file_exists(&file.path()).await {
                    file.mark(FileStatus::Invalid, Owner::Dispatch, Some(messages::FILE_INVALID));
                    missing += 1;
                }
            }
        }

        if !local || missing == candidates {
            let patch = JobPatch::new()
                .owner(Owner::None)
                .status(JobStatus::PipelineError)
                .pipeline_status(PipelineStatus::FileNotFound)
                .error(Owner::Dispatch, messages::FILE_INVALID)
                .output_files(files);
            persist(self.jobs.as_ref(), &self.backoff, &job.id, &patch).await?;
            warn!(job_id = %job.id, local, missing, "no output files to hand on");
            return Ok(Owner::None);
        }

        let mut patch = JobPatch::new().output_files(files);
        if missing > 0 {
            patch = patch
                .status(JobStatus::FileError)
                .error(Owner::Dispatch, messages::FILE_INVALID);
        }
        let job = persist(self.jobs.as_ref(), &self.backoff, &job.id, &patch).await?;
        self.next
            .handle_job(&job)
            .await
            .map_err(|err| StageError::forward("output-sender", err))?;
        info!(job_id = %job.id, missing, "output files handed to sender");
        Ok(Owner::OutputSender)
    }

    pub async fn reconcile_with_window(
        &self,
        window: Duration,
    ) -> Result<ReconcileSummary, StageError> {
        let jobs = self
            .jobs
            .get_by_owner(Owner::Dispatch)
            .await
            .map_err(StageError::Repo)?;

        let mut summary = ReconcileSummary::default();
        for job in jobs {
            let disposition = self
                .reconcile_job(&job, window)
                .await
                .unwrap_or_else(|err| {
                    warn!(job_id = %job.id, error = %err, "dispatch retry failed");
                    Disposition::Failed
                });
            summary.record(disposition);
        }
        Ok(summary)
    }

    async fn reconcile_job(&self, job: &Job, window: Duration) -> Result<Disposition, StageError> {
        let stale = now_nanos().saturating_sub(job.last_updated) > window_nanos(window);
        match job.pipeline_details.status {
            Some(status) if status.is_finished() => match self.complete_pipeline(job).await? {
                Owner::None => Ok(Disposition::Terminated),
                _ => Ok(Disposition::Forwarded),
            },
            None => self.relaunch(job).await,
            Some(PipelineStatus::Processing) if stale => self.relaunch(job).await,
            Some(_) => Ok(Disposition::Unchanged),
        }
    }

    async fn relaunch(&self, job: &Job) -> Result<Disposition, StageError> {
        match self.accept(job).await? {
            DispatchOutcome::NoPipeline(_) => Ok(Disposition::Terminated),
            DispatchOutcome::Matched { job, task } => {
                self.launch(&job, &task).await?;
                Ok(Disposition::Forwarded)
            }
        }
    }
}

#[async_trait]
impl Reconcile for Dispatch {
    fn stage(&self) -> Owner {
        Owner::Dispatch
    }

    async fn reconcile(&self) -> Result<ReconcileSummary, StageError> {
        self.reconcile_with_window(self.window).await
    }
}

fn window_nanos(window: Duration) -> i64 {
    i64::try_from(window.as_nanos()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{mk_job, mk_task, repos, RecordingHandler, RecordingLauncher};
    use handoff_adapters::PortError;
    use handoff_core::OutputFile;
    use handoff_storage::{JobRepository, TaskRepository};
    use tempfile::tempdir;

    const SELECT_X: &str = r#"{"==": [{"var": "InputFile.Name"}, "x.tiff"]}"#;

    struct Fixture {
        dispatch: Dispatch,
        jobs: Arc<JobRepository>,
        tasks: Arc<TaskRepository>,
        launcher: Arc<RecordingLauncher>,
        sender: Arc<RecordingHandler>,
    }

    fn fixture() -> Fixture {
        let (jobs, tasks) = repos();
        let launcher = Arc::new(RecordingLauncher::default());
        let sender = Arc::new(RecordingHandler::default());
        let dispatch = Dispatch::new(
            jobs.clone(),
            tasks.clone(),
            launcher.clone(),
            sender.clone(),
            "gw",
        )
        .with_callback_urls("http://repo:8080", "http://dispatch:8080");
        Fixture {
            dispatch,
            jobs,
            tasks,
            launcher,
            sender,
        }
    }

    async fn owned_by_dispatch(f: &Fixture, name: &str) -> Job {
        let mut job = mk_job("gw", "/in", name);
        job.owner = Owner::InputReceiver;
        f.jobs.create(job).await.unwrap().1
    }

    /// Simulates the pipeline's `PUT /job/{id}/pipeline/{taskId}`.
    async fn report(f: &Fixture, job: &Job, status: PipelineStatus, files: Vec<OutputFile>) -> Job {
        let patch = JobPatch::new().pipeline_status(status).output_files(files);
        f.jobs.update(&job.id, &patch).await.unwrap()
    }

    fn output(dir: &std::path::Path, name: &str) -> OutputFile {
        OutputFile {
            dir_name: dir.display().to_string(),
            name: name.into(),
            extension: "csv".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn matched_job_is_owned_and_launched_with_callbacks() {
        let f = fixture();
        let task = f.tasks.create(mk_task(SELECT_X)).await.unwrap();
        let job = owned_by_dispatch(&f, "x.tiff").await;

        let DispatchOutcome::Matched { job, task: matched } = f.dispatch.accept(&job).await.unwrap()
        else {
            panic!("expected a match");
        };
        assert_eq!(matched.id, task.id);
        assert_eq!(job.owner, Owner::Dispatch);
        assert_eq!(job.pipeline_details.output_file_host, "gw");
        assert_eq!(job.pipeline_details.status, Some(PipelineStatus::Processing));

        f.dispatch.launch(&job, &matched).await.unwrap();
        let (pipeline, params) = f.launcher.calls().remove(0);
        assert_eq!(pipeline, "pipelines/segment");
        assert_eq!(
            params.pipeline_status_url,
            format!("http://dispatch:8080/pipelineStatus/{}/{}", job.id, task.id)
        );
    }

    #[tokio::test]
    async fn unmatched_job_ends_with_no_pipeline() {
        let f = fixture();
        f.tasks.create(mk_task(SELECT_X)).await.unwrap();
        let job = owned_by_dispatch(&f, "y.tiff").await;

        assert!(!f.dispatch.match_task(&job).await.unwrap());
        let outcome = f.dispatch.accept(&job).await.unwrap();
        let DispatchOutcome::NoPipeline(job) = outcome else {
            panic!("expected no pipeline");
        };
        assert_eq!(job.owner, Owner::None);
        assert_eq!(job.status, JobStatus::NoPipeline);
    }

    #[tokio::test]
    async fn broken_selector_is_a_bad_request() {
        let f = fixture();
        f.tasks.create(mk_task(r#"{"nope": [1]}"#)).await.unwrap();
        let job = owned_by_dispatch(&f, "x.tiff").await;
        let err = f.dispatch.match_task(&job).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::BadRequest);
    }

    #[tokio::test]
    async fn completion_without_output_files_finishes_the_job() {
        let f = fixture();
        let task = f.tasks.create(mk_task(SELECT_X)).await.unwrap();
        let job = owned_by_dispatch(&f, "x.tiff").await;
        f.dispatch.accept(&job).await.unwrap();
        report(&f, &job, PipelineStatus::Complete, vec![]).await;

        let owner = f
            .dispatch
            .pipeline_status(&job.id, &task.id, "complete")
            .await
            .unwrap();
        assert_eq!(owner, Owner::None);
        let stored = f.jobs.get_by_id(&job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Complete);
        assert!(stored.error_details.is_none());
    }

    #[tokio::test]
    async fn failed_pipeline_without_files_is_a_pipeline_error() {
        let f = fixture();
        let task = f.tasks.create(mk_task(SELECT_X)).await.unwrap();
        let job = owned_by_dispatch(&f, "x.tiff").await;
        f.dispatch.accept(&job).await.unwrap();
        report(&f, &job, PipelineStatus::Failed, vec![]).await;

        f.dispatch
            .pipeline_status(&job.id, &task.id, "Failed")
            .await
            .unwrap();
        let stored = f.jobs.get_by_id(&job.id).await.unwrap();
        assert_eq!(stored.owner, Owner::None);
        assert_eq!(stored.status, JobStatus::PipelineError);
        assert_eq!(stored.error_details.unwrap().error, messages::PIPELINE_FAILED);
    }

    #[tokio::test]
    async fn status_callback_is_checked_against_the_record() {
        let f = fixture();
        let task = f.tasks.create(mk_task(SELECT_X)).await.unwrap();
        let job = owned_by_dispatch(&f, "x.tiff").await;
        f.dispatch.accept(&job).await.unwrap();

        let not_written = f.dispatch.pipeline_status(&job.id, &task.id, "Complete").await;
        assert!(matches!(not_written, Err(StageError::Invalid(_))));
        let wrong_task = f.dispatch.pipeline_status(&job.id, "other", "Complete").await;
        assert!(matches!(wrong_task, Err(StageError::Invalid(_))));
        let bogus = f.dispatch.pipeline_status(&job.id, &task.id, "Processing").await;
        assert!(matches!(bogus, Err(StageError::Invalid(_))));
    }

    #[tokio::test]
    async fn partial_missing_outputs_are_isolated() {
        let out = tempdir().unwrap();
        std::fs::write(out.path().join("a.csv"), b"a").unwrap();
        let f = fixture();
        let task = f.tasks.create(mk_task(SELECT_X)).await.unwrap();
        let job = owned_by_dispatch(&f, "x.tiff").await;
        f.dispatch.accept(&job).await.unwrap();
        report(
            &f,
            &job,
            PipelineStatus::Complete,
            vec![output(out.path(), "a.csv"), output(out.path(), "b.csv")],
        )
        .await;

        let owner = f
            .dispatch
            .pipeline_status(&job.id, &task.id, "Complete")
            .await
            .unwrap();
        assert_eq!(owner, Owner::OutputSender);

        let stored = f.jobs.get_by_id(&job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::FileError);
        let files = &stored.pipeline_details.output_files;
        assert_eq!(files[0].status, Some(FileStatus::Incomplete));
        assert_eq!(files[1].status, Some(FileStatus::Invalid));
        assert_eq!(f.sender.calls().len(), 1);
    }

    #[tokio::test]
    async fn all_outputs_missing_is_a_pipeline_error() {
        let out = tempdir().unwrap();
        let f = fixture();
        let task = f.tasks.create(mk_task(SELECT_X)).await.unwrap();
        let job = owned_by_dispatch(&f, "x.tiff").await;
        f.dispatch.accept(&job).await.unwrap();
        report(&f, &job, PipelineStatus::Complete, vec![output(out.path(), "a.csv")]).await;

        let owner = f
            .dispatch
            .pipeline_status(&job.id, &task.id, "Complete")
            .await
            .unwrap();
        assert_eq!(owner, Owner::None);
        let stored = f.jobs.get_by_id(&job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::PipelineError);
        assert_eq!(stored.pipeline_details.status, Some(PipelineStatus::FileNotFound));
        assert!(f.sender.calls().is_empty());
    }

    #[tokio::test]
    async fn sender_outage_keeps_dispatch_ownership() {
        let out = tempdir().unwrap();
        std::fs::write(out.path().join("a.csv"), b"a").unwrap();
        let mut f = fixture();
        let sender = Arc::new(RecordingHandler::failing(PortError::Unavailable("down".into())));
        f.dispatch.next = sender.clone();
        f.sender = sender;

        let task = f.tasks.create(mk_task(SELECT_X)).await.unwrap();
        let job = owned_by_dispatch(&f, "x.tiff").await;
        f.dispatch.accept(&job).await.unwrap();
        report(&f, &job, PipelineStatus::Complete, vec![output(out.path(), "a.csv")]).await;

        let err = f
            .dispatch
            .pipeline_status(&job.id, &task.id, "Complete")
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Forward { stage: "output-sender", .. }));
        assert_eq!(f.jobs.get_by_id(&job.id).await.unwrap().owner, Owner::Dispatch);

        f.sender.heal();
        let summary = f.dispatch.reconcile().await.unwrap();
        assert_eq!(summary.forwarded, 1);
        assert_eq!(f.sender.calls().len(), 1);
    }

    #[tokio::test]
    async fn reconcile_relaunches_only_stale_processing_jobs() {
        let f = fixture();
        f.tasks.create(mk_task(SELECT_X)).await.unwrap();
        let job = owned_by_dispatch(&f, "x.tiff").await;
        f.dispatch.accept(&job).await.unwrap();

        let fresh = f.dispatch.reconcile().await.unwrap();
        assert_eq!(fresh.unchanged, 1);
        assert!(f.launcher.calls().is_empty());

        let stale = f
            .dispatch
            .reconcile_with_window(Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(stale.forwarded, 1);
        assert_eq!(f.launcher.calls().len(), 1);

        let again = f.dispatch.reconcile().await.unwrap();
        assert_eq!(again, fresh);
    }

    #[tokio::test]
    async fn reconcile_demotes_jobs_that_no_longer_match() {
        let f = fixture();
        let task = f.tasks.create(mk_task(SELECT_X)).await.unwrap();
        let job = owned_by_dispatch(&f, "x.tiff").await;
        f.jobs
            .update(&job.id, &JobPatch::new().owner(Owner::Dispatch))
            .await
            .unwrap();
        f.tasks.delete(&task.id).await.unwrap();

        let summary = f.dispatch.reconcile().await.unwrap();
        assert_eq!(summary.terminated, 1);
        let stored = f.jobs.get_by_id(&job.id).await.unwrap();
        assert_eq!(stored.owner, Owner::None);
        assert_eq!(stored.status, JobStatus::NoPipeline);
    }

    #[test]
    fn huge_windows_saturate_instead_of_wrapping() {
        assert_eq!(window_nanos(Duration::from_secs(2)), 2_000_000_000);
        assert_eq!(window_nanos(Duration::MAX), i64::MAX);
    }
}
