//! Entry point for newly observed files.

use std::sync::Arc;

use async_trait::async_trait;
use handoff_adapters::{BackoffPolicy, JobHandler, JobRepoPort, TaskMatcherPort};
use handoff_core::{messages, AttributeParser, Job, JobPatch, JobStatus, Owner};
use handoff_storage::CreateStatus;
use tracing::{debug, info, warn};

use crate::{persist, Disposition, Reconcile, ReconcileSummary, StageError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntakeOutcome {
    Forwarded(Job),
    NoPipeline(Job),
    AlreadyProcessed(Job),
}

impl IntakeOutcome {
    pub fn job(&self) -> &Job {
        match self {
            IntakeOutcome::Forwarded(job)
            | IntakeOutcome::NoPipeline(job)
            | IntakeOutcome::AlreadyProcessed(job) => job,
        }
    }
}

#[derive(Clone)]
pub struct Intake {
    jobs: Arc<dyn JobRepoPort>,
    matcher: Arc<dyn TaskMatcherPort>,
    next: Arc<dyn JobHandler>,
    parser: Arc<AttributeParser>,
    backoff: BackoffPolicy,
}

impl Intake {
    pub fn new(
        jobs: Arc<dyn JobRepoPort>,
        matcher: Arc<dyn TaskMatcherPort>,
        next: Arc<dyn JobHandler>,
    ) -> Self {
        Self {
            jobs,
            matcher,
            next,
            parser: Arc::new(AttributeParser::default()),
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_attribute_parser(mut self, parser: AttributeParser) -> Self {
        self.parser = Arc::new(parser);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Registers a newly seen input file and hands it on when a task wants it.
    pub async fn notify_new_file(&self, mut job: Job) -> Result<IntakeOutcome, StageError> {
        self.parser.parse_into(&mut job.input_file);
        job.owner = Owner::Intake;
        job.status = JobStatus::Incomplete;

        let (status, stored) = self.jobs.create(job).await.map_err(StageError::Repo)?;
        if status == CreateStatus::Exists
            && stored.owner != Owner::Intake
            && stored.status != JobStatus::Incomplete
        {
            debug!(job_id = %stored.id, owner = %stored.owner, "file already processed");
            return Ok(IntakeOutcome::AlreadyProcessed(stored));
        }
        self.route(stored).await
    }

    async fn route(&self, job: Job) -> Result<IntakeOutcome, StageError> {
        let matched = self
            .matcher
            .match_task(&job)
            .await
            .map_err(|err| StageError::forward("dispatch", err))?;

        if !matched {
            let patch = JobPatch::new()
                .owner(Owner::None)
                .status(JobStatus::NoPipeline)
                .error(Owner::Intake, messages::NO_MATCHING_TASK);
            let job = persist(self.jobs.as_ref(), &self.backoff, &job.id, &patch).await?;
            info!(job_id = %job.id, input = %job.full_input_location(), "no pipeline for file");
            return Ok(IntakeOutcome::NoPipeline(job));
        }

        self.next
            .handle_job(&job)
            .await
            .map_err(|err| StageError::forward("next stage", err))?;
        info!(job_id = %job.id, input = %job.full_input_location(), "job handed on");
        Ok(IntakeOutcome::Forwarded(job))
    }
}

#[async_trait]
impl Reconcile for Intake {
    fn stage(&self) -> Owner {
        Owner::Intake
    }

    async fn reconcile(&self) -> Result<ReconcileSummary, StageError> {
        let jobs = self
            .jobs
            .get_by_owner(Owner::Intake)
            .await
            .map_err(StageError::Repo)?;

        let mut summary = ReconcileSummary::default();
        for job in jobs {
            let id = job.id.clone();
            let disposition = match self.route(job).await {
                Ok(IntakeOutcome::NoPipeline(_)) => Disposition::Terminated,
                Ok(_) => Disposition::Forwarded,
                Err(err) => {
                    warn!(job_id = %id, error = %err, "intake retry failed");
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
    use super::*;
    use crate::testing::{mk_job, repos, FixedMatcher, RecordingHandler};
    use handoff_adapters::PortError;
    use handoff_storage::JobRepository;

    fn intake(
        matched: Result<bool, PortError>,
        next: Arc<RecordingHandler>,
    ) -> (Intake, Arc<JobRepository>) {
        let (jobs, _) = repos();
        let intake = Intake::new(jobs.clone(), Arc::new(FixedMatcher(matched)), next);
        (intake, jobs)
    }

    #[tokio::test]
    async fn matched_file_is_forwarded_with_intake_ownership() {
        let next = Arc::new(RecordingHandler::default());
        let (intake, jobs) = intake(Ok(true), next.clone());

        let outcome = intake
            .notify_new_file(mk_job("gw", "/in", "x.tiff"))
            .await
            .unwrap();
        assert!(matches!(outcome, IntakeOutcome::Forwarded(_)));
        let stored = jobs.get_by_id(&outcome.job().id).await.unwrap();
        assert_eq!(stored.owner, Owner::Intake);
        assert_eq!(next.calls().len(), 1);
    }

    #[tokio::test]
    async fn unmatched_file_terminates_with_no_pipeline() {
        let next = Arc::new(RecordingHandler::default());
        let (intake, jobs) = intake(Ok(false), next.clone());

        let outcome = intake
            .notify_new_file(mk_job("gw", "/in", "x.tiff"))
            .await
            .unwrap();
        let stored = jobs.get_by_id(&outcome.job().id).await.unwrap();
        assert_eq!(stored.owner, Owner::None);
        assert_eq!(stored.status, JobStatus::NoPipeline);
        assert_eq!(stored.error_details.unwrap().owner, Owner::Intake);
        assert!(next.calls().is_empty());
    }

    #[tokio::test]
    async fn processed_file_is_reported_instead_of_rerouted() {
        let next = Arc::new(RecordingHandler::default());
        let (intake, _) = intake(Ok(false), next);

        let first = intake
            .notify_new_file(mk_job("gw", "/in", "x.tiff"))
            .await
            .unwrap();
        let second = intake
            .notify_new_file(mk_job("gw", "/in", "x.tiff"))
            .await
            .unwrap();
        assert!(matches!(second, IntakeOutcome::AlreadyProcessed(_)));
        assert_eq!(second.job().id, first.job().id);
    }

    #[tokio::test]
    async fn failed_handoff_keeps_intake_ownership_until_reconcile() {
        let next = Arc::new(RecordingHandler::failing(PortError::Unavailable(
            "connection refused".into(),
        )));
        let (intake, jobs) = intake(Ok(true), next.clone());

        let err = intake
            .notify_new_file(mk_job("gw", "/in", "x.tiff"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::BadGateway);
        let pending = jobs.get_by_owner(Owner::Intake).await.unwrap();
        assert_eq!(pending.len(), 1);

        next.heal();
        let summary = intake.reconcile().await.unwrap();
        assert_eq!(summary.scanned, 1);
        assert_eq!(summary.forwarded, 1);
        assert_eq!(next.calls().len(), 1);
    }

    #[tokio::test]
    async fn matcher_outage_maps_to_bad_gateway() {
        let next = Arc::new(RecordingHandler::default());
        let (intake, _) = intake(Err(PortError::Unavailable("down".into())), next);
        let err = intake
            .notify_new_file(mk_job("gw", "/in", "x.tiff"))
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Forward { stage: "dispatch", .. }));
    }

    #[tokio::test]
    async fn attributes_are_parsed_from_the_file_name() {
        let next = Arc::new(RecordingHandler::default());
        let (intake, _) = intake(Ok(true), next.clone());
        let intake = intake.with_attribute_parser(
            AttributeParser::from_yaml_str("timepoint: { Id: t, DataType: int }").unwrap(),
        );

        intake
            .notify_new_file(mk_job("gw", "/in", "plate-t12.tiff"))
            .await
            .unwrap();
        let forwarded = &next.calls()[0];
        assert_eq!(forwarded.input_file.attributes["timepoint"], "12");
    }
}
