//! Ownership controllers for each pipeline stage, plus the reconciliation
//! plumbing they share.
//!
//! Every controller follows the same shape: re-check its preconditions, do
//! its unit of work, then record the result and the ownership change in a
//! single repository update. A failed handoff leaves the owner unchanged so
//! the next reconcile run picks the job up again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use handoff_adapters::{BackoffPolicy, JobRepoPort, PortError};
use handoff_core::{Job, JobPatch, MatchError, Owner, ValidationError};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job as CronJob, JobScheduler};
use tracing::{info, info_span, warn, Instrument};

pub mod config;
pub mod dispatch;
pub mod input_receiver;
pub mod input_sender;
pub mod intake;
pub mod output_receiver;
pub mod output_sender;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{ServiceConfig, StoreKind};
pub use dispatch::{Dispatch, DispatchOutcome};
pub use input_receiver::InputReceiver;
pub use input_sender::InputSender;
pub use intake::{Intake, IntakeOutcome};
pub use output_receiver::OutputReceiver;
pub use output_sender::OutputSender;

pub const CRATE_NAME: &str = "handoff-stages";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    NotFound,
    Conflict,
    BadGateway,
    Internal,
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error("{0}")]
    Invalid(String),
    #[error("{0}")]
    NotFound(String),
    #[error("job repository: {0}")]
    Repo(PortError),
    #[error("handoff to {stage} failed: {source}")]
    Forward {
        stage: &'static str,
        #[source]
        source: PortError,
    },
    #[error("{0}")]
    Internal(String),
}

impl StageError {
    pub fn forward(stage: &'static str, source: PortError) -> Self {
        StageError::Forward { stage, source }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StageError::Invalid(_) => ErrorKind::BadRequest,
            StageError::NotFound(_) => ErrorKind::NotFound,
            StageError::Repo(err) => match err {
                PortError::NotFound(_) => ErrorKind::NotFound,
                PortError::Conflict(_) => ErrorKind::Conflict,
                PortError::Invalid(_) => ErrorKind::BadRequest,
                PortError::Rejected { status, .. } if (400..500).contains(status) => {
                    ErrorKind::BadRequest
                }
                PortError::Rejected { .. } | PortError::Unavailable(_) => ErrorKind::Internal,
            },
            StageError::Forward { .. } => ErrorKind::BadGateway,
            StageError::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<ValidationError> for StageError {
    fn from(err: ValidationError) -> Self {
        StageError::Invalid(err.to_string())
    }
}

impl From<MatchError> for StageError {
    fn from(err: MatchError) -> Self {
        StageError::Invalid(err.to_string())
    }
}

/// What a reconcile pass did with one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Forwarded,
    Terminated,
    Unchanged,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub scanned: usize,
    pub forwarded: usize,
    pub terminated: usize,
    pub unchanged: usize,
    pub failed: usize,
}

impl ReconcileSummary {
    pub fn record(&mut self, disposition: Disposition) {
        self.scanned += 1;
        match disposition {
            Disposition::Forwarded => self.forwarded += 1,
            Disposition::Terminated => self.terminated += 1,
            Disposition::Unchanged => self.unchanged += 1,
            Disposition::Failed => self.failed += 1,
        }
    }
}

/// Jobs held by a transmission stage between handoff steps.
/// Never authoritative: a miss falls back to the repository.
#[derive(Debug, Clone, Default)]
pub struct JobCache {
    inner: Arc<RwLock<HashMap<String, Job>>>,
}

impl JobCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, job: Job) {
        self.inner.write().await.insert(job.id.clone(), job);
    }

    pub async fn get(&self, id: &str) -> Option<Job> {
        self.inner.read().await.get(id).cloned()
    }

    pub async fn remove(&self, id: &str) -> Option<Job> {
        self.inner.write().await.remove(id)
    }

    pub async fn replace_all(&self, jobs: impl IntoIterator<Item = Job>) {
        let mut map = self.inner.write().await;
        map.clear();
        map.extend(jobs.into_iter().map(|j| (j.id.clone(), j)));
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

/// Applies `patch`, re-issuing it after a lost optimistic-lock race.
pub async fn update_with_retry(
    jobs: &dyn JobRepoPort,
    backoff: &BackoffPolicy,
    id: &str,
    patch: &JobPatch,
) -> Result<Job, PortError> {
    let mut attempt = 0;
    loop {
        match jobs.update(id, patch).await {
            Err(err) if err.is_conflict() && attempt < backoff.max_retries => {
                tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

pub(crate) async fn persist(
    jobs: &dyn JobRepoPort,
    backoff: &BackoffPolicy,
    id: &str,
    patch: &JobPatch,
) -> Result<Job, StageError> {
    update_with_retry(jobs, backoff, id, patch)
        .await
        .map_err(StageError::Repo)
}

pub(crate) async fn file_exists(path: &std::path::Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Parses retry windows such as `250ms`, `30s`, `5m` or `1h30m`.
pub fn parse_timeout(raw: &str) -> Option<Duration> {
    let mut rest = raw.trim();
    if rest.is_empty() {
        return None;
    }
    let mut total = Duration::ZERO;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit())?;
        if digits == 0 {
            return None;
        }
        let n: u64 = rest[..digits].parse().ok()?;
        let end = rest[digits..]
            .find(|c: char| c.is_ascii_digit())
            .map_or(rest.len(), |i| digits + i);
        let part = match &rest[digits..end] {
            "ns" => Duration::from_nanos(n),
            "us" | "µs" => Duration::from_micros(n),
            "ms" => Duration::from_millis(n),
            "s" => Duration::from_secs(n),
            "m" => Duration::from_secs(n.checked_mul(60)?),
            "h" => Duration::from_secs(n.checked_mul(3600)?),
            _ => return None,
        };
        total = total.checked_add(part)?;
        rest = &rest[end..];
    }
    Some(total)
}

#[async_trait]
pub trait Reconcile: Send + Sync + 'static {
    fn stage(&self) -> Owner;
    async fn reconcile(&self) -> Result<ReconcileSummary, StageError>;
}

pub async fn run_reconcile(reconciler: &dyn Reconcile) -> Result<ReconcileSummary, StageError> {
    let span = info_span!("reconcile", stage = %reconciler.stage());
    async {
        let result = reconciler.reconcile().await;
        match &result {
            Ok(summary) => info!(
                scanned = summary.scanned,
                forwarded = summary.forwarded,
                terminated = summary.terminated,
                unchanged = summary.unchanged,
                failed = summary.failed,
                "reconcile finished"
            ),
            Err(err) => warn!(error = %err, "reconcile failed"),
        }
        result
    }
    .instrument(span)
    .await
}

/// Builds a scheduler that reconciles on `cron` (six fields, seconds first).
pub async fn maybe_build_scheduler(
    cron: Option<&str>,
    reconciler: Arc<dyn Reconcile>,
) -> anyhow::Result<Option<JobScheduler>> {
    let Some(cron) = cron else {
        return Ok(None);
    };

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = CronJob::new_async(cron, move |_uuid, _l| {
        let reconciler = reconciler.clone();
        Box::pin(async move {
            let _ = run_reconcile(reconciler.as_ref()).await;
        })
    })
    .with_context(|| format!("creating reconcile job for cron {cron}"))?;
    sched.add(job).await.context("adding reconcile job")?;
    Ok(Some(sched))
}
