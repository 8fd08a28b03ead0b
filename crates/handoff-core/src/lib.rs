//! Core domain model for the handoff pipeline: jobs, tasks, ownership and status.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod attributes;
pub mod patch;
pub mod selector;

pub use attributes::{AttributeError, AttributeInfo, AttributeParser};
pub use patch::{init_output_files, JobPatch};
pub use selector::{find_task, match_selector, MatchError};

pub const CRATE_NAME: &str = "handoff-core";

/// User-facing messages recorded in `ErrorDetails`.
pub mod messages {
    pub const JOB_INVALID: &str = "failed to validate job";
    pub const NO_MATCHING_TASK: &str = "no tasks could be matched to the input file name";
    pub const PIPELINE_FAILED: &str = "an error occurred in the processing pipeline";
    pub const PUBLISHING: &str = "failed to hand job to the next stage";
    pub const TRANSMIT_JOB: &str = "failed to transmit job";
    pub const FILE_TRANSMITTING: &str = "failed to transmit file";
    pub const FILE_WRITE: &str = "failed to write file";
    pub const FILE_ARCHIVING: &str = "failed to archive file";
    pub const FILE_INVALID: &str = "failed to validate file";
}

/// Stage that currently holds a job. Exactly one value at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Owner {
    #[default]
    None,
    Intake,
    InputSender,
    InputReceiver,
    Dispatch,
    OutputSender,
    OutputReceiver,
}

impl Owner {
    pub const ALL: [Owner; 7] = [
        Owner::None,
        Owner::Intake,
        Owner::InputSender,
        Owner::InputReceiver,
        Owner::Dispatch,
        Owner::OutputSender,
        Owner::OutputReceiver,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Owner::None => "none",
            Owner::Intake => "intake",
            Owner::InputSender => "input-sender",
            Owner::InputReceiver => "input-receiver",
            Owner::Dispatch => "dispatch",
            Owner::OutputSender => "output-sender",
            Owner::OutputReceiver => "output-receiver",
        }
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Owner {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Owner::ALL
            .into_iter()
            .find(|o| o.as_str() == s)
            .ok_or_else(|| ValidationError::UnknownOwner(s.to_string()))
    }
}

/// Coarse job lifecycle tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum JobStatus {
    #[default]
    Incomplete,
    NoPipeline,
    TransmissionFailed,
    FileError,
    PipelineError,
    Complete,
}

impl JobStatus {
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            JobStatus::TransmissionFailed | JobStatus::FileError | JobStatus::PipelineError
        )
    }
}

/// Status reported for the pipeline run attached to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineStatus {
    Processing,
    Complete,
    Failed,
    FileNotFound,
}

impl PipelineStatus {
    /// Parses the completion callback body. Only terminal outcomes are accepted.
    pub fn parse_reported(raw: &str) -> Option<Self> {
        let raw = raw.trim().trim_matches('"');
        if raw.eq_ignore_ascii_case("complete") {
            Some(PipelineStatus::Complete)
        } else if raw.eq_ignore_ascii_case("failed") {
            Some(PipelineStatus::Failed)
        } else {
            None
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, PipelineStatus::Complete | PipelineStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileStatus {
    Incomplete,
    Complete,
    WriteFailed,
    TransmissionFailed,
    Invalid,
    ArchiveFailed,
}

impl FileStatus {
    /// Terminal failures are never retried within the same pass.
    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            FileStatus::WriteFailed
                | FileStatus::TransmissionFailed
                | FileStatus::Invalid
                | FileStatus::ArchiveFailed
        )
    }
}

/// Manual review state, carried on the wire as an integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Verification {
    #[default]
    Pending,
    Accepted,
    Rejected,
}

impl From<Verification> for u8 {
    fn from(v: Verification) -> Self {
        match v {
            Verification::Pending => 0,
            Verification::Accepted => 1,
            Verification::Rejected => 2,
        }
    }
}

impl TryFrom<u8> for Verification {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Verification::Pending),
            1 => Ok(Verification::Accepted),
            2 => Ok(Verification::Rejected),
            other => Err(format!("unknown verification state {other}")),
        }
    }
}

/// Last user-facing failure, attributed to the stage that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ErrorDetails {
    pub owner: Owner,
    pub error: String,
}

impl ErrorDetails {
    pub fn new(owner: Owner, error: impl Into<String>) -> Self {
        Self {
            owner,
            error: error.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct FileInfo {
    pub hostname: String,
    pub dir_name: String,
    pub name: String,
    pub extension: String,
    pub archive_name: String,
    pub viewable: String,
    pub attributes: BTreeMap<String, String>,
}

impl FileInfo {
    pub fn path(&self) -> PathBuf {
        PathBuf::from(&self.dir_name).join(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct OutputFile {
    pub dir_name: String,
    pub name: String,
    pub extension: String,
    pub archive_name: String,
    pub viewable: String,
    pub status: Option<FileStatus>,
    pub owner: Owner,
    pub error_details: Option<ErrorDetails>,
}

impl OutputFile {
    pub fn path(&self) -> PathBuf {
        PathBuf::from(&self.dir_name).join(&self.name)
    }

    pub fn is_failed(&self) -> bool {
        self.status.is_some_and(|s| s.is_failed())
    }

    pub fn mark(&mut self, status: FileStatus, owner: Owner, error: Option<&str>) {
        self.status = Some(status);
        self.owner = owner;
        self.error_details = error.map(|e| ErrorDetails::new(owner, e));
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PipelineDetails {
    pub task_id: String,
    pub status: Option<PipelineStatus>,
    #[serde(rename = "QCFlags")]
    pub qc_flags: String,
    pub output_file_host: String,
    pub output_files: Vec<OutputFile>,
    pub results: String,
}

/// The unit of work tracked end-to-end through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Job {
    pub id: String,
    pub owner: Owner,
    pub input_file: FileInfo,
    pub pipeline_details: PipelineDetails,
    /// UTC nanoseconds of the last mutation.
    pub last_updated: i64,
    pub status: JobStatus,
    pub error_details: Option<ErrorDetails>,
    pub verification: Verification,
}

impl Job {
    /// Requires the input file location to be fully described.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let f = &self.input_file;
        for (field, value) in [
            ("InputFile.Hostname", &f.hostname),
            ("InputFile.DirName", &f.dir_name),
            ("InputFile.Name", &f.name),
            ("InputFile.Extension", &f.extension),
        ] {
            if value.trim().is_empty() {
                return Err(ValidationError::EmptyField(field));
            }
        }
        Ok(())
    }

    /// Composite dedup key over the input file location.
    pub fn input_file_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.input_file.hostname, self.input_file.dir_name, self.input_file.name
        )
    }

    pub fn full_input_location(&self) -> String {
        format!(
            "{}:{}",
            self.input_file.hostname,
            self.input_file.path().display()
        )
    }

    pub fn touch(&mut self) {
        self.last_updated = now_nanos();
    }

    pub fn has_output_files(&self) -> bool {
        !self.pipeline_details.output_files.is_empty()
    }
}

/// Routing rule binding a job selector to a destination pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub job_selector: String,
    pub pipeline_id: String,
    pub result_file_folder: String,
    pub model_parameters: BTreeMap<String, String>,
    pub last_updated: i64,
}

impl Task {
    pub fn validate_new(&self) -> Result<(), ValidationError> {
        if !self.id.is_empty() {
            return Err(ValidationError::IdAlreadySet);
        }
        for (field, value) in [
            ("JobSelector", &self.job_selector),
            ("PipelineId", &self.pipeline_id),
            ("Description", &self.description),
        ] {
            if value.trim().is_empty() {
                return Err(ValidationError::EmptyField(field));
            }
        }
        Ok(())
    }

    /// Copies non-empty fields from `incoming`; model parameters are merged.
    pub fn replace_with(&mut self, incoming: &Task) {
        if !incoming.description.is_empty() {
            self.description = incoming.description.clone();
        }
        if !incoming.job_selector.is_empty() {
            self.job_selector = incoming.job_selector.clone();
        }
        if !incoming.pipeline_id.is_empty() {
            self.pipeline_id = incoming.pipeline_id.clone();
        }
        if !incoming.result_file_folder.is_empty() {
            self.result_file_folder = incoming.result_file_folder.clone();
        }
        for (k, v) in &incoming.model_parameters {
            self.model_parameters.insert(k.clone(), v.clone());
        }
        self.touch();
    }

    /// Last segment of the pipeline binding, used to group rejected files.
    pub fn model_name(&self) -> &str {
        self.pipeline_id
            .rsplit('/')
            .find(|s| !s.is_empty())
            .unwrap_or(&self.pipeline_id)
    }

    pub fn touch(&mut self) {
        self.last_updated = now_nanos();
    }
}

/// Launch request sent to the external pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PipelineParams {
    pub input_file_location: String,
    pub output_file_folder: String,
    pub model_params: BTreeMap<String, String>,
    pub job_update_url: String,
    pub pipeline_status_url: String,
}

impl PipelineParams {
    /// Callback URLs are built from the externally reachable repository and dispatch bases.
    pub fn for_job(job: &Job, task: &Task, job_repo_base: &str, dispatch_base: &str) -> Self {
        let output_file_folder = if task.result_file_folder.is_empty() {
            job.input_file.dir_name.clone()
        } else {
            task.result_file_folder.clone()
        };
        let job_repo_base = job_repo_base.trim_end_matches('/');
        let dispatch_base = dispatch_base.trim_end_matches('/');
        Self {
            input_file_location: job.input_file.path().display().to_string(),
            output_file_folder,
            model_params: task.model_parameters.clone(),
            job_update_url: format!("{job_repo_base}/job/{}/pipeline/{}", job.id, task.id),
            pipeline_status_url: format!("{dispatch_base}/pipelineStatus/{}/{}", job.id, task.id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{0} must not be empty")]
    EmptyField(&'static str),
    #[error("id must not be set on create")]
    IdAlreadySet,
    #[error("unknown owner {0:?}")]
    UnknownOwner(String),
    #[error("invalid file name {0:?}")]
    InvalidFileName(String),
}

pub fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

/// Rejects names that could escape the folder they are joined onto.
pub fn ensure_plain_file_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() || name.contains("..") || name.contains('/') || name.contains('\\') {
        return Err(ValidationError::InvalidFileName(name.to_string()));
    }
    Ok(())
}

/// Rejects directories with parent traversal or that are not absolute.
pub fn ensure_safe_dir(dir: &str) -> Result<(), ValidationError> {
    let absolute = dir.starts_with('/') || dir.get(1..3) == Some(":\\");
    if !absolute || dir.split(['/', '\\']).any(|seg| seg == "..") {
        return Err(ValidationError::InvalidFileName(dir.to_string()));
    }
    Ok(())
}
