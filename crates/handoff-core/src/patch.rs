//! Typed sparse patch for job records.
//!
//! On the wire a patch is a flat JSON object keyed by dotted field paths
//! (`"PipelineDetails.Status"`). Only the keys present are applied.

use serde::{Deserialize, Deserializer, Serialize};

use crate::{ErrorDetails, FileStatus, Job, JobStatus, OutputFile, Owner, PipelineStatus};

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobPatch {
    #[serde(rename = "Owner", default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<Owner>,
    #[serde(rename = "Status", default, skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    #[serde(rename = "InputFile.Hostname", default, skip_serializing_if = "Option::is_none")]
    pub input_hostname: Option<String>,
    #[serde(rename = "InputFile.DirName", default, skip_serializing_if = "Option::is_none")]
    pub input_dir_name: Option<String>,
    #[serde(rename = "InputFile.ArchiveName", default, skip_serializing_if = "Option::is_none")]
    pub input_archive_name: Option<String>,
    #[serde(rename = "InputFile.Viewable", default, skip_serializing_if = "Option::is_none")]
    pub input_viewable: Option<String>,
    #[serde(rename = "PipelineDetails.TaskId", default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(rename = "PipelineDetails.Status", default, skip_serializing_if = "Option::is_none")]
    pub pipeline_status: Option<PipelineStatus>,
    #[serde(rename = "PipelineDetails.QCFlags", default, skip_serializing_if = "Option::is_none")]
    pub qc_flags: Option<String>,
    #[serde(
        rename = "PipelineDetails.OutputFileHost",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub output_file_host: Option<String>,
    #[serde(
        rename = "PipelineDetails.OutputFiles",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub output_files: Option<Vec<OutputFile>>,
    #[serde(rename = "PipelineDetails.Results", default, skip_serializing_if = "Option::is_none")]
    pub results: Option<String>,
    /// Absent leaves the details alone, `null` clears them.
    #[serde(
        rename = "ErrorDetails",
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub error_details: Option<Option<ErrorDetails>>,
}

fn double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl JobPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn owner(mut self, owner: Owner) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn input_location(mut self, hostname: impl Into<String>, dir_name: impl Into<String>) -> Self {
        self.input_hostname = Some(hostname.into());
        self.input_dir_name = Some(dir_name.into());
        self
    }

    pub fn input_archive(mut self, archive_name: impl Into<String>, viewable: impl Into<String>) -> Self {
        self.input_archive_name = Some(archive_name.into());
        self.input_viewable = Some(viewable.into());
        self
    }

    pub fn task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn pipeline_status(mut self, status: PipelineStatus) -> Self {
        self.pipeline_status = Some(status);
        self
    }

    pub fn qc_flags(mut self, flags: impl Into<String>) -> Self {
        self.qc_flags = Some(flags.into());
        self
    }

    pub fn output_file_host(mut self, host: impl Into<String>) -> Self {
        self.output_file_host = Some(host.into());
        self
    }

    pub fn output_files(mut self, files: Vec<OutputFile>) -> Self {
        self.output_files = Some(files);
        self
    }

    pub fn results(mut self, results: impl Into<String>) -> Self {
        self.results = Some(results.into());
        self
    }

    pub fn error(mut self, owner: Owner, message: impl Into<String>) -> Self {
        self.error_details = Some(Some(ErrorDetails::new(owner, message)));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.error_details = Some(None);
        self
    }

    /// Sets or clears the details in one call.
    pub fn error_details(mut self, details: Option<ErrorDetails>) -> Self {
        self.error_details = Some(details);
        self
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Applies present fields to `job`; returns the previous owner when it changes.
    pub fn apply(&self, job: &mut Job) -> Option<Owner> {
        let previous_owner = job.owner;
        if let Some(owner) = self.owner {
            job.owner = owner;
        }
        if let Some(status) = self.status {
            job.status = status;
        }
        if let Some(v) = &self.input_hostname {
            job.input_file.hostname = v.clone();
        }
        if let Some(v) = &self.input_dir_name {
            job.input_file.dir_name = v.clone();
        }
        if let Some(v) = &self.input_archive_name {
            job.input_file.archive_name = v.clone();
        }
        if let Some(v) = &self.input_viewable {
            job.input_file.viewable = v.clone();
        }

        let details = &mut job.pipeline_details;
        if let Some(v) = &self.task_id {
            details.task_id = v.clone();
        }
        if let Some(v) = self.pipeline_status {
            details.status = Some(v);
        }
        if let Some(v) = &self.qc_flags {
            details.qc_flags = v.clone();
        }
        if let Some(v) = &self.output_file_host {
            details.output_file_host = v.clone();
        }
        if let Some(v) = &self.output_files {
            details.output_files = v.clone();
        }
        if let Some(v) = &self.results {
            details.results = v.clone();
        }
        if let Some(v) = &self.error_details {
            job.error_details = v.clone();
        }

        (job.owner != previous_owner).then_some(previous_owner)
    }
}

/// Sets every output file without a status to `Incomplete` under `owner`.
pub fn init_output_files(files: &mut [OutputFile], owner: Owner) {
    for file in files.iter_mut().filter(|f| f.status.is_none()) {
        file.status = Some(FileStatus::Incomplete);
        file.owner = owner;
    }
}
