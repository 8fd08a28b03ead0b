//! Recording fakes for controller tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use handoff_adapters::{
    FetchedFile, InputTransfer, JobHandler, OutputSource, PipelineLauncher, PortError,
    TaskMatcherPort,
};
use handoff_core::{FileInfo, Job, PipelineParams, Task};
use handoff_storage::{FileStore, JobRepository, MemoryStore, TaskRepository};

pub fn repos() -> (Arc<JobRepository>, Arc<TaskRepository>) {
    let store = Arc::new(MemoryStore::new());
    (
        Arc::new(JobRepository::new(store.clone())),
        Arc::new(TaskRepository::new(store)),
    )
}

pub fn mk_job(host: &str, dir: &str, name: &str) -> Job {
    let extension = name.rsplit_once('.').map(|(_, e)| e).unwrap_or("bin");
    Job {
        input_file: FileInfo {
            hostname: host.into(),
            dir_name: dir.into(),
            name: name.into(),
            extension: extension.into(),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn mk_task(selector: &str) -> Task {
    Task {
        description: "test task".into(),
        job_selector: selector.into(),
        pipeline_id: "pipelines/segment".into(),
        ..Default::default()
    }
}

#[derive(Default)]
pub struct RecordingHandler {
    pub calls: Mutex<Vec<Job>>,
    pub fail: Mutex<Option<PortError>>,
}

impl RecordingHandler {
    pub fn failing(err: PortError) -> Self {
        Self {
            fail: Mutex::new(Some(err)),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<Job> {
        self.calls.lock().unwrap().clone()
    }

    pub fn heal(&self) {
        *self.fail.lock().unwrap() = None;
    }
}

#[async_trait]
impl JobHandler for RecordingHandler {
    async fn handle_job(&self, job: &Job) -> Result<(), PortError> {
        if let Some(err) = self.fail.lock().unwrap().clone() {
            return Err(err);
        }
        self.calls.lock().unwrap().push(job.clone());
        Ok(())
    }
}

pub struct FixedMatcher(pub Result<bool, PortError>);

#[async_trait]
impl TaskMatcherPort for FixedMatcher {
    async fn match_task(&self, _job: &Job) -> Result<bool, PortError> {
        self.0.clone()
    }
}

#[derive(Default)]
pub struct RecordingLauncher {
    pub calls: Mutex<Vec<(String, PipelineParams)>>,
    pub fail: Option<PortError>,
}

impl RecordingLauncher {
    pub fn calls(&self) -> Vec<(String, PipelineParams)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PipelineLauncher for RecordingLauncher {
    async fn launch(&self, pipeline_id: &str, params: &PipelineParams) -> Result<(), PortError> {
        if let Some(err) = &self.fail {
            return Err(err.clone());
        }
        self.calls
            .lock()
            .unwrap()
            .push((pipeline_id.to_string(), params.clone()));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingTransfer {
    pub jobs: Mutex<Vec<Job>>,
    pub files: Mutex<Vec<(String, String, Vec<u8>)>>,
    pub fail: Option<PortError>,
}

#[async_trait]
impl InputTransfer for RecordingTransfer {
    async fn transmit_job(&self, job: &Job) -> Result<(), PortError> {
        if let Some(err) = &self.fail {
            return Err(err.clone());
        }
        self.jobs.lock().unwrap().push(job.clone());
        Ok(())
    }

    async fn transmit_file(
        &self,
        job_id: &str,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<(), PortError> {
        if let Some(err) = &self.fail {
            return Err(err.clone());
        }
        self.files
            .lock()
            .unwrap()
            .push((job_id.to_string(), file_name.to_string(), bytes));
        Ok(())
    }
}

/// Serves output files by index; indices without content fail to transmit.
#[derive(Default)]
pub struct FakeOutputSource {
    pub files: HashMap<usize, Vec<u8>>,
    pub wrong_checksum: Vec<usize>,
    pub archived: Mutex<Vec<String>>,
    pub archive_error: Option<PortError>,
}

#[async_trait]
impl OutputSource for FakeOutputSource {
    async fn fetch_file(&self, _job_id: &str, index: usize) -> Result<FetchedFile, PortError> {
        let bytes = self
            .files
            .get(&index)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("file {index}")))?;
        let sha256 = if self.wrong_checksum.contains(&index) {
            "0".repeat(64)
        } else {
            FileStore::sha256_hex(&bytes)
        };
        Ok(FetchedFile {
            bytes,
            sha256: Some(sha256),
        })
    }

    async fn archive(&self, job_id: &str) -> Result<(), PortError> {
        if let Some(err) = &self.archive_error {
            return Err(err.clone());
        }
        self.archived.lock().unwrap().push(job_id.to_string());
        Ok(())
    }
}
