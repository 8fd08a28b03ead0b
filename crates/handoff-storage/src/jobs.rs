//! Job persistence over a [`KvStore`].
//!
//! Layout:
//! - `job`: id -> job json
//! - `job|input_file`: `host:dir:name` -> id (dedup index)
//! - `job|input_file_by_id`: id -> the dedup key the job was created under
//! - `job|owner:{owner}`: id -> "" (ownership index)
//! - `lock:job:{id}`: token rewritten by every committed write
//! - `lock:input_file:{host:dir:name}`: guards concurrent creates of one file

use std::sync::Arc;

use handoff_core::{Job, JobPatch, Owner, ValidationError};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::{lock_key, new_lock_token, KvStore, Reply, StoreError, Transaction, SEPARATOR};

pub const JOB_KEY: &str = "job";
pub const INPUT_FILE_INDEX: &str = "job|input_file";
pub const INPUT_FILE_BY_ID: &str = "job|input_file_by_id";

pub fn owner_key(owner: Owner) -> String {
    format!("job|owner{SEPARATOR}{owner}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateStatus {
    Created,
    Exists,
}

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("id must not be set on create")]
    AlreadyHasId,
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error("{entity} {id} was modified concurrently, retry the update")]
    Conflict { entity: &'static str, id: String },
    #[error("delete of {entity} {id} found missing entries")]
    DeleteIncomplete { entity: &'static str, id: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RepoError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, RepoError::Conflict { .. })
    }
}

pub(crate) fn decode<T: serde::de::DeserializeOwned>(key: &str, raw: &str) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        message: e.to_string(),
    })
}

pub(crate) fn encode<T: serde::Serialize>(key: &str, value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        message: e.to_string(),
    })
}

pub(crate) fn expect_counts(replies: &[Reply], expected: &[u64]) -> Result<(), StoreError> {
    if replies.len() != expected.len() {
        return Err(StoreError::Protocol(format!(
            "expected {} replies, got {}",
            expected.len(),
            replies.len()
        )));
    }
    for (i, (reply, want)) in replies.iter().zip(expected).enumerate() {
        if reply.count() != *want {
            return Err(StoreError::Protocol(format!(
                "command {i} returned {reply:?}, expected {want}"
            )));
        }
    }
    Ok(())
}

#[derive(Clone)]
pub struct JobRepository {
    store: Arc<dyn KvStore>,
}

impl JobRepository {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Creates a job, or returns the stored job already registered for the same input file.
    pub async fn create(&self, mut job: Job) -> Result<(CreateStatus, Job), RepoError> {
        if !job.id.is_empty() {
            return Err(RepoError::AlreadyHasId);
        }
        job.validate()?;

        let dedup_key = job.input_file_key();
        let dedup_lock = lock_key("input_file", &dedup_key);
        let watch = self.store.watch(std::slice::from_ref(&dedup_lock)).await?;
        if let Some(existing) = self.find_by_input_file(&dedup_key).await? {
            return Ok((CreateStatus::Exists, existing));
        }

        job.id = Uuid::new_v4().to_string();
        job.touch();
        let mut tx = Transaction::new();
        tx.set(dedup_lock, job.id.clone())
            .set(lock_key(JOB_KEY, &job.id), new_lock_token())
            .hset(JOB_KEY, job.id.clone(), encode(JOB_KEY, &job)?)
            .hset(INPUT_FILE_INDEX, dedup_key.clone(), job.id.clone())
            .hset(INPUT_FILE_BY_ID, job.id.clone(), dedup_key.clone())
            .hset(owner_key(job.owner), job.id.clone(), "");

        match self.store.exec(Some(watch), tx).await {
            Ok(replies) => {
                let mut expected = [1, 1, 1, 1, 1, 1];
                // The dedup HSET may overwrite an entry left by a deleted job.
                expected[3] = replies.get(3).map_or(1, |r| r.count().min(1));
                expect_counts(&replies, &expected)?;
                debug!(job_id = %job.id, input = %dedup_key, owner = %job.owner, "job created");
                Ok((CreateStatus::Created, job))
            }
            // A concurrent create for the same file committed first.
            Err(StoreError::Conflict) => match self.find_by_input_file(&dedup_key).await? {
                Some(existing) => Ok((CreateStatus::Exists, existing)),
                None => Err(RepoError::Conflict {
                    entity: "job",
                    id: dedup_key,
                }),
            },
            Err(err) => Err(err.into()),
        }
    }

    /// Applies `patch` under the job's lock token and keeps the owner index in step.
    pub async fn update(&self, id: &str, patch: &JobPatch) -> Result<Job, RepoError> {
        if !self.store.hexists(JOB_KEY, id).await? {
            return Err(not_found(id));
        }

        let lock = lock_key(JOB_KEY, id);
        let watch = self.store.watch(std::slice::from_ref(&lock)).await?;
        let mut job = self.get_by_id(id).await?;
        let previous_owner = patch.apply(&mut job);
        job.touch();
        job.validate()?;

        let mut tx = Transaction::new();
        tx.hset(JOB_KEY, id, encode(JOB_KEY, &job)?);
        if let Some(previous) = previous_owner {
            tx.hdel(owner_key(previous), id)
                .hset(owner_key(job.owner), id, "");
        }
        tx.set(lock, new_lock_token());

        match self.store.exec(Some(watch), tx).await {
            Ok(_) => {
                if let Some(previous) = previous_owner {
                    debug!(job_id = %id, from = %previous, to = %job.owner, "job ownership moved");
                }
                Ok(job)
            }
            Err(StoreError::Conflict) => Err(RepoError::Conflict {
                entity: "job",
                id: id.to_string(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// Removes the record and both index entries in one transaction.
    pub async fn delete(&self, id: &str) -> Result<(), RepoError> {
        let lock = lock_key(JOB_KEY, id);
        let watch = self.store.watch(std::slice::from_ref(&lock)).await?;
        let job = self.get_by_id(id).await?;
        // Relocation rewrites the input location, so the key comes from create time.
        let dedup_key = match self.store.hget(INPUT_FILE_BY_ID, id).await? {
            Some(key) => key,
            None => job.input_file_key(),
        };

        let mut tx = Transaction::new();
        tx.del(lock)
            .hdel(JOB_KEY, id)
            .hdel(owner_key(job.owner), id)
            .hdel(INPUT_FILE_BY_ID, id);
        if self.store.hget(INPUT_FILE_INDEX, &dedup_key).await?.as_deref() == Some(id) {
            tx.hdel(INPUT_FILE_INDEX, dedup_key.clone())
                .del(lock_key("input_file", &dedup_key));
        }

        let replies = match self.store.exec(Some(watch), tx).await {
            Ok(replies) => replies,
            Err(StoreError::Conflict) => {
                return Err(RepoError::Conflict {
                    entity: "job",
                    id: id.to_string(),
                })
            }
            Err(err) => return Err(err.into()),
        };
        if replies.iter().take(3).any(|r| r.count() != 1) {
            return Err(RepoError::DeleteIncomplete {
                entity: "job",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Job, RepoError> {
        match self.store.hget(JOB_KEY, id).await? {
            Some(raw) => Ok(decode(JOB_KEY, &raw)?),
            None => Err(not_found(id)),
        }
    }

    pub async fn get_all(&self) -> Result<Vec<Job>, RepoError> {
        let raw = self.store.hvals(JOB_KEY).await?;
        raw.iter()
            .map(|r| decode(JOB_KEY, r).map_err(RepoError::from))
            .collect()
    }

    /// Jobs currently owned by `owner`. Stale index entries are skipped.
    pub async fn get_by_owner(&self, owner: Owner) -> Result<Vec<Job>, RepoError> {
        let ids = self.store.hkeys(&owner_key(owner)).await?;
        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(raw) = self.store.hget(JOB_KEY, &id).await? else {
                continue;
            };
            let job: Job = decode(JOB_KEY, &raw)?;
            // The index can lag a concurrent ownership move.
            if job.owner == owner {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn find_by_input_file(&self, dedup_key: &str) -> Result<Option<Job>, RepoError> {
        let Some(id) = self.store.hget(INPUT_FILE_INDEX, dedup_key).await? else {
            return Ok(None);
        };
        match self.get_by_id(&id).await {
            Ok(job) => Ok(Some(job)),
            Err(RepoError::NotFound { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

fn not_found(id: &str) -> RepoError {
    RepoError::NotFound {
        entity: "job",
        id: id.to_string(),
    }
}
