use std::sync::Arc;

use handoff_core::{Task, ValidationError};
use tracing::debug;
use uuid::Uuid;

use crate::jobs::{decode, encode, expect_counts, RepoError};
use crate::{lock_key, new_lock_token, KvStore, StoreError, Transaction};

pub const TASK_KEY: &str = "task";

#[derive(Clone)]
pub struct TaskRepository {
    store: Arc<dyn KvStore>,
}

impl TaskRepository {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub async fn create(&self, mut task: Task) -> Result<Task, RepoError> {
        if !task.id.is_empty() {
            return Err(RepoError::AlreadyHasId);
        }
        task.validate_new()?;
        task.id = Uuid::new_v4().to_string();
        task.touch();

        let mut tx = Transaction::new();
        tx.set(lock_key(TASK_KEY, &task.id), new_lock_token())
            .hset(TASK_KEY, task.id.clone(), encode(TASK_KEY, &task)?);
        let replies = self.store.exec(None, tx).await?;
        expect_counts(&replies, &[1, 1])?;
        debug!(task_id = %task.id, pipeline_id = %task.pipeline_id, "task created");
        Ok(task)
    }

    /// Last-write-wins merge of the non-empty fields of `incoming` into the stored task.
    pub async fn update(&self, incoming: &Task) -> Result<Task, RepoError> {
        if incoming.id.is_empty() {
            return Err(ValidationError::EmptyField("Id").into());
        }
        let lock = lock_key(TASK_KEY, &incoming.id);
        let watch = self.store.watch(std::slice::from_ref(&lock)).await?;
        let mut task = self.get_by_id(&incoming.id).await?;
        task.replace_with(incoming);

        let mut tx = Transaction::new();
        tx.hset(TASK_KEY, task.id.clone(), encode(TASK_KEY, &task)?)
            .set(lock, new_lock_token());
        match self.store.exec(Some(watch), tx).await {
            Ok(_) => Ok(task),
            Err(StoreError::Conflict) => Err(RepoError::Conflict {
                entity: "task",
                id: task.id,
            }),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn delete(&self, id: &str) -> Result<(), RepoError> {
        let mut tx = Transaction::new();
        tx.hdel(TASK_KEY, id).del(lock_key(TASK_KEY, id));
        let replies = self.store.exec(None, tx).await?;
        if replies.first().map_or(0, |r| r.count()) == 0 {
            return Err(not_found(id));
        }
        Ok(())
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Task, RepoError> {
        match self.store.hget(TASK_KEY, id).await? {
            Some(raw) => Ok(decode(TASK_KEY, &raw)?),
            None => Err(not_found(id)),
        }
    }

    /// Tasks in store iteration order, which is the order matching is attempted in.
    pub async fn get_all(&self) -> Result<Vec<Task>, RepoError> {
        let raw = self.store.hvals(TASK_KEY).await?;
        raw.iter()
            .map(|r| decode(TASK_KEY, r).map_err(RepoError::from))
            .collect()
    }
}

fn not_found(id: &str) -> RepoError {
    RepoError::NotFound {
        entity: "task",
        id: id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::MemoryStore;

    fn repo() -> TaskRepository {
        TaskRepository::new(Arc::new(MemoryStore::new()))
    }

    fn mk_task(description: &str) -> Task {
        Task {
            description: description.into(),
            job_selector: r#"{"==":[{"var":"InputFile.Extension"},"tiff"]}"#.into(),
            pipeline_id: "pipelines/segment".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_assigns_id_and_rejects_incomplete_tasks() {
        let repo = repo();
        let task = repo.create(mk_task("segment")).await.unwrap();
        assert!(!task.id.is_empty());
        assert_eq!(repo.get_by_id(&task.id).await.unwrap(), task);

        let mut missing = mk_task("x");
        missing.pipeline_id.clear();
        assert!(matches!(
            repo.create(missing).await,
            Err(RepoError::Invalid(ValidationError::EmptyField("PipelineId")))
        ));
        assert!(matches!(
            repo.create(task.clone()).await,
            Err(RepoError::AlreadyHasId)
        ));
    }

    #[tokio::test]
    async fn get_all_keeps_creation_order() {
        let repo = repo();
        let mut ids = Vec::new();
        for name in ["c", "a", "b"] {
            ids.push(repo.create(mk_task(name)).await.unwrap().id);
        }
        let listed: Vec<_> = repo.get_all().await.unwrap().into_iter().map(|t| t.id).collect();
        assert_eq!(listed, ids);
    }

    #[tokio::test]
    async fn update_merges_non_empty_fields() {
        let repo = repo();
        let mut created = mk_task("segment");
        created.model_parameters = BTreeMap::from([("threshold".to_string(), "0.5".to_string())]);
        let created = repo.create(created).await.unwrap();

        let incoming = Task {
            id: created.id.clone(),
            result_file_folder: "/out/seg".into(),
            model_parameters: BTreeMap::from([("mode".to_string(), "fast".to_string())]),
            ..Default::default()
        };
        let updated = repo.update(&incoming).await.unwrap();
        assert_eq!(updated.description, "segment");
        assert_eq!(updated.result_file_folder, "/out/seg");
        assert_eq!(updated.model_parameters.len(), 2);
        assert_eq!(repo.get_by_id(&created.id).await.unwrap(), updated);
    }

    #[tokio::test]
    async fn update_and_delete_of_missing_task_are_not_found() {
        let repo = repo();
        let ghost = Task {
            id: "ghost".into(),
            ..Default::default()
        };
        assert!(matches!(repo.update(&ghost).await, Err(RepoError::NotFound { .. })));
        assert!(matches!(repo.delete("ghost").await, Err(RepoError::NotFound { .. })));

        let task = repo.create(mk_task("segment")).await.unwrap();
        repo.delete(&task.id).await.unwrap();
        assert!(repo.get_all().await.unwrap().is_empty());
    }
}
