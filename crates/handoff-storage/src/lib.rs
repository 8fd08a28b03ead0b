//! Key-value store abstraction, job/task repositories and local file storage.
//!
//! The store contract mirrors watch/multi-exec: a caller snapshots the
//! versions of some keys with [`KvStore::watch`], then submits a
//! [`Transaction`] that commits only if none of those keys were written in
//! between. All commands of one transaction become visible together.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub mod jobs;
pub mod memory;
pub mod postgres;
pub mod tasks;

pub use jobs::{CreateStatus, JobRepository, RepoError};
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use tasks::TaskRepository;

pub const CRATE_NAME: &str = "handoff-storage";

/// Key separator used in every composite key.
pub const SEPARATOR: &str = ":";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("watched key changed before commit")]
    Conflict,
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt record under {key}: {message}")]
    Corrupt { key: String, message: String },
    #[error("unexpected store reply: {0}")]
    Protocol(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Set { key: String, value: String },
    Del { key: String },
    HSet { key: String, field: String, value: String },
    HDel { key: String, field: String },
}

/// Per-command reply. `Count` is the number of entries added or removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Count(u64),
}

impl Reply {
    pub fn count(&self) -> u64 {
        match self {
            Reply::Ok => 1,
            Reply::Count(n) => *n,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transaction {
    commands: Vec<Command>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.commands.push(Command::Set {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn del(&mut self, key: impl Into<String>) -> &mut Self {
        self.commands.push(Command::Del { key: key.into() });
        self
    }

    pub fn hset(
        &mut self,
        key: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<String>,
    ) -> &mut Self {
        self.commands.push(Command::HSet {
            key: key.into(),
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn hdel(&mut self, key: impl Into<String>, field: impl Into<String>) -> &mut Self {
        self.commands.push(Command::HDel {
            key: key.into(),
            field: field.into(),
        });
        self
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn into_commands(self) -> Vec<Command> {
        self.commands
    }
}

/// Version snapshot of watched keys. Absent keys are recorded as version 0.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Watch {
    pub versions: Vec<(String, i64)>,
}

#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;
    async fn hexists(&self, key: &str, field: &str) -> Result<bool, StoreError>;
    /// Fields in insertion order.
    async fn hkeys(&self, key: &str) -> Result<Vec<String>, StoreError>;
    /// Values in insertion order.
    async fn hvals(&self, key: &str) -> Result<Vec<String>, StoreError>;
    async fn watch(&self, keys: &[String]) -> Result<Watch, StoreError>;
    /// Applies every command atomically. Fails with [`StoreError::Conflict`]
    /// when any watched key was written after the snapshot.
    async fn exec(&self, watch: Option<Watch>, tx: Transaction) -> Result<Vec<Reply>, StoreError>;
}

pub fn lock_key(entity: &str, id: &str) -> String {
    format!("lock{SEPARATOR}{entity}{SEPARATOR}{id}")
}

/// Fresh token written to a lock key on every commit.
pub fn new_lock_token() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone)]
pub struct StoredFile {
    pub path: PathBuf,
    pub content_hash: String,
    pub byte_size: usize,
}

/// Local file writes used by the transmission stages.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Writes `bytes` to `root/relative_dir/name` through a temp file and rename,
    /// replacing any previous file of the same name.
    pub async fn write_atomic(
        &self,
        relative_dir: &Path,
        name: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredFile> {
        let dir = self.root.join(relative_dir);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating directory {}", dir.display()))?;

        let path = dir.join(name);
        let temp_path = dir.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }

        Ok(StoredFile {
            path,
            content_hash: Self::sha256_hex(bytes),
            byte_size: bytes.len(),
        })
    }
}
