use std::collections::HashMap;

use async_trait::async_trait;
use indexmap::IndexMap;
use tokio::sync::RwLock;

use crate::{Command, KvStore, Reply, StoreError, Transaction, Watch};

#[derive(Debug, Default)]
struct State {
    strings: HashMap<String, String>,
    hashes: HashMap<String, IndexMap<String, String>>,
    versions: HashMap<String, i64>,
    clock: i64,
}

impl State {
    fn version(&self, key: &str) -> i64 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    fn bump(&mut self, key: &str) {
        self.clock += 1;
        self.versions.insert(key.to_string(), self.clock);
    }

    fn apply(&mut self, command: Command) -> Reply {
        match command {
            Command::Set { key, value } => {
                self.bump(&key);
                self.strings.insert(key, value);
                Reply::Ok
            }
            Command::Del { key } => {
                self.bump(&key);
                let removed =
                    self.strings.remove(&key).is_some() as u64 + self.hashes.remove(&key).is_some() as u64;
                Reply::Count(removed)
            }
            Command::HSet { key, field, value } => {
                self.bump(&key);
                let added = self.hashes.entry(key).or_default().insert(field, value).is_none();
                Reply::Count(added as u64)
            }
            Command::HDel { key, field } => {
                self.bump(&key);
                let Some(hash) = self.hashes.get_mut(&key) else {
                    return Reply::Count(0);
                };
                let removed = hash.shift_remove(&field).is_some();
                if hash.is_empty() {
                    self.hashes.remove(&key);
                }
                Reply::Count(removed as u64)
            }
        }
    }
}

/// In-process store. Hash iteration follows insertion order.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.state.read().await.strings.get(key).cloned())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let state = self.state.read().await;
        Ok(state.hashes.get(key).and_then(|h| h.get(field)).cloned())
    }

    async fn hexists(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        let state = self.state.read().await;
        Ok(state.hashes.get(key).is_some_and(|h| h.contains_key(field)))
    }

    async fn hkeys(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .hashes
            .get(key)
            .map(|h| h.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn hvals(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .hashes
            .get(key)
            .map(|h| h.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn watch(&self, keys: &[String]) -> Result<Watch, StoreError> {
        let state = self.state.read().await;
        Ok(Watch {
            versions: keys.iter().map(|k| (k.clone(), state.version(k))).collect(),
        })
    }

    async fn exec(&self, watch: Option<Watch>, tx: Transaction) -> Result<Vec<Reply>, StoreError> {
        let mut state = self.state.write().await;
        if let Some(watch) = watch {
            if watch.versions.iter().any(|(k, v)| state.version(k) != *v) {
                return Err(StoreError::Conflict);
            }
        }
        Ok(tx
            .into_commands()
            .into_iter()
            .map(|c| state.apply(c))
            .collect())
    }
}
