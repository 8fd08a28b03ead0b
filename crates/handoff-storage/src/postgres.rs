//! Postgres-backed store for multi-process deployments.
//!
//! Every key carries a row in `kv_versions` that is bumped on each write.
//! `exec` locks the watched version rows and compares them against the
//! snapshot before applying anything, so a concurrent commit on a watched
//! key aborts the transaction.

use anyhow::Context;
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Row};

use crate::{Command, KvStore, Reply, StoreError, Transaction, Watch};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("running store migrations")
    }

    async fn apply(
        conn: &mut sqlx::Transaction<'_, Postgres>,
        command: Command,
    ) -> Result<Reply, StoreError> {
        let touched = match &command {
            Command::Set { key, .. }
            | Command::Del { key }
            | Command::HSet { key, .. }
            | Command::HDel { key, .. } => key.clone(),
        };
        sqlx::query(
            r#"
            INSERT INTO kv_versions (key, version) VALUES ($1, 1)
            ON CONFLICT (key) DO UPDATE SET version = kv_versions.version + 1
            "#,
        )
        .bind(&touched)
        .execute(&mut **conn)
        .await?;

        let reply = match command {
            Command::Set { key, value } => {
                sqlx::query(
                    r#"
                    INSERT INTO kv_strings (key, value) VALUES ($1, $2)
                    ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value
                    "#,
                )
                .bind(&key)
                .bind(&value)
                .execute(&mut **conn)
                .await?;
                Reply::Ok
            }
            Command::Del { key } => {
                let strings = sqlx::query("DELETE FROM kv_strings WHERE key = $1")
                    .bind(&key)
                    .execute(&mut **conn)
                    .await?
                    .rows_affected();
                let hashes = sqlx::query("DELETE FROM kv_hashes WHERE key = $1")
                    .bind(&key)
                    .execute(&mut **conn)
                    .await?
                    .rows_affected();
                Reply::Count((strings > 0) as u64 + (hashes > 0) as u64)
            }
            Command::HSet { key, field, value } => {
                let row = sqlx::query(
                    r#"
                    INSERT INTO kv_hashes (key, field, value) VALUES ($1, $2, $3)
                    ON CONFLICT (key, field) DO UPDATE SET value = EXCLUDED.value
                    RETURNING (xmax = 0) AS inserted
                    "#,
                )
                .bind(&key)
                .bind(&field)
                .bind(&value)
                .fetch_one(&mut **conn)
                .await?;
                let inserted: bool = row.try_get("inserted")?;
                Reply::Count(inserted as u64)
            }
            Command::HDel { key, field } => {
                let removed = sqlx::query("DELETE FROM kv_hashes WHERE key = $1 AND field = $2")
                    .bind(&key)
                    .bind(&field)
                    .execute(&mut **conn)
                    .await?
                    .rows_affected();
                Reply::Count(removed)
            }
        };
        Ok(reply)
    }
}

#[async_trait]
impl KvStore for PgStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT value FROM kv_strings WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.try_get::<String, _>("value")).transpose()?)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT value FROM kv_hashes WHERE key = $1 AND field = $2")
            .bind(key)
            .bind(field)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.try_get::<String, _>("value")).transpose()?)
    }

    async fn hexists(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT EXISTS (SELECT 1 FROM kv_hashes WHERE key = $1 AND field = $2) AS present",
        )
        .bind(key)
        .bind(field)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("present")?)
    }

    async fn hkeys(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT field FROM kv_hashes WHERE key = $1 ORDER BY seq")
            .bind(key)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("field").map_err(StoreError::from))
            .collect()
    }

    async fn hvals(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT value FROM kv_hashes WHERE key = $1 ORDER BY seq")
            .bind(key)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("value").map_err(StoreError::from))
            .collect()
    }

    async fn watch(&self, keys: &[String]) -> Result<Watch, StoreError> {
        let rows = sqlx::query("SELECT key, version FROM kv_versions WHERE key = ANY($1)")
            .bind(keys)
            .fetch_all(&self.pool)
            .await?;
        let mut versions = Vec::with_capacity(keys.len());
        for key in keys {
            let mut version = 0i64;
            for row in &rows {
                let k: String = row.try_get("key")?;
                if &k == key {
                    version = row.try_get("version")?;
                }
            }
            versions.push((key.clone(), version));
        }
        Ok(Watch { versions })
    }

    async fn exec(&self, watch: Option<Watch>, tx: Transaction) -> Result<Vec<Reply>, StoreError> {
        let mut conn = self.pool.begin().await?;

        if let Some(watch) = watch {
            for (key, expected) in &watch.versions {
                // Materialize the row so concurrent watchers of a new key serialize on it.
                sqlx::query(
                    "INSERT INTO kv_versions (key, version) VALUES ($1, 0) ON CONFLICT (key) DO NOTHING",
                )
                .bind(key)
                .execute(&mut *conn)
                .await?;
                let row = sqlx::query("SELECT version FROM kv_versions WHERE key = $1 FOR UPDATE")
                    .bind(key)
                    .fetch_one(&mut *conn)
                    .await?;
                let current: i64 = row.try_get("version")?;
                if current != *expected {
                    conn.rollback().await?;
                    return Err(StoreError::Conflict);
                }
            }
        }

        let mut replies = Vec::with_capacity(tx.commands().len());
        for command in tx.into_commands() {
            replies.push(Self::apply(&mut conn, command).await?);
        }
        conn.commit().await?;
        Ok(replies)
    }
}
