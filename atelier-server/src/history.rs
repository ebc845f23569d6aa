//! SQLite-backed generation history.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};

/// One persisted generation. Immutable after insert, except for deletion.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct HistoryRecord {
    pub id: i64,
    pub filename: String,
    pub prompt: String,
    pub negative_prompt: String,
    pub steps: i64,
    pub cfg: f64,
    pub seed: i64,
    pub width: i64,
    pub height: i64,
    pub lora_enabled: bool,
    pub lora_scale: f64,
    pub device: String,
    pub duration: f64,
    pub created_at: String,
}

/// Insert payload; id and timestamp are generated by the store.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub filename: String,
    pub prompt: String,
    pub negative_prompt: String,
    pub steps: i64,
    pub cfg: f64,
    pub seed: i64,
    pub width: i64,
    pub height: i64,
    pub lora_enabled: bool,
    pub lora_scale: f64,
    pub device: String,
    pub duration: f64,
}

const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    filename TEXT NOT NULL,
    prompt TEXT NOT NULL,
    negative_prompt TEXT NOT NULL DEFAULT '',
    steps INTEGER NOT NULL,
    cfg REAL NOT NULL,
    seed INTEGER NOT NULL,
    width INTEGER NOT NULL,
    height INTEGER NOT NULL,
    lora_enabled INTEGER NOT NULL,
    lora_scale REAL NOT NULL,
    device TEXT NOT NULL,
    duration REAL NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
)";

#[derive(Clone)]
pub struct HistoryStore {
    pool: SqlitePool,
}

impl HistoryStore {
    pub async fn connect(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open history database {}", path.display()))?;
        Self::init(pool).await
    }

    /// A private in-memory database, used by tests.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("failed to open in-memory database")?;
        Self::init(pool).await
    }

    async fn init(pool: SqlitePool) -> Result<Self> {
        sqlx::query(SCHEMA)
            .execute(&pool)
            .await
            .context("failed to create history schema")?;
        Ok(Self { pool })
    }

    pub async fn add(&self, record: &NewRecord) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO history (filename, prompt, negative_prompt, steps, cfg, seed, width, \
             height, lora_enabled, lora_scale, device, duration) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.filename)
        .bind(&record.prompt)
        .bind(&record.negative_prompt)
        .bind(record.steps)
        .bind(record.cfg)
        .bind(record.seed)
        .bind(record.width)
        .bind(record.height)
        .bind(record.lora_enabled)
        .bind(record.lora_scale)
        .bind(&record.device)
        .bind(record.duration)
        .execute(&self.pool)
        .await
        .context("failed to insert history record")?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get(&self, id: i64) -> Result<Option<HistoryRecord>> {
        sqlx::query_as::<_, HistoryRecord>("SELECT * FROM history WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch history record")
    }

    /// Newest first.
    pub async fn list(&self, limit: i64, offset: i64) -> Result<Vec<HistoryRecord>> {
        sqlx::query_as::<_, HistoryRecord>(
            "SELECT * FROM history ORDER BY id DESC LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .context("failed to list history")
    }

    /// Returns false when the id does not exist.
    pub async fn delete(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM history WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("failed to delete history record")?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(seed: i64) -> NewRecord {
        NewRecord {
            filename: format!("{seed:08x}.png"),
            prompt: "a lighthouse at dusk".into(),
            negative_prompt: String::new(),
            steps: 9,
            cfg: 0.0,
            seed,
            width: 1024,
            height: 1024,
            lora_enabled: true,
            lora_scale: 1.3,
            device: "cpu".into(),
            duration: 3.21,
        }
    }

    #[tokio::test]
    async fn add_then_get_roundtrip() {
        let store = HistoryStore::in_memory().await.unwrap();
        let id = store.add(&sample(42)).await.unwrap();

        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.seed, 42);
        assert_eq!(record.prompt, "a lighthouse at dusk");
        assert!(record.lora_enabled);
        assert!(!record.created_at.is_empty());
    }

    #[tokio::test]
    async fn list_is_newest_first_and_paginated() {
        let store = HistoryStore::in_memory().await.unwrap();
        for seed in 1..=5 {
            store.add(&sample(seed)).await.unwrap();
        }

        let page = store.list(2, 0).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].seed, 5);
        assert_eq!(page[1].seed, 4);

        let next = store.list(2, 2).await.unwrap();
        assert_eq!(next[0].seed, 3);
        assert_eq!(next[1].seed, 2);

        let rest = store.list(10, 4).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].seed, 1);
    }

    #[tokio::test]
    async fn delete_reports_missing_ids() {
        let store = HistoryStore::in_memory().await.unwrap();
        let id = store.add(&sample(7)).await.unwrap();

        assert!(store.delete(id).await.unwrap());
        assert!(!store.delete(id).await.unwrap());
        assert!(!store.delete(9999).await.unwrap());
        assert!(store.get(id).await.unwrap().is_none());
    }
}
