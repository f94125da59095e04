
use super::models::*;
use anyhow::{Context, Result};
use sqlx::{Executor, Sqlite, SqlitePool};
use tracing::debug;

pub struct MetaQueries;

impl MetaQueries {
    #[inline]
    pub async fn get_all(pool: &SqlitePool) -> Result<Vec<(String, String)>> {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT key, value FROM index_meta")
            .fetch_all(pool)
            .await
            .context("Failed to read index metadata")?;
        Ok(rows)
    }

    #[inline]
    pub async fn get(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM index_meta WHERE key = ?")
                .bind(key)
                .fetch_optional(pool)
                .await
                .with_context(|| format!("Failed to read index metadata key {key}"))?;
        Ok(value)
    }

    #[inline]
    pub async fn set<'e, E>(executor: E, key: &str, value: &str) -> Result<()>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query(
            "INSERT INTO index_meta (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(executor)
        .await
        .with_context(|| format!("Failed to write index metadata key {key}"))?;
        Ok(())
    }
}

pub struct EntryQueries;

impl EntryQueries {
    #[inline]
    pub async fn upsert<'e, E>(executor: E, entry: &StoredEntry) -> Result<()>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query(
            "INSERT INTO index_entries
                (id, sender, subject, timestamp, labels, normalized_text, content_hash, vector, indexed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                sender = excluded.sender,
                subject = excluded.subject,
                timestamp = excluded.timestamp,
                labels = excluded.labels,
                normalized_text = excluded.normalized_text,
                content_hash = excluded.content_hash,
                vector = excluded.vector,
                indexed_at = excluded.indexed_at",
        )
        .bind(&entry.id)
        .bind(&entry.sender)
        .bind(&entry.subject)
        .bind(entry.timestamp)
        .bind(&entry.labels)
        .bind(&entry.normalized_text)
        .bind(&entry.content_hash)
        .bind(&entry.vector)
        .bind(entry.indexed_at)
        .execute(executor)
        .await
        .with_context(|| format!("Failed to upsert index entry {}", entry.id))?;
        Ok(())
    }

    #[inline]
    pub async fn get_by_id(pool: &SqlitePool, id: &str) -> Result<Option<StoredEntry>> {
        let entry = sqlx::query_as::<_, StoredEntry>(
            "SELECT id, sender, subject, timestamp, labels, normalized_text, content_hash, vector, indexed_at
             FROM index_entries WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("Failed to get index entry by id")?;
        Ok(entry)
    }

    #[inline]
    pub async fn list_all(pool: &SqlitePool) -> Result<Vec<StoredEntry>> {
        let entries = sqlx::query_as::<_, StoredEntry>(
            "SELECT id, sender, subject, timestamp, labels, normalized_text, content_hash, vector, indexed_at
             FROM index_entries ORDER BY id",
        )
        .fetch_all(pool)
        .await
        .context("Failed to list index entries")?;

        debug!("Loaded {} index entries", entries.len());
        Ok(entries)
    }

    #[inline]
    pub async fn count(pool: &SqlitePool) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM index_entries")
            .fetch_one(pool)
            .await
            .context("Failed to count index entries")?;
        Ok(count)
    }
}
