use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::database::sqlite::models::{StoredEntry, StoredIndexMeta};
use crate::database::sqlite::queries::{EntryQueries, MetaQueries};


pub mod models;
pub mod queries;

pub type DbPool = Pool<Sqlite>;

/// How long a statement waits on a locked database before failing
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    #[inline]
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_with(options)
            .await
            .context("Failed to create database connection pool")?;

        let database = Self { pool };
        database.run_migrations().await?;

        Ok(database)
    }

    #[inline]
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    #[inline]
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("src/database/sqlite/migrations")
            .run(&self.pool)
            .await
            .context("Failed to run schema migration")?;

        debug!("Database migrations completed successfully");
        Ok(())
    }

    #[inline]
    pub async fn initialize_in_dir(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create index directory: {}", dir.display()))?;

        Self::new(dir.join("index.db")).await
    }

    #[inline]
    pub async fn read_meta(&self) -> Result<Option<StoredIndexMeta>> {
        let pairs = MetaQueries::get_all(&self.pool).await?;
        Ok(StoredIndexMeta::from_pairs(pairs))
    }

    #[inline]
    pub async fn write_meta(&self, meta: &StoredIndexMeta) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin metadata transaction")?;
        for (key, value) in meta.to_pairs() {
            MetaQueries::set(&mut *tx, key, &value).await?;
        }
        tx.commit()
            .await
            .context("Failed to commit index metadata")?;
        Ok(())
    }

    #[inline]
    pub async fn load_entries(&self) -> Result<Vec<StoredEntry>> {
        EntryQueries::list_all(&self.pool).await
    }

    #[inline]
    pub async fn get_entry(&self, id: &str) -> Result<Option<StoredEntry>> {
        EntryQueries::get_by_id(&self.pool, id).await
    }

    /// Write all entries in a single transaction; either all land or none do.
    #[inline]
    pub async fn save_entries(&self, entries: &[StoredEntry]) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin entry transaction")?;
        for entry in entries {
            EntryQueries::upsert(&mut *tx, entry).await?;
        }
        tx.commit().await.context("Failed to commit index entries")?;

        debug!("Flushed {} index entries", entries.len());
        Ok(entries.len())
    }

    #[inline]
    pub async fn entry_count(&self) -> Result<i64> {
        EntryQueries::count(&self.pool).await
    }

    /// Checkpoint and close every pooled connection.
    #[inline]
    pub async fn close(&self) {
        if let Err(e) = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await
        {
            debug!("WAL checkpoint before close failed: {}", e);
        }
        self.pool.close().await;
    }
}
