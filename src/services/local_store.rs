//! src/services/local_store.rs
//!
//! LocalStore: durable local persistence for captured chunks and in-flight
//! upload sessions, backed by SQLite. Every operation is atomic at row
//! granularity; nothing here spans rows in a transaction.

use crate::models::{
    chunk::{ChunkCounts, ChunkStatus, ChunkSummary, StoredChunk},
    session::UploadSession,
};
use chrono::Utc;
use sqlx::{
    QueryBuilder, SqlitePool,
    sqlite::{Sqlite, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use std::{io, path::Path, str::FromStr, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

const SUMMARY_COLUMNS: &str = "SELECT id, track_id, part_number, size_bytes, status FROM chunks";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("chunk `{0}` not found")]
    ChunkNotFound(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Shared handle to the local database.
///
/// Cloning is cheap; the capture path and the upload queue each hold a
/// clone of the same pool.
#[derive(Clone)]
pub struct LocalStore {
    pub db: Arc<SqlitePool>,
}

impl LocalStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Open (or create) the database behind `database_url` and apply the
    /// schema.
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let db_path = database_url
            .trim_start_matches("sqlite://")
            .trim_start_matches("sqlite:")
            .trim_start_matches("file:");
        let db_path = db_path.split('?').next().unwrap_or(db_path);
        debug!("Interpreted SQLite path => {}", db_path);

        if !db_path.starts_with(":memory:") {
            if let Some(parent) = Path::new(db_path).parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    fs::create_dir_all(parent).await?;
                    info!("Created missing directory {:?}", parent);
                }
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self::new(Arc::new(pool));
        store.migrate().await?;
        Ok(store)
    }

    /// Apply the embedded schema. Idempotent, safe on every startup.
    pub async fn migrate(&self) -> StoreResult<()> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        debug!("Running {} schema statements", statements.len());
        for stmt in statements {
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    /// Cheap connectivity probe.
    pub async fn ping(&self) -> StoreResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        Ok(())
    }

    /// Insert or overwrite a chunk row. An overwrite keeps the row's
    /// position in the queue order.
    pub async fn put_chunk(&self, chunk: &StoredChunk) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO chunks (
                id, track_id, part_number, payload, size_bytes, status, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                payload = excluded.payload,
                size_bytes = excluded.size_bytes,
                status = excluded.status,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&chunk.id)
        .bind(&chunk.track_id)
        .bind(chunk.part_number)
        .bind(&chunk.payload)
        .bind(chunk.size_bytes)
        .bind(chunk.status)
        .bind(chunk.created_at)
        .bind(chunk.updated_at)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    pub async fn get_chunk(&self, id: &str) -> StoreResult<Option<StoredChunk>> {
        let chunk = sqlx::query_as::<_, StoredChunk>(
            "SELECT id, track_id, part_number, payload, size_bytes, status, created_at, updated_at
             FROM chunks WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&*self.db)
        .await?;
        Ok(chunk)
    }

    /// Unconditionally set a chunk's status.
    pub async fn update_chunk_status(&self, id: &str, status: ChunkStatus) -> StoreResult<()> {
        let result = sqlx::query("UPDATE chunks SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(Utc::now())
            .bind(id)
            .execute(&*self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ChunkNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Compare-and-set `pending|failed -> uploading`.
    ///
    /// Returns `false` when the chunk is gone or someone else already moved
    /// it out of an eligible status.
    pub async fn claim_chunk(&self, id: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE chunks SET status = ?, updated_at = ?
             WHERE id = ? AND status IN (?, ?)",
        )
        .bind(ChunkStatus::Uploading)
        .bind(Utc::now())
        .bind(id)
        .bind(ChunkStatus::Pending)
        .bind(ChunkStatus::Failed)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// All `pending` or `failed` chunks, oldest first, optionally for one
    /// track only.
    pub async fn eligible_chunks(&self, track_id: Option<&str>) -> StoreResult<Vec<ChunkSummary>> {
        let mut builder = eligible_query(track_id);
        builder.push(" ORDER BY rowid ASC");
        let rows: Vec<ChunkSummary> = builder.build_query_as().fetch_all(&*self.db).await?;
        Ok(rows)
    }

    /// The oldest eligible chunk, if any.
    pub async fn next_eligible_chunk(
        &self,
        track_id: Option<&str>,
    ) -> StoreResult<Option<ChunkSummary>> {
        let mut builder = eligible_query(track_id);
        builder.push(" ORDER BY rowid ASC LIMIT 1");
        let row: Option<ChunkSummary> = builder.build_query_as().fetch_optional(&*self.db).await?;
        Ok(row)
    }

    /// Every chunk of a track, in part order.
    pub async fn list_chunks(&self, track_id: &str) -> StoreResult<Vec<ChunkSummary>> {
        let mut builder = QueryBuilder::<Sqlite>::new(SUMMARY_COLUMNS);
        builder.push(" WHERE track_id = ");
        builder.push_bind(track_id);
        builder.push(" ORDER BY part_number ASC");
        let rows: Vec<ChunkSummary> = builder.build_query_as().fetch_all(&*self.db).await?;
        Ok(rows)
    }

    /// Chunks of a track that have not reached `uploaded`.
    pub async fn unfinished_chunk_count(&self, track_id: &str) -> StoreResult<u64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM chunks WHERE track_id = ? AND status != ?",
        )
        .bind(track_id)
        .bind(ChunkStatus::Uploaded)
        .fetch_one(&*self.db)
        .await?;
        Ok(count.max(0) as u64)
    }

    /// Return chunks stranded in `uploading` by an unclean shutdown to
    /// `pending`. Only call this before any queue is running.
    pub async fn reset_stale_uploading(&self) -> StoreResult<u64> {
        let result = sqlx::query("UPDATE chunks SET status = ?, updated_at = ? WHERE status = ?")
            .bind(ChunkStatus::Pending)
            .bind(Utc::now())
            .bind(ChunkStatus::Uploading)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected())
    }

    /// Delete the `uploaded` rows of a track.
    pub async fn prune_uploaded(&self, track_id: &str) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM chunks WHERE track_id = ? AND status = ?")
            .bind(track_id)
            .bind(ChunkStatus::Uploaded)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn chunk_counts(&self) -> StoreResult<ChunkCounts> {
        let rows = sqlx::query_as::<_, (ChunkStatus, i64)>(
            "SELECT status, COUNT(*) FROM chunks GROUP BY status",
        )
        .fetch_all(&*self.db)
        .await?;

        let mut counts = ChunkCounts::default();
        for (status, count) in rows {
            counts.record(status, count.max(0) as u64);
        }
        Ok(counts)
    }

    /// Insert or replace the session row of a track.
    pub async fn put_session(&self, session: &UploadSession) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO upload_sessions (track_id, upload_id, object_key, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(track_id) DO UPDATE SET
                upload_id = excluded.upload_id,
                object_key = excluded.object_key,
                created_at = excluded.created_at
            "#,
        )
        .bind(&session.track_id)
        .bind(&session.upload_id)
        .bind(&session.object_key)
        .bind(session.created_at)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    pub async fn get_session(&self, track_id: &str) -> StoreResult<Option<UploadSession>> {
        let session = sqlx::query_as::<_, UploadSession>(
            "SELECT track_id, upload_id, object_key, created_at
             FROM upload_sessions WHERE track_id = ?",
        )
        .bind(track_id)
        .fetch_optional(&*self.db)
        .await?;
        Ok(session)
    }

    /// Returns whether a row was removed.
    pub async fn delete_session(&self, track_id: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM upload_sessions WHERE track_id = ?")
            .bind(track_id)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_sessions(&self) -> StoreResult<Vec<UploadSession>> {
        let sessions = sqlx::query_as::<_, UploadSession>(
            "SELECT track_id, upload_id, object_key, created_at
             FROM upload_sessions ORDER BY created_at ASC, track_id ASC",
        )
        .fetch_all(&*self.db)
        .await?;
        Ok(sessions)
    }
}

fn eligible_query<'a>(track_id: Option<&'a str>) -> QueryBuilder<'a, Sqlite> {
    let mut builder = QueryBuilder::<Sqlite>::new(SUMMARY_COLUMNS);
    builder.push(" WHERE status IN (");
    builder.push_bind(ChunkStatus::Pending);
    builder.push(", ");
    builder.push_bind(ChunkStatus::Failed);
    builder.push(")");
    if let Some(track_id) = track_id {
        builder.push(" AND track_id = ");
        builder.push_bind(track_id);
    }
    builder
}
