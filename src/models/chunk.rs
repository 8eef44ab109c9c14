//! A slice of captured media persisted locally until it is uploaded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

/// Upload status of a stored chunk.
///
/// Transitions: `pending -> uploading -> uploaded`, or
/// `uploading -> failed`, after which the queue may claim it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ChunkStatus {
    Pending,
    Uploading,
    Uploaded,
    Failed,
}

impl ChunkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Uploading => "uploading",
            Self::Uploaded => "uploaded",
            Self::Failed => "failed",
        }
    }

    /// Whether the queue may pick a chunk in this status.
    pub fn is_eligible(&self) -> bool {
        matches!(self, Self::Pending | Self::Failed)
    }
}

impl fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build the composite chunk key `{track_id}-{part_number}`.
pub fn chunk_id(track_id: &str, part_number: i32) -> String {
    format!("{}-{}", track_id, part_number)
}

/// One captured slice of a track.
#[derive(Clone, FromRow, Debug)]
pub struct StoredChunk {
    /// Composite key, see [`chunk_id`].
    pub id: String,

    /// Track that produced this slice.
    pub track_id: String,

    /// 1-based, strictly increasing per track, never reused.
    pub part_number: i32,

    /// Raw media bytes.
    pub payload: Vec<u8>,

    /// Payload length, kept so listings don't have to load the blob.
    pub size_bytes: i64,

    pub status: ChunkStatus,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl StoredChunk {
    /// A freshly captured slice, waiting for the queue.
    pub fn pending(track_id: &str, part_number: i32, payload: Vec<u8>) -> Self {
        let now = Utc::now();
        Self {
            id: chunk_id(track_id, part_number),
            track_id: track_id.to_string(),
            part_number,
            size_bytes: payload.len() as i64,
            payload,
            status: ChunkStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Chunk row without its payload, used when scanning for work.
#[derive(Clone, FromRow, Debug, Serialize)]
pub struct ChunkSummary {
    pub id: String,
    pub track_id: String,
    pub part_number: i32,
    pub size_bytes: i64,
    pub status: ChunkStatus,
}

/// Number of chunks per status.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ChunkCounts {
    pub pending: u64,
    pub uploading: u64,
    pub uploaded: u64,
    pub failed: u64,
}

impl ChunkCounts {
    pub fn record(&mut self, status: ChunkStatus, count: u64) {
        match status {
            ChunkStatus::Pending => self.pending += count,
            ChunkStatus::Uploading => self.uploading += count,
            ChunkStatus::Uploaded => self.uploaded += count,
            ChunkStatus::Failed => self.failed += count,
        }
    }
}
