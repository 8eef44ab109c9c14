//! Persisted state of an in-flight remote multipart upload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One active multipart upload, at most one per track.
///
/// The row exists from the moment the broker accepted `begin-upload` until
/// the upload is completed. A row that survives a restart is how orphaned
/// uploads are found again.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    /// Track that owns the upload (primary key).
    pub track_id: String,

    /// Identifier assigned by the storage service.
    pub upload_id: String,

    /// Final object location in the bucket.
    pub object_key: String,

    /// When the upload was begun.
    pub created_at: DateTime<Utc>,
}

impl UploadSession {
    pub fn new(
        track_id: impl Into<String>,
        upload_id: impl Into<String>,
        object_key: impl Into<String>,
    ) -> Self {
        Self {
            track_id: track_id.into(),
            upload_id: upload_id.into(),
            object_key: object_key.into(),
            created_at: Utc::now(),
        }
    }
}
