//! Wire types exchanged with the upload broker.

use serde::{Deserialize, Serialize};

/// Response of `begin-upload`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BeganUpload {
    #[serde(rename = "uploadId")]
    pub upload_id: String,

    #[serde(rename = "key")]
    pub object_key: String,
}

/// A part the storage service has confirmed.
///
/// Field names follow the S3 `Part` shape used by both `list-parts` and
/// `complete`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CompletedPart {
    #[serde(rename = "PartNumber")]
    pub part_number: i32,

    #[serde(rename = "ETag")]
    pub tag: String,
}

/// Short-lived authorization to PUT one part directly to storage.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct UploadTarget {
    pub url: String,
}

/// Strip the quote characters storage services wrap around ETags.
pub fn normalize_tag(raw: &str) -> String {
    raw.trim_matches('"').to_string()
}
