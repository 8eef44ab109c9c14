//! Remote side of the upload protocol.
//!
//! The broker brokers the four multipart operations; part bytes themselves
//! go straight to storage through a [`PartTransport`] using the target the
//! broker handed out.

use crate::models::part::{BeganUpload, CompletedPart, UploadTarget};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, RequestBuilder, header};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("`{operation}` request failed: {source}")]
    Http {
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("`{operation}` returned status {status}")]
    Status { operation: &'static str, status: u16 },
    #[error("storage response for part {0} carried no confirmation tag")]
    MissingTag(i32),
    #[error("{0}")]
    Rejected(String),
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// The backend that brokers multipart uploads.
#[async_trait]
pub trait UploadBroker: Send + Sync {
    async fn begin_upload(&self, track_id: &str) -> RemoteResult<BeganUpload>;

    async fn list_uploaded_parts(
        &self,
        object_key: &str,
        upload_id: &str,
    ) -> RemoteResult<Vec<CompletedPart>>;

    async fn get_part_upload_target(
        &self,
        object_key: &str,
        upload_id: &str,
        part_number: i32,
    ) -> RemoteResult<UploadTarget>;

    /// `parts` must be sorted ascending by part number.
    async fn complete_upload(
        &self,
        object_key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> RemoteResult<String>;
}

/// Direct-to-storage transfer of one part.
#[async_trait]
pub trait PartTransport: Send + Sync {
    /// Returns the raw confirmation tag the storage response carried, if any.
    async fn put_part(&self, target: &UploadTarget, payload: Bytes) -> RemoteResult<Option<String>>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartRequest<'a> {
    track_sid: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ListPartsRequest<'a> {
    key: &'a str,
    upload_id: &'a str,
}

#[derive(Deserialize)]
struct ListPartsResponse {
    #[serde(default)]
    parts: Vec<ListedPart>,
}

/// S3 may list parts with missing fields; those are skipped.
#[derive(Deserialize)]
struct ListedPart {
    #[serde(rename = "PartNumber")]
    part_number: Option<i32>,
    #[serde(rename = "ETag")]
    tag: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TargetRequest<'a> {
    key: &'a str,
    upload_id: &'a str,
    part_number: i32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CompleteRequest<'a> {
    key: &'a str,
    upload_id: &'a str,
    parts: &'a [CompletedPart],
}

#[derive(Deserialize)]
struct CompleteResponse {
    status: String,
}

/// JSON-over-HTTP broker client.
#[derive(Clone)]
pub struct HttpUploadBroker {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpUploadBroker {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> RemoteResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|source| RemoteError::Http {
                operation: "client",
                source,
            })?;
        Ok(Self::with_client(client, base_url, token))
    }

    pub fn with_client(client: Client, base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    fn post(&self, path: &str) -> RequestBuilder {
        let request = self.client.post(format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn call<B, R>(&self, operation: &'static str, path: &str, body: &B) -> RemoteResult<R>
    where
        B: Serialize + Sync,
        R: DeserializeOwned + Send,
    {
        debug!(operation, path, "calling upload broker");
        let response = self
            .post(path)
            .json(body)
            .send()
            .await
            .map_err(|source| RemoteError::Http { operation, source })?;

        let status = response.status();
        if !status.is_success() {
            return Err(RemoteError::Status {
                operation,
                status: status.as_u16(),
            });
        }

        response
            .json::<R>()
            .await
            .map_err(|source| RemoteError::Http { operation, source })
    }
}

#[async_trait]
impl UploadBroker for HttpUploadBroker {
    async fn begin_upload(&self, track_id: &str) -> RemoteResult<BeganUpload> {
        self.call(
            "begin-upload",
            "/uploads/start",
            &StartRequest {
                track_sid: track_id,
            },
        )
        .await
    }

    async fn list_uploaded_parts(
        &self,
        object_key: &str,
        upload_id: &str,
    ) -> RemoteResult<Vec<CompletedPart>> {
        let response: ListPartsResponse = self
            .call(
                "list-uploaded-parts",
                "/uploads/list-parts",
                &ListPartsRequest {
                    key: object_key,
                    upload_id,
                },
            )
            .await?;

        Ok(response
            .parts
            .into_iter()
            .filter_map(|part| match (part.part_number, part.tag) {
                (Some(part_number), Some(tag)) => Some(CompletedPart { part_number, tag }),
                _ => None,
            })
            .collect())
    }

    async fn get_part_upload_target(
        &self,
        object_key: &str,
        upload_id: &str,
        part_number: i32,
    ) -> RemoteResult<UploadTarget> {
        self.call(
            "get-part-upload-target",
            "/uploads/get-presigned-url",
            &TargetRequest {
                key: object_key,
                upload_id,
                part_number,
            },
        )
        .await
    }

    async fn complete_upload(
        &self,
        object_key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> RemoteResult<String> {
        let response: CompleteResponse = self
            .call(
                "complete-upload",
                "/uploads/complete",
                &CompleteRequest {
                    key: object_key,
                    upload_id,
                    parts,
                },
            )
            .await?;
        Ok(response.status)
    }
}

/// Plain `PUT` of the part bytes to a presigned URL.
#[derive(Clone, Default)]
pub struct HttpPartTransport {
    client: Client,
}

impl HttpPartTransport {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PartTransport for HttpPartTransport {
    async fn put_part(&self, target: &UploadTarget, payload: Bytes) -> RemoteResult<Option<String>> {
        let operation = "put-part";
        let response = self
            .client
            .put(&target.url)
            .body(payload)
            .send()
            .await
            .map_err(|source| RemoteError::Http { operation, source })?;

        let status = response.status();
        if !status.is_success() {
            return Err(RemoteError::Status {
                operation,
                status: status.as_u16(),
            });
        }

        Ok(response
            .headers()
            .get(header::ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string))
    }
}
