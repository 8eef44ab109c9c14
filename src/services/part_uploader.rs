//! Per-track multipart upload state machine.
//!
//! `uninitialized -> started -> completed`, or
//! `recovering -> started` when rebuilt from a persisted session.

use crate::models::{
    part::{CompletedPart, normalize_tag},
    session::UploadSession,
};
use crate::services::remote::{PartTransport, RemoteError, RemoteResult, UploadBroker};
use bytes::Bytes;
use serde::Serialize;
use std::{collections::HashMap, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum UploaderError {
    #[error("upload for track `{track_id}` could not be started: {source}")]
    Start {
        track_id: String,
        #[source]
        source: RemoteError,
    },
    #[error("upload for track `{0}` has not been started")]
    NotStarted(String),
    #[error("listing uploaded parts for track `{track_id}` failed: {source}")]
    Recovery {
        track_id: String,
        #[source]
        source: RemoteError,
    },
    #[error("part {part_number} of track `{track_id}` failed after {attempts} attempts: {source}")]
    PartExhausted {
        track_id: String,
        part_number: i32,
        attempts: u32,
        #[source]
        source: RemoteError,
    },
    #[error("completing upload for track `{track_id}` failed: {source}")]
    Complete {
        track_id: String,
        #[source]
        source: RemoteError,
    },
}

/// Bounded exponential backoff for part transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per part, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Wait after failed attempt `attempt` (1-based): `base_delay * 2^attempt`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.min(20))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploaderState {
    Uninitialized,
    Recovering,
    Started,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartOutcome {
    Uploaded,
    /// The part was already confirmed, nothing was sent.
    AlreadyPresent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteOutcome {
    Completed { parts: usize },
    NothingToComplete,
}

/// Drives one remote multipart upload for one track.
pub struct PartUploader {
    track_id: String,
    upload_id: Option<String>,
    object_key: Option<String>,
    parts: HashMap<i32, String>,
    state: UploaderState,
    broker: Arc<dyn UploadBroker>,
    transport: Arc<dyn PartTransport>,
    retry: RetryPolicy,
}

impl PartUploader {
    pub fn new(
        track_id: impl Into<String>,
        broker: Arc<dyn UploadBroker>,
        transport: Arc<dyn PartTransport>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            track_id: track_id.into(),
            upload_id: None,
            object_key: None,
            parts: HashMap::new(),
            state: UploaderState::Uninitialized,
            broker,
            transport,
            retry,
        }
    }

    /// Rehydrate from a persisted session. Call
    /// [`recover_existing_parts`](Self::recover_existing_parts) before
    /// uploading.
    pub fn resume(
        session: &UploadSession,
        broker: Arc<dyn UploadBroker>,
        transport: Arc<dyn PartTransport>,
        retry: RetryPolicy,
    ) -> Self {
        let mut uploader = Self::new(session.track_id.clone(), broker, transport, retry);
        uploader.upload_id = Some(session.upload_id.clone());
        uploader.object_key = Some(session.object_key.clone());
        uploader.state = UploaderState::Recovering;
        uploader
    }

    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    pub fn upload_id(&self) -> Option<&str> {
        self.upload_id.as_deref()
    }

    pub fn object_key(&self) -> Option<&str> {
        self.object_key.as_deref()
    }

    pub fn state(&self) -> UploaderState {
        self.state
    }

    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    pub fn has_part(&self, part_number: i32) -> bool {
        self.parts.contains_key(&part_number)
    }

    /// Session row describing this upload, once the broker assigned one.
    pub fn session(&self) -> Option<UploadSession> {
        match (&self.upload_id, &self.object_key) {
            (Some(upload_id), Some(object_key)) => Some(UploadSession::new(
                self.track_id.clone(),
                upload_id.clone(),
                object_key.clone(),
            )),
            _ => None,
        }
    }

    /// Ask the broker to begin a multipart upload.
    ///
    /// Nothing changes on failure, so the caller may retry. Calling it on an
    /// uploader that already has a session does nothing.
    pub async fn start(&mut self) -> Result<(), UploaderError> {
        if self.state != UploaderState::Uninitialized {
            return Ok(());
        }

        let began = self
            .broker
            .begin_upload(&self.track_id)
            .await
            .map_err(|source| UploaderError::Start {
                track_id: self.track_id.clone(),
                source,
            })?;

        info!(
            track_id = %self.track_id,
            upload_id = %began.upload_id,
            object_key = %began.object_key,
            "multipart upload started"
        );
        self.upload_id = Some(began.upload_id);
        self.object_key = Some(began.object_key);
        self.state = UploaderState::Started;
        Ok(())
    }

    /// Seed the confirmed-part map from the broker's listing. Idempotent;
    /// returns the number of parts known afterwards.
    pub async fn recover_existing_parts(&mut self) -> Result<usize, UploaderError> {
        let (Some(upload_id), Some(object_key)) = (&self.upload_id, &self.object_key) else {
            return Ok(0);
        };

        let listed = self
            .broker
            .list_uploaded_parts(object_key, upload_id)
            .await
            .map_err(|source| UploaderError::Recovery {
                track_id: self.track_id.clone(),
                source,
            })?;

        for part in listed {
            self.parts.insert(part.part_number, normalize_tag(&part.tag));
        }
        if self.state == UploaderState::Recovering {
            self.state = UploaderState::Started;
        }

        info!(
            track_id = %self.track_id,
            parts = self.parts.len(),
            "recovered uploaded parts"
        );
        Ok(self.parts.len())
    }

    /// Upload one part, retrying with exponential backoff.
    ///
    /// A part that is already confirmed is skipped without any remote call.
    pub async fn upload_chunk(
        &mut self,
        payload: Bytes,
        part_number: i32,
        max_retries: u32,
    ) -> Result<PartOutcome, UploaderError> {
        if self.state != UploaderState::Started {
            return Err(UploaderError::NotStarted(self.track_id.clone()));
        }
        if self.parts.contains_key(&part_number) {
            debug!(
                track_id = %self.track_id,
                part_number, "part already uploaded, skipping"
            );
            return Ok(PartOutcome::AlreadyPresent);
        }

        let attempts = max_retries.max(1);
        let mut attempt = 1;
        loop {
            match self.transmit(payload.clone(), part_number).await {
                Ok(tag) => {
                    debug!(track_id = %self.track_id, part_number, attempt, "part uploaded");
                    self.parts.insert(part_number, tag);
                    return Ok(PartOutcome::Uploaded);
                }
                Err(source) if attempt >= attempts => {
                    error!(
                        track_id = %self.track_id,
                        part_number,
                        attempts,
                        "part upload exhausted retries: {}",
                        source
                    );
                    return Err(UploaderError::PartExhausted {
                        track_id: self.track_id.clone(),
                        part_number,
                        attempts,
                        source,
                    });
                }
                Err(source) => {
                    let delay = self.retry.delay_after(attempt);
                    warn!(
                        track_id = %self.track_id,
                        part_number,
                        attempt,
                        "part upload attempt failed, retrying in {:?}: {}",
                        delay,
                        source
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Upload with the attempt count from this uploader's retry policy.
    pub async fn upload_part(
        &mut self,
        payload: Bytes,
        part_number: i32,
    ) -> Result<PartOutcome, UploaderError> {
        let attempts = self.retry.max_attempts;
        self.upload_chunk(payload, part_number, attempts).await
    }

    async fn transmit(&self, payload: Bytes, part_number: i32) -> RemoteResult<String> {
        let (Some(upload_id), Some(object_key)) = (&self.upload_id, &self.object_key) else {
            return Err(RemoteError::Rejected("no active upload session".into()));
        };

        let target = self
            .broker
            .get_part_upload_target(object_key, upload_id, part_number)
            .await?;
        let tag = self
            .transport
            .put_part(&target, payload)
            .await?
            .map(|raw| normalize_tag(&raw))
            .filter(|tag| !tag.is_empty())
            .ok_or(RemoteError::MissingTag(part_number))?;
        Ok(tag)
    }

    /// Finalize the upload with every confirmed part, sorted by part number.
    pub async fn complete(&mut self) -> Result<CompleteOutcome, UploaderError> {
        let (Some(upload_id), Some(object_key)) = (&self.upload_id, &self.object_key) else {
            return Ok(CompleteOutcome::NothingToComplete);
        };
        if self.parts.is_empty() {
            self.state = UploaderState::Completed;
            return Ok(CompleteOutcome::NothingToComplete);
        }

        let mut parts: Vec<CompletedPart> = self
            .parts
            .iter()
            .map(|(part_number, tag)| CompletedPart {
                part_number: *part_number,
                tag: tag.clone(),
            })
            .collect();
        parts.sort_by_key(|part| part.part_number);

        let status = self
            .broker
            .complete_upload(object_key, upload_id, &parts)
            .await
            .map_err(|source| UploaderError::Complete {
                track_id: self.track_id.clone(),
                source,
            })?;

        info!(
            track_id = %self.track_id,
            parts = parts.len(),
            status = %status,
            "multipart upload completed"
        );
        self.state = UploaderState::Completed;
        Ok(CompleteOutcome::Completed { parts: parts.len() })
    }
}

/// Builds uploaders that share one broker, transport and retry policy.
#[derive(Clone)]
pub struct UploaderFactory {
    broker: Arc<dyn UploadBroker>,
    transport: Arc<dyn PartTransport>,
    retry: RetryPolicy,
}

impl UploaderFactory {
    pub fn new(
        broker: Arc<dyn UploadBroker>,
        transport: Arc<dyn PartTransport>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            broker,
            transport,
            retry,
        }
    }

    pub fn retry(&self) -> RetryPolicy {
        self.retry
    }

    pub fn fresh(&self, track_id: &str) -> PartUploader {
        PartUploader::new(
            track_id,
            self.broker.clone(),
            self.transport.clone(),
            self.retry,
        )
    }

    /// Rebuild an uploader for an orphaned session and recover its parts.
    pub async fn recover(&self, session: &UploadSession) -> Result<PartUploader, UploaderError> {
        let mut uploader = PartUploader::resume(
            session,
            self.broker.clone(),
            self.transport.clone(),
            self.retry,
        );
        uploader.recover_existing_parts().await?;
        Ok(uploader)
    }
}
