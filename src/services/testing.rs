//! Scripted in-memory stand-in for the broker and storage, shared by the
//! service unit tests.

use crate::models::part::{BeganUpload, CompletedPart, UploadTarget};
use crate::services::{
    part_uploader::{RetryPolicy, UploaderFactory},
    remote::{PartTransport, RemoteError, RemoteResult, UploadBroker},
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct FakeUpload {
    object_key: String,
    parts: BTreeMap<i32, String>,
}

#[derive(Default)]
struct FakeState {
    uploads: HashMap<String, FakeUpload>,
    next_upload: u32,
    fail_begins: u32,
    fail_lists: u32,
    fail_puts: u32,
    fail_completes: u32,
    omit_tag: bool,
    begin_calls: u32,
    list_calls: u32,
    target_calls: u32,
    put_calls: u32,
    completions: Vec<(String, Vec<CompletedPart>)>,
}

#[derive(Default)]
pub struct FakeRemote {
    state: Mutex<FakeState>,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next_begins(&self, count: u32) {
        self.state.lock().fail_begins = count;
    }

    pub fn fail_next_lists(&self, count: u32) {
        self.state.lock().fail_lists = count;
    }

    pub fn fail_next_puts(&self, count: u32) {
        self.state.lock().fail_puts = count;
    }

    pub fn fail_next_completes(&self, count: u32) {
        self.state.lock().fail_completes = count;
    }

    pub fn omit_tags(&self, omit: bool) {
        self.state.lock().omit_tag = omit;
    }

    /// Register an upload as if a previous process had begun it and
    /// uploaded `parts`.
    pub fn seed_upload(&self, upload_id: &str, object_key: &str, parts: &[i32]) {
        let mut state = self.state.lock();
        let upload = state.uploads.entry(upload_id.to_string()).or_default();
        upload.object_key = object_key.to_string();
        for part in parts {
            upload.parts.insert(*part, tag_for(upload_id, *part));
        }
    }

    pub fn put_calls(&self) -> u32 {
        self.state.lock().put_calls
    }

    pub fn begin_calls(&self) -> u32 {
        self.state.lock().begin_calls
    }

    pub fn list_calls(&self) -> u32 {
        self.state.lock().list_calls
    }

    pub fn target_calls(&self) -> u32 {
        self.state.lock().target_calls
    }

    pub fn completions(&self) -> Vec<(String, Vec<CompletedPart>)> {
        self.state.lock().completions.clone()
    }

    pub fn stored_parts(&self, upload_id: &str) -> Vec<i32> {
        self.state
            .lock()
            .uploads
            .get(upload_id)
            .map(|upload| upload.parts.keys().copied().collect())
            .unwrap_or_default()
    }
}

/// Unquoted tag the fake storage assigns to a part.
pub fn tag_for(upload_id: &str, part_number: i32) -> String {
    format!("etag-{}-{}", upload_id, part_number)
}

fn take_failure(counter: &mut u32) -> bool {
    if *counter > 0 {
        *counter -= 1;
        true
    } else {
        false
    }
}

#[async_trait]
impl UploadBroker for FakeRemote {
    async fn begin_upload(&self, track_id: &str) -> RemoteResult<BeganUpload> {
        let mut state = self.state.lock();
        state.begin_calls += 1;
        if take_failure(&mut state.fail_begins) {
            return Err(RemoteError::Rejected("simulated begin failure".into()));
        }
        state.next_upload += 1;
        let upload_id = format!("upload-{}", state.next_upload);
        let object_key = format!("recordings/track_{}.webm", track_id);
        state.uploads.insert(
            upload_id.clone(),
            FakeUpload {
                object_key: object_key.clone(),
                parts: BTreeMap::new(),
            },
        );
        Ok(BeganUpload {
            upload_id,
            object_key,
        })
    }

    async fn list_uploaded_parts(
        &self,
        _object_key: &str,
        upload_id: &str,
    ) -> RemoteResult<Vec<CompletedPart>> {
        let mut state = self.state.lock();
        state.list_calls += 1;
        if take_failure(&mut state.fail_lists) {
            return Err(RemoteError::Rejected("simulated list failure".into()));
        }
        let upload = state
            .uploads
            .get(upload_id)
            .ok_or_else(|| RemoteError::Rejected(format!("unknown upload {}", upload_id)))?;
        Ok(upload
            .parts
            .iter()
            .map(|(part_number, tag)| CompletedPart {
                part_number: *part_number,
                tag: format!("\"{}\"", tag),
            })
            .collect())
    }

    async fn get_part_upload_target(
        &self,
        _object_key: &str,
        upload_id: &str,
        part_number: i32,
    ) -> RemoteResult<UploadTarget> {
        let mut state = self.state.lock();
        state.target_calls += 1;
        Ok(UploadTarget {
            url: format!("fake://{}/{}", upload_id, part_number),
        })
    }

    async fn complete_upload(
        &self,
        _object_key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> RemoteResult<String> {
        let mut state = self.state.lock();
        if take_failure(&mut state.fail_completes) {
            return Err(RemoteError::Rejected("simulated complete failure".into()));
        }
        state
            .completions
            .push((upload_id.to_string(), parts.to_vec()));
        Ok("success".into())
    }
}

#[async_trait]
impl PartTransport for FakeRemote {
    async fn put_part(&self, target: &UploadTarget, _payload: Bytes) -> RemoteResult<Option<String>> {
        let mut state = self.state.lock();
        state.put_calls += 1;
        if take_failure(&mut state.fail_puts) {
            return Err(RemoteError::Rejected("simulated network failure".into()));
        }

        let rest = target.url.trim_start_matches("fake://");
        let (upload_id, part) = rest
            .split_once('/')
            .ok_or_else(|| RemoteError::Rejected(format!("bad target {}", target.url)))?;
        let part_number: i32 = part
            .parse()
            .map_err(|_| RemoteError::Rejected(format!("bad part in {}", target.url)))?;

        let tag = tag_for(upload_id, part_number);
        if let Some(upload) = state.uploads.get_mut(upload_id) {
            upload.parts.insert(part_number, tag.clone());
        }
        if state.omit_tag {
            return Ok(None);
        }
        Ok(Some(format!("\"{}\"", tag)))
    }
}

/// Factory wired to `remote` with a retry delay short enough for real-time
/// tests.
pub fn fake_factory(remote: &Arc<FakeRemote>) -> UploaderFactory {
    UploaderFactory::new(
        remote.clone(),
        remote.clone(),
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        },
    )
}
