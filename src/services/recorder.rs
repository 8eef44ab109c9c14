//! Recording orchestrator.
//!
//! Owns the recording session lifecycle: recovers orphaned uploads at
//! startup, runs the upload queue worker, listens to the track source and
//! drives one capture pipeline per published track. Slices go to the local
//! store first and are uploaded by the queue; stopping a track drains its
//! chunks and finalizes the upload.

use crate::models::{chunk::ChunkCounts, chunk::StoredChunk, session::UploadSession};
use crate::services::{
    local_store::{LocalStore, StoreError},
    part_uploader::{UploaderError, UploaderFactory},
    tracks::{
        CaptureError, CaptureFacility, CaptureHandle, ChunkSink, LocalTrack, TrackEvent,
        TrackSource,
    },
    upload_queue::{DrainReport, QueueWorker, UploadQueue, UploaderOrigin, UploaderRegistry},
};
use bytes::Bytes;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    str::FromStr,
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::{
    sync::{Mutex as AsyncMutex, broadcast::error::RecvError, mpsc},
    task::JoinHandle,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("unknown control command `{0}`")]
    UnknownCommand(String),
    #[error("cannot {command} while {state}")]
    InvalidState {
        command: &'static str,
        state: RecordingState,
    },
    #[error("track `{track_id}` still has {unfinished} chunks for its previous upload")]
    UploadPending { track_id: String, unfinished: u64 },
    #[error(transparent)]
    Uploader(#[from] UploaderError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingState {
    Idle,
    Recording,
    Paused,
    Stopped,
}

impl RecordingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordingState::Idle => "idle",
            RecordingState::Recording => "recording",
            RecordingState::Paused => "paused",
            RecordingState::Stopped => "stopped",
        }
    }

    fn is_active(&self) -> bool {
        matches!(self, RecordingState::Recording | RecordingState::Paused)
    }
}

impl fmt::Display for RecordingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Control messages accepted from the application side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    StartRecording,
    StopRecording,
    PauseRecording,
    ResumeRecording,
}

impl FromStr for ControlCommand {
    type Err = RecorderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start-recording" => Ok(ControlCommand::StartRecording),
            "stop-recording" => Ok(ControlCommand::StopRecording),
            "pause-recording" => Ok(ControlCommand::PauseRecording),
            "resume-recording" => Ok(ControlCommand::ResumeRecording),
            other => Err(RecorderError::UnknownCommand(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub slice_interval: Duration,
    pub queue_interval: Duration,
    /// Upper bound for each phase of stopping a track.
    pub drain_timeout: Duration,
    pub prune_uploaded: bool,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            slice_interval: Duration::from_secs(4),
            queue_interval: Duration::from_secs(2),
            drain_timeout: Duration::from_secs(120),
            prune_uploaded: false,
        }
    }
}

/// Outcome of stopping one track recorder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackReport {
    pub track_id: String,
    pub drain: DrainReport,
    pub finalized: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploaderStatus {
    pub track_id: String,
    pub origin: UploaderOrigin,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecorderStatus {
    pub state: RecordingState,
    pub recording_id: Option<Uuid>,
    pub active_tracks: Vec<LocalTrack>,
    pub uploaders: Vec<UploaderStatus>,
    pub queue_running: bool,
    pub chunks: ChunkCounts,
    pub sessions: Vec<UploadSession>,
}

struct Session {
    state: RecordingState,
    recording_id: Option<Uuid>,
}

struct TrackRecorder {
    track: LocalTrack,
    capture: Arc<dyn CaptureHandle>,
    ingestion: JoinHandle<()>,
}

struct Inner {
    store: LocalStore,
    factory: UploaderFactory,
    uploaders: UploaderRegistry,
    queue: Arc<UploadQueue>,
    source: Arc<dyn TrackSource>,
    capture: Arc<dyn CaptureFacility>,
    config: RecorderConfig,
    session: RwLock<Session>,
    tracks: Mutex<HashMap<String, TrackRecorder>>,
    worker: AsyncMutex<Option<QueueWorker>>,
    listener: Mutex<Option<CancellationToken>>,
    // Serializes start, stop, pause, track events and cleanup.
    lifecycle: AsyncMutex<()>,
}

#[derive(Clone)]
pub struct RecordingOrchestrator {
    inner: Arc<Inner>,
}

impl RecordingOrchestrator {
    /// Build the orchestrator, recover orphaned upload sessions and only
    /// then start the queue worker.
    pub async fn open(
        store: LocalStore,
        factory: UploaderFactory,
        source: Arc<dyn TrackSource>,
        capture: Arc<dyn CaptureFacility>,
        config: RecorderConfig,
    ) -> Self {
        let uploaders = UploaderRegistry::default();
        let queue = Arc::new(
            UploadQueue::new(store.clone(), uploaders.clone(), factory.clone())
                .with_pruning(config.prune_uploaded),
        );
        let orchestrator = Self {
            inner: Arc::new(Inner {
                store,
                factory,
                uploaders,
                queue,
                source,
                capture,
                config,
                session: RwLock::new(Session {
                    state: RecordingState::Idle,
                    recording_id: None,
                }),
                tracks: Mutex::new(HashMap::new()),
                worker: AsyncMutex::new(None),
                listener: Mutex::new(None),
                lifecycle: AsyncMutex::new(()),
            }),
        };

        orchestrator.recover_orphans().await;
        orchestrator.ensure_worker().await;
        orchestrator
    }

    pub fn state(&self) -> RecordingState {
        self.inner.session.read().state
    }

    pub fn recording_id(&self) -> Option<Uuid> {
        self.inner.session.read().recording_id
    }

    pub fn queue(&self) -> &Arc<UploadQueue> {
        &self.inner.queue
    }

    pub fn store(&self) -> &LocalStore {
        &self.inner.store
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.inner.config
    }

    pub fn is_capturing(&self, track_id: &str) -> bool {
        self.inner.tracks.lock().contains_key(track_id)
    }

    pub async fn queue_running(&self) -> bool {
        self.inner
            .worker
            .lock()
            .await
            .as_ref()
            .is_some_and(QueueWorker::is_running)
    }

    /// Register an uploader for every persisted session that has none.
    /// Sessions that cannot be recovered are skipped. Returns how many were
    /// recovered.
    pub async fn recover_orphans(&self) -> usize {
        let store = &self.inner.store;
        match store.reset_stale_uploading().await {
            Ok(0) => {}
            Ok(reset) => info!(reset, "returned interrupted uploads to pending"),
            Err(err) => warn!("could not reset interrupted uploads: {}", err),
        }

        let sessions = match store.list_sessions().await {
            Ok(sessions) => sessions,
            Err(err) => {
                error!("could not list upload sessions: {}", err);
                return 0;
            }
        };

        let mut recovered = 0;
        for session in sessions {
            if self.inner.uploaders.contains(&session.track_id) {
                continue;
            }
            match self.inner.factory.recover(&session).await {
                Ok(uploader) => {
                    info!(
                        track_id = %session.track_id,
                        upload_id = %session.upload_id,
                        parts = uploader.part_count(),
                        "recovered upload session"
                    );
                    self.inner.uploaders.insert(
                        &session.track_id,
                        uploader,
                        UploaderOrigin::Recovered,
                    );
                    recovered += 1;
                }
                Err(err) => {
                    warn!(track_id = %session.track_id, "skipping unrecoverable session: {}", err)
                }
            }
        }
        recovered
    }

    pub async fn apply(&self, command: ControlCommand) -> Result<(), RecorderError> {
        match command {
            ControlCommand::StartRecording => self.start_recording().await,
            ControlCommand::StopRecording => {
                self.stop_recording().await;
                Ok(())
            }
            ControlCommand::PauseRecording => self.pause_recording().await,
            ControlCommand::ResumeRecording => self.resume_recording().await,
        }
    }

    pub async fn start_recording(&self) -> Result<(), RecorderError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let recording_id = {
            let mut session = self.inner.session.write();
            if session.state.is_active() {
                debug!("recording already active");
                return Ok(());
            }
            let recording_id = Uuid::new_v4();
            session.state = RecordingState::Recording;
            session.recording_id = Some(recording_id);
            recording_id
        };
        info!(%recording_id, "recording started");

        self.ensure_worker().await;
        self.subscribe();
        for track in self.inner.source.published_tracks() {
            let track_id = track.sid.clone();
            if let Err(err) = self.launch_track(track).await {
                error!(track_id = %track_id, "could not start track recorder: {}", err);
            }
        }
        Ok(())
    }

    /// Stop every track recorder. No-op unless recording or paused.
    pub async fn stop_recording(&self) -> Vec<TrackReport> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.stop_recording_locked().await
    }

    pub async fn pause_recording(&self) -> Result<(), RecorderError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        {
            let mut session = self.inner.session.write();
            match session.state {
                RecordingState::Paused => return Ok(()),
                RecordingState::Recording => session.state = RecordingState::Paused,
                state => {
                    return Err(RecorderError::InvalidState {
                        command: "pause",
                        state,
                    });
                }
            }
        }
        for capture in self.capture_handles() {
            capture.pause().await;
        }
        info!(recording_id = ?self.recording_id(), "recording paused");
        Ok(())
    }

    pub async fn resume_recording(&self) -> Result<(), RecorderError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        {
            let mut session = self.inner.session.write();
            match session.state {
                RecordingState::Recording => return Ok(()),
                RecordingState::Paused => session.state = RecordingState::Recording,
                state => {
                    return Err(RecorderError::InvalidState {
                        command: "resume",
                        state,
                    });
                }
            }
        }
        for capture in self.capture_handles() {
            capture.resume().await;
        }
        info!(recording_id = ?self.recording_id(), "recording resumed");
        Ok(())
    }

    /// Start capturing one track while a recording is active. A second
    /// start for the same track is ignored.
    pub async fn start_track_recorder(&self, track: LocalTrack) -> Result<(), RecorderError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let state = self.state();
        if !state.is_active() {
            return Err(RecorderError::InvalidState {
                command: "start a track",
                state,
            });
        }
        self.launch_track(track).await
    }

    /// Stop one track, drain its chunks and finalize its upload. `None` if
    /// the track was not being recorded.
    pub async fn stop_track_recorder(&self, track_id: &str) -> Option<TrackReport> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.stop_track(track_id).await
    }

    /// Tear everything down and return to `idle`. Safe to call repeatedly.
    pub async fn cleanup(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.stop_recording_locked().await;
        self.stop_worker().await;
        self.unsubscribe();

        let leftovers: Vec<TrackRecorder> = self
            .inner
            .tracks
            .lock()
            .drain()
            .map(|(_, recorder)| recorder)
            .collect();
        for recorder in leftovers {
            recorder.capture.stop().await;
            recorder.ingestion.abort();
        }

        self.inner.uploaders.clear();
        {
            let mut session = self.inner.session.write();
            session.state = RecordingState::Idle;
            session.recording_id = None;
        }
        info!("recorder cleaned up");
    }

    /// Upload everything eligible for every known track and finalize
    /// recovered sessions.
    pub async fn drain_all(&self) -> DrainReport {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let mut tracks: BTreeSet<String> = self.inner.uploaders.tracks().into_iter().collect();
        match self.inner.store.eligible_chunks(None).await {
            Ok(chunks) => tracks.extend(chunks.into_iter().map(|chunk| chunk.track_id)),
            Err(err) => warn!("could not scan pending chunks: {}", err),
        }

        let mut total = DrainReport::default();
        for track_id in &tracks {
            total.absorb(&self.inner.queue.drain_track(track_id).await);
        }
        let finalized = self.inner.queue.finalize_recovered().await;
        info!(
            uploaded = total.uploaded,
            failed = total.failed,
            orphaned = total.orphaned,
            finalized,
            "drain finished"
        );
        total
    }

    pub async fn status(&self) -> Result<RecorderStatus, RecorderError> {
        let (state, recording_id) = {
            let session = self.inner.session.read();
            (session.state, session.recording_id)
        };
        let mut active_tracks: Vec<LocalTrack> = self
            .inner
            .tracks
            .lock()
            .values()
            .map(|recorder| recorder.track.clone())
            .collect();
        active_tracks.sort_by(|a, b| a.sid.cmp(&b.sid));

        let uploaders = self
            .inner
            .uploaders
            .tracks()
            .into_iter()
            .filter_map(|track_id| {
                let origin = self.inner.uploaders.origin(&track_id)?;
                Some(UploaderStatus { track_id, origin })
            })
            .collect();

        Ok(RecorderStatus {
            state,
            recording_id,
            active_tracks,
            uploaders,
            queue_running: self.queue_running().await,
            chunks: self.inner.store.chunk_counts().await?,
            sessions: self.inner.store.list_sessions().await?,
        })
    }

    async fn stop_recording_locked(&self) -> Vec<TrackReport> {
        let recording_id = {
            let mut session = self.inner.session.write();
            if !session.state.is_active() {
                return Vec::new();
            }
            session.state = RecordingState::Stopped;
            session.recording_id
        };

        self.stop_worker().await;
        self.unsubscribe();

        let track_ids: Vec<String> = self.inner.tracks.lock().keys().cloned().collect();
        let reports: Vec<TrackReport> = join_all(track_ids.iter().map(|id| self.stop_track(id)))
            .await
            .into_iter()
            .flatten()
            .collect();

        info!(recording_id = ?recording_id, tracks = reports.len(), "recording stopped");
        reports
    }

    async fn launch_track(&self, track: LocalTrack) -> Result<(), RecorderError> {
        if self.is_capturing(&track.sid) {
            debug!(track_id = %track.sid, "track already recording");
            return Ok(());
        }
        let inner = &self.inner;
        let track_id = track.sid.clone();

        self.settle_previous_upload(&track_id).await?;

        // Continue numbering after rows left by earlier sessions of the track.
        let first_part = match inner.store.list_chunks(&track_id).await {
            Ok(chunks) => chunks.iter().map(|chunk| chunk.part_number).max().unwrap_or(0) + 1,
            Err(err) => {
                warn!(track_id = %track_id, "could not read previous chunks: {}", err);
                1
            }
        };

        let mut uploader = inner.factory.fresh(&track_id);
        uploader.start().await?;
        let session = uploader
            .session()
            .ok_or_else(|| UploaderError::NotStarted(track_id.clone()))?;
        inner.store.put_session(&session).await?;
        inner
            .uploaders
            .replace(&track_id, uploader, UploaderOrigin::Live);

        let (tx, rx) = mpsc::unbounded_channel();
        let ingestion = tokio::spawn(ingest(inner.store.clone(), track_id.clone(), first_part, rx));
        let capture = match inner
            .capture
            .start(&track, inner.config.slice_interval, ChunkSink::new(&track_id, tx))
            .await
        {
            Ok(capture) => Arc::<dyn CaptureHandle>::from(capture),
            Err(err) => {
                inner.uploaders.remove(&track_id);
                if let Err(store_err) = inner.store.delete_session(&track_id).await {
                    warn!(track_id = %track_id, "could not roll back upload session: {}", store_err);
                }
                ingestion.abort();
                return Err(err.into());
            }
        };

        if self.state() == RecordingState::Paused {
            capture.pause().await;
        }

        info!(
            track_id = %track_id,
            upload_id = %session.upload_id,
            kind = ?track.kind,
            first_part,
            "track recorder started"
        );
        inner.tracks.lock().insert(
            track_id,
            TrackRecorder {
                track,
                capture,
                ingestion,
            },
        );
        Ok(())
    }

    /// Finish the upload an earlier session of `track_id` left behind.
    /// Chunks that are not uploaded yet belong to that upload, so a new one
    /// cannot start until they are.
    async fn settle_previous_upload(&self, track_id: &str) -> Result<(), RecorderError> {
        let inner = &self.inner;
        if !inner.uploaders.contains(track_id) {
            if let Some(session) = inner.store.get_session(track_id).await? {
                let uploader = inner.factory.recover(&session).await?;
                inner
                    .uploaders
                    .insert(track_id, uploader, UploaderOrigin::Recovered);
            }
        }
        if inner.uploaders.origin(track_id) != Some(UploaderOrigin::Recovered) {
            return Ok(());
        }

        info!(track_id, "finishing recovered upload before a new one");
        if timeout(inner.config.drain_timeout, inner.queue.drain_track(track_id))
            .await
            .is_err()
        {
            warn!(track_id, "drain timed out");
        }
        let unfinished = inner.store.unfinished_chunk_count(track_id).await?;
        if unfinished > 0 {
            warn!(track_id, unfinished, "previous upload still has chunks to send");
            return Err(RecorderError::UploadPending {
                track_id: track_id.to_string(),
                unfinished,
            });
        }
        inner.queue.finalize_track(track_id).await?;
        Ok(())
    }

    async fn stop_track(&self, track_id: &str) -> Option<TrackReport> {
        let recorder = self.inner.tracks.lock().remove(track_id)?;
        let inner = &self.inner;
        let limit = inner.config.drain_timeout;
        info!(track_id, "stopping track recorder");

        recorder.capture.stop().await;
        let mut ingestion = recorder.ingestion;
        if timeout(limit, &mut ingestion).await.is_err() {
            warn!(track_id, "ingestion did not flush in time, abandoning buffered slices");
            ingestion.abort();
        }

        let drain = match timeout(limit, inner.queue.drain_track(track_id)).await {
            Ok(report) => report,
            Err(_) => {
                warn!(track_id, "drain timed out");
                DrainReport::default()
            }
        };

        let unfinished = match inner.store.unfinished_chunk_count(track_id).await {
            Ok(count) => count,
            Err(err) => {
                warn!(track_id, "could not count unfinished chunks: {}", err);
                1
            }
        };
        if unfinished > 0 {
            warn!(track_id, unfinished, "chunks still pending, leaving upload to the queue");
            inner.uploaders.mark_recovered(track_id);
            return Some(TrackReport {
                track_id: track_id.to_string(),
                drain,
                finalized: false,
            });
        }

        let finalized = matches!(inner.queue.finalize_track(track_id).await, Ok(Some(_)));
        info!(track_id, uploaded = drain.uploaded, finalized, "track recorder stopped");
        Some(TrackReport {
            track_id: track_id.to_string(),
            drain,
            finalized,
        })
    }

    async fn handle_event(&self, event: TrackEvent) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        match event {
            TrackEvent::Published(track) => {
                if !self.state().is_active() {
                    return;
                }
                let track_id = track.sid.clone();
                if let Err(err) = self.launch_track(track).await {
                    error!(track_id = %track_id, "could not start late track: {}", err);
                }
            }
            TrackEvent::Unpublished(track_id) => {
                self.stop_track(&track_id).await;
            }
            TrackEvent::Disconnected => {
                if self.state().is_active() {
                    info!("track source disconnected");
                    self.stop_recording_locked().await;
                }
            }
        }
    }

    fn subscribe(&self) {
        let mut listener = self.inner.listener.lock();
        if listener.is_some() {
            return;
        }
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let mut events = self.inner.source.subscribe();
        let this = self.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => this.handle_event(event).await,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "track events dropped");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            debug!("track listener stopped");
        });
        *listener = Some(token);
    }

    fn unsubscribe(&self) {
        if let Some(token) = self.inner.listener.lock().take() {
            token.cancel();
        }
    }

    async fn ensure_worker(&self) {
        let mut worker = self.inner.worker.lock().await;
        if worker.as_ref().is_some_and(QueueWorker::is_running) {
            return;
        }
        *worker = Some(self.inner.queue.spawn(self.inner.config.queue_interval));
    }

    async fn stop_worker(&self) {
        let worker = self.inner.worker.lock().await.take();
        if let Some(worker) = worker {
            worker.shutdown().await;
        }
    }

    fn capture_handles(&self) -> Vec<Arc<dyn CaptureHandle>> {
        self.inner
            .tracks
            .lock()
            .values()
            .map(|recorder| recorder.capture.clone())
            .collect()
    }
}

/// Write each delivered slice as the next pending chunk of the track.
async fn ingest(
    store: LocalStore,
    track_id: String,
    first_part: i32,
    mut slices: mpsc::UnboundedReceiver<Bytes>,
) {
    let mut next_part = first_part;
    while let Some(slice) = slices.recv().await {
        if slice.is_empty() {
            debug!(track_id = %track_id, "discarding empty slice");
            continue;
        }
        let part_number = next_part;
        next_part += 1;

        let size = slice.len();
        let chunk = StoredChunk::pending(&track_id, part_number, slice.to_vec());
        match store.put_chunk(&chunk).await {
            Ok(()) => debug!(track_id = %track_id, part_number, size, "stored chunk"),
            Err(err) => error!(track_id = %track_id, part_number, "could not store chunk: {}", err),
        }
    }
}
