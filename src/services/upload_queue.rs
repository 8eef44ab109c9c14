//! Background upload queue.
//!
//! Chunks are picked from the local store one at a time, claimed with a
//! compare-and-set on their status and pushed through the uploader that owns
//! their track. Ticks never overlap: a periodic tick that finds the queue
//! busy is skipped.

use crate::models::chunk::{ChunkStatus, ChunkSummary};
use crate::services::{
    local_store::LocalStore,
    part_uploader::{CompleteOutcome, PartUploader, UploaderError, UploaderFactory},
};
use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::Mutex,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub type SharedUploader = Arc<Mutex<PartUploader>>;

/// How an uploader came to be registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploaderOrigin {
    /// Owned by a running track recorder.
    Live,
    /// Rebuilt from a persisted session; finalized by the queue once its
    /// chunks are all uploaded.
    Recovered,
}

#[derive(Clone)]
struct Registered {
    uploader: SharedUploader,
    origin: UploaderOrigin,
}

/// In-memory map of track id to its active uploader.
#[derive(Clone, Default)]
pub struct UploaderRegistry {
    inner: Arc<RwLock<HashMap<String, Registered>>>,
}

impl UploaderRegistry {
    /// Register `uploader` unless the track already has one; returns the
    /// uploader that ends up registered.
    pub fn insert(
        &self,
        track_id: &str,
        uploader: PartUploader,
        origin: UploaderOrigin,
    ) -> SharedUploader {
        let mut map = self.inner.write();
        map.entry(track_id.to_string())
            .or_insert_with(|| Registered {
                uploader: Arc::new(Mutex::new(uploader)),
                origin,
            })
            .uploader
            .clone()
    }

    /// Register `uploader`, dropping whatever the track had before.
    pub fn replace(
        &self,
        track_id: &str,
        uploader: PartUploader,
        origin: UploaderOrigin,
    ) -> SharedUploader {
        let uploader = Arc::new(Mutex::new(uploader));
        self.inner.write().insert(
            track_id.to_string(),
            Registered {
                uploader: uploader.clone(),
                origin,
            },
        );
        uploader
    }

    /// Hand a live uploader over to the queue for finalization.
    pub fn mark_recovered(&self, track_id: &str) -> bool {
        match self.inner.write().get_mut(track_id) {
            Some(entry) => {
                entry.origin = UploaderOrigin::Recovered;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, track_id: &str) -> Option<SharedUploader> {
        self.inner
            .read()
            .get(track_id)
            .map(|entry| entry.uploader.clone())
    }

    pub fn origin(&self, track_id: &str) -> Option<UploaderOrigin> {
        self.inner.read().get(track_id).map(|entry| entry.origin)
    }

    pub fn remove(&self, track_id: &str) -> Option<SharedUploader> {
        self.inner
            .write()
            .remove(track_id)
            .map(|entry| entry.uploader)
    }

    pub fn contains(&self, track_id: &str) -> bool {
        self.inner.read().contains_key(track_id)
    }

    pub fn tracks(&self) -> Vec<String> {
        let mut tracks: Vec<String> = self.inner.read().keys().cloned().collect();
        tracks.sort();
        tracks
    }

    pub fn recovered_tracks(&self) -> Vec<String> {
        let mut tracks: Vec<String> = self
            .inner
            .read()
            .iter()
            .filter(|(_, entry)| entry.origin == UploaderOrigin::Recovered)
            .map(|(track, _)| track.clone())
            .collect();
        tracks.sort();
        tracks
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn clear(&self) {
        self.inner.write().clear();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing uploadable.
    Idle,
    /// Another tick or a drain step holds the queue.
    Busy,
    Uploaded(String),
    Failed(String),
    /// The chunk was claimed by someone else or vanished.
    Skipped(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub uploaded: usize,
    pub failed: usize,
    /// Chunks left behind because no uploader could be found for them.
    pub orphaned: usize,
}

impl DrainReport {
    pub fn absorb(&mut self, other: &DrainReport) {
        self.uploaded += other.uploaded;
        self.failed += other.failed;
        self.orphaned += other.orphaned;
    }
}

pub struct UploadQueue {
    store: LocalStore,
    uploaders: UploaderRegistry,
    factory: UploaderFactory,
    lock: Mutex<()>,
    prune_uploaded: bool,
}

impl UploadQueue {
    pub fn new(store: LocalStore, uploaders: UploaderRegistry, factory: UploaderFactory) -> Self {
        Self {
            store,
            uploaders,
            factory,
            lock: Mutex::new(()),
            prune_uploaded: false,
        }
    }

    /// Delete `uploaded` rows once their track is finalized.
    pub fn with_pruning(mut self, prune_uploaded: bool) -> Self {
        self.prune_uploaded = prune_uploaded;
        self
    }

    pub fn uploaders(&self) -> &UploaderRegistry {
        &self.uploaders
    }

    /// One periodic tick; skipped when the queue is busy.
    pub async fn tick(&self) -> TickOutcome {
        let Ok(_guard) = self.lock.try_lock() else {
            debug!("upload queue busy, skipping tick");
            return TickOutcome::Busy;
        };
        self.step(None).await
    }

    /// Process one chunk, waiting for any running tick first.
    pub async fn process_next(&self, track_id: Option<&str>) -> TickOutcome {
        let _guard = self.lock.lock().await;
        self.step(track_id).await
    }

    /// Push every eligible chunk of `track_id` through its uploader,
    /// attempting each chunk at most once.
    pub async fn drain_track(&self, track_id: &str) -> DrainReport {
        let mut attempted = HashSet::new();
        let mut report = DrainReport::default();

        loop {
            let _guard = self.lock.lock().await;
            let candidates = match self.store.eligible_chunks(Some(track_id)).await {
                Ok(candidates) => candidates,
                Err(err) => {
                    warn!(track_id, "could not scan chunks for drain: {}", err);
                    break;
                }
            };
            let remaining: Vec<ChunkSummary> = candidates
                .into_iter()
                .filter(|chunk| !attempted.contains(&chunk.id))
                .collect();
            let Some(chunk) = remaining.first() else {
                break;
            };

            let Some(uploader) = self.resolve_uploader(track_id).await else {
                report.orphaned = remaining.len();
                warn!(
                    track_id,
                    orphaned = remaining.len(),
                    "no uploader for track, leaving chunks pending"
                );
                break;
            };

            attempted.insert(chunk.id.clone());
            match self.upload_one(chunk, &uploader).await {
                TickOutcome::Uploaded(_) => report.uploaded += 1,
                TickOutcome::Failed(_) => report.failed += 1,
                _ => {}
            }
        }

        debug!(track_id, ?report, "drain finished");
        report
    }

    async fn step(&self, scope: Option<&str>) -> TickOutcome {
        let candidates = match self.store.eligible_chunks(scope).await {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!("could not scan for pending chunks: {}", err);
                return TickOutcome::Idle;
            }
        };

        let mut orphaned: HashSet<String> = HashSet::new();
        for chunk in candidates {
            if orphaned.contains(&chunk.track_id) {
                continue;
            }
            match self.resolve_uploader(&chunk.track_id).await {
                Some(uploader) => return self.upload_one(&chunk, &uploader).await,
                None => {
                    debug!(chunk_id = %chunk.id, "chunk has no uploader, leaving it pending");
                    orphaned.insert(chunk.track_id.clone());
                }
            }
        }
        TickOutcome::Idle
    }

    /// The registered uploader for a track, or one rebuilt from its
    /// persisted session.
    async fn resolve_uploader(&self, track_id: &str) -> Option<SharedUploader> {
        if let Some(uploader) = self.uploaders.get(track_id) {
            return Some(uploader);
        }

        let session = match self.store.get_session(track_id).await {
            Ok(Some(session)) => session,
            Ok(None) => return None,
            Err(err) => {
                warn!(track_id, "could not load upload session: {}", err);
                return None;
            }
        };

        match self.factory.recover(&session).await {
            Ok(uploader) => {
                info!(track_id, "rebuilt uploader for orphaned chunks");
                Some(
                    self.uploaders
                        .insert(track_id, uploader, UploaderOrigin::Recovered),
                )
            }
            Err(err) => {
                warn!(track_id, "could not rebuild uploader: {}", err);
                None
            }
        }
    }

    async fn upload_one(&self, chunk: &ChunkSummary, uploader: &SharedUploader) -> TickOutcome {
        match self.store.claim_chunk(&chunk.id).await {
            Ok(true) => {}
            Ok(false) => return TickOutcome::Skipped(chunk.id.clone()),
            Err(err) => {
                warn!(chunk_id = %chunk.id, "could not claim chunk: {}", err);
                return TickOutcome::Skipped(chunk.id.clone());
            }
        }

        let stored = match self.store.get_chunk(&chunk.id).await {
            Ok(Some(stored)) => stored,
            Ok(None) => return TickOutcome::Skipped(chunk.id.clone()),
            Err(err) => {
                warn!(chunk_id = %chunk.id, "could not load chunk payload: {}", err);
                self.mark(&chunk.id, ChunkStatus::Failed).await;
                return TickOutcome::Failed(chunk.id.clone());
            }
        };

        let result = {
            let mut uploader = uploader.lock().await;
            uploader
                .upload_part(Bytes::from(stored.payload), stored.part_number)
                .await
        };

        match result {
            Ok(_) => {
                self.mark(&chunk.id, ChunkStatus::Uploaded).await;
                TickOutcome::Uploaded(chunk.id.clone())
            }
            Err(err) => {
                error!(chunk_id = %chunk.id, "failed to upload chunk: {}", err);
                self.mark(&chunk.id, ChunkStatus::Failed).await;
                TickOutcome::Failed(chunk.id.clone())
            }
        }
    }

    async fn mark(&self, chunk_id: &str, status: ChunkStatus) {
        if let Err(err) = self.store.update_chunk_status(chunk_id, status).await {
            warn!(chunk_id, %status, "could not record chunk status: {}", err);
        }
    }

    /// Complete the upload of `track_id` and release its uploader.
    ///
    /// On success the session row is deleted. On failure the row is kept so
    /// the next startup can recover the upload. `Ok(None)` means no uploader
    /// was registered for the track.
    pub async fn finalize_track(
        &self,
        track_id: &str,
    ) -> Result<Option<CompleteOutcome>, UploaderError> {
        let Some(uploader) = self.uploaders.get(track_id) else {
            return Ok(None);
        };

        let result = uploader.lock().await.complete().await;
        self.uploaders.remove(track_id);

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(track_id, "finalization failed, keeping session for recovery: {}", err);
                return Err(err);
            }
        };

        if let Err(err) = self.store.delete_session(track_id).await {
            error!(track_id, "could not delete finished upload session: {}", err);
        }
        if self.prune_uploaded {
            match self.store.prune_uploaded(track_id).await {
                Ok(pruned) => debug!(track_id, pruned, "pruned uploaded chunks"),
                Err(err) => warn!(track_id, "could not prune uploaded chunks: {}", err),
            }
        }
        Ok(Some(outcome))
    }

    /// Finalize recovered uploads whose chunks are all uploaded. Returns how
    /// many were completed.
    pub async fn finalize_recovered(&self) -> usize {
        let _guard = self.lock.lock().await;
        let mut finalized = 0;

        for track_id in self.uploaders.recovered_tracks() {
            match self.store.unfinished_chunk_count(&track_id).await {
                Ok(0) => {}
                Ok(_) => continue,
                Err(err) => {
                    warn!(track_id = %track_id, "could not count unfinished chunks: {}", err);
                    continue;
                }
            }
            if let Ok(Some(_)) = self.finalize_track(&track_id).await {
                info!(track_id = %track_id, "finalized recovered upload");
                finalized += 1;
            }
        }
        finalized
    }

    /// Start the periodic worker. The first tick happens one `period` from
    /// now.
    pub fn spawn(self: &Arc<Self>, period: Duration) -> QueueWorker {
        let period = period.max(Duration::from_millis(1));
        let queue = Arc::clone(self);
        let token = CancellationToken::new();
        let cancelled = token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(?period, "upload queue worker started");

            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        if queue.tick().await == TickOutcome::Idle {
                            queue.finalize_recovered().await;
                        }
                    }
                }
            }
            info!("upload queue worker stopped");
        });

        QueueWorker { token, handle }
    }
}

/// Handle to the periodic queue task.
pub struct QueueWorker {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl QueueWorker {
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Stop ticking and wait for an in-flight tick to finish.
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(err) = self.handle.await {
            warn!("upload queue worker ended abnormally: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{chunk::StoredChunk, session::UploadSession};
    use crate::services::local_store::tests::temp_store;
    use crate::services::testing::{FakeRemote, fake_factory};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: LocalStore,
        remote: Arc<FakeRemote>,
        factory: UploaderFactory,
        queue: Arc<UploadQueue>,
    }

    async fn fixture() -> Fixture {
        let (dir, store) = temp_store().await;
        let remote = FakeRemote::new();
        let factory = fake_factory(&remote);
        let queue = Arc::new(UploadQueue::new(
            store.clone(),
            UploaderRegistry::default(),
            factory.clone(),
        ));
        Fixture {
            _dir: dir,
            store,
            remote,
            factory,
            queue,
        }
    }

    impl Fixture {
        async fn live_track(&self, track_id: &str) -> UploadSession {
            let mut uploader = self.factory.fresh(track_id);
            uploader.start().await.unwrap();
            let session = uploader.session().unwrap();
            self.store.put_session(&session).await.unwrap();
            self.queue
                .uploaders()
                .insert(track_id, uploader, UploaderOrigin::Live);
            session
        }

        async fn chunk(&self, track_id: &str, part: i32) {
            self.store
                .put_chunk(&StoredChunk::pending(track_id, part, vec![part as u8; 8]))
                .await
                .unwrap();
        }

        async fn status(&self, id: &str) -> ChunkStatus {
            self.store.get_chunk(id).await.unwrap().unwrap().status
        }
    }

    #[tokio::test]
    async fn tick_uploads_oldest_chunk() {
        let fx = fixture().await;
        fx.live_track("T1").await;
        fx.chunk("T1", 1).await;
        fx.chunk("T1", 2).await;

        assert_eq!(fx.queue.tick().await, TickOutcome::Uploaded("T1-1".into()));
        assert_eq!(fx.status("T1-1").await, ChunkStatus::Uploaded);
        assert_eq!(fx.status("T1-2").await, ChunkStatus::Pending);

        assert_eq!(fx.queue.tick().await, TickOutcome::Uploaded("T1-2".into()));
        assert_eq!(fx.queue.tick().await, TickOutcome::Idle);
    }

    #[tokio::test]
    async fn busy_queue_skips_tick() {
        let fx = fixture().await;
        fx.live_track("T1").await;
        fx.chunk("T1", 1).await;

        let guard = fx.queue.lock.lock().await;
        assert_eq!(fx.queue.tick().await, TickOutcome::Busy);
        drop(guard);
        assert_eq!(fx.queue.tick().await, TickOutcome::Uploaded("T1-1".into()));
    }

    #[tokio::test]
    async fn failed_chunk_is_retried_on_a_later_tick() {
        let fx = fixture().await;
        fx.live_track("T1").await;
        fx.chunk("T1", 5).await;
        fx.remote.fail_next_puts(3);

        assert_eq!(fx.queue.tick().await, TickOutcome::Failed("T1-5".into()));
        assert_eq!(fx.status("T1-5").await, ChunkStatus::Failed);
        assert_eq!(fx.remote.put_calls(), 3);

        assert_eq!(fx.queue.tick().await, TickOutcome::Uploaded("T1-5".into()));
        assert_eq!(fx.status("T1-5").await, ChunkStatus::Uploaded);
        assert_eq!(fx.remote.put_calls(), 4);
    }

    #[tokio::test]
    async fn orphan_without_session_does_not_block_others() {
        let fx = fixture().await;
        fx.chunk("GONE", 1).await;
        fx.live_track("T1").await;
        fx.chunk("T1", 1).await;

        assert_eq!(fx.queue.tick().await, TickOutcome::Uploaded("T1-1".into()));
        assert_eq!(fx.status("GONE-1").await, ChunkStatus::Pending);
        assert_eq!(fx.queue.tick().await, TickOutcome::Idle);
        assert_eq!(fx.status("GONE-1").await, ChunkStatus::Pending);
    }

    #[tokio::test]
    async fn orphan_with_session_gets_rebuilt_uploader() {
        let fx = fixture().await;
        fx.remote
            .seed_upload("upload-77", "recordings/t1.webm", &[1]);
        fx.store
            .put_session(&UploadSession::new("T1", "upload-77", "recordings/t1.webm"))
            .await
            .unwrap();
        // Part 1 reached storage but the crash happened before it was marked.
        fx.chunk("T1", 1).await;
        fx.chunk("T1", 2).await;

        assert_eq!(fx.queue.tick().await, TickOutcome::Uploaded("T1-1".into()));
        assert_eq!(fx.remote.put_calls(), 0);
        assert_eq!(
            fx.queue.uploaders().origin("T1"),
            Some(UploaderOrigin::Recovered)
        );

        assert_eq!(fx.queue.tick().await, TickOutcome::Uploaded("T1-2".into()));
        assert_eq!(fx.remote.put_calls(), 1);

        assert_eq!(fx.queue.finalize_recovered().await, 1);
        let completions = fx.remote.completions();
        assert_eq!(completions.len(), 1);
        let parts: Vec<i32> = completions[0].1.iter().map(|p| p.part_number).collect();
        assert_eq!(parts, vec![1, 2]);
        assert!(fx.store.get_session("T1").await.unwrap().is_none());
        assert!(fx.queue.uploaders().is_empty());
    }

    #[tokio::test]
    async fn recovered_upload_waits_for_pending_chunks() {
        let fx = fixture().await;
        fx.remote.seed_upload("upload-5", "k", &[]);
        fx.store
            .put_session(&UploadSession::new("T1", "upload-5", "k"))
            .await
            .unwrap();
        fx.chunk("T1", 1).await;
        let uploader = fx
            .factory
            .recover(&fx.store.get_session("T1").await.unwrap().unwrap())
            .await
            .unwrap();
        fx.queue
            .uploaders()
            .insert("T1", uploader, UploaderOrigin::Recovered);

        assert_eq!(fx.queue.finalize_recovered().await, 0);
        assert!(fx.remote.completions().is_empty());

        fx.queue.tick().await;
        assert_eq!(fx.queue.finalize_recovered().await, 1);
    }

    #[tokio::test]
    async fn drain_attempts_each_chunk_once() {
        let fx = fixture().await;
        fx.live_track("T1").await;
        fx.live_track("T2").await;
        fx.chunk("T1", 1).await;
        fx.chunk("T2", 1).await;
        fx.chunk("T1", 2).await;
        fx.remote.fail_next_puts(3);

        let report = fx.queue.drain_track("T1").await;
        assert_eq!(
            report,
            DrainReport {
                uploaded: 1,
                failed: 1,
                orphaned: 0
            }
        );
        assert_eq!(fx.status("T1-1").await, ChunkStatus::Failed);
        assert_eq!(fx.status("T1-2").await, ChunkStatus::Uploaded);
        assert_eq!(fx.status("T2-1").await, ChunkStatus::Pending);
    }

    #[tokio::test]
    async fn drain_reports_orphans() {
        let fx = fixture().await;
        fx.chunk("T9", 1).await;
        fx.chunk("T9", 2).await;

        let report = fx.queue.drain_track("T9").await;
        assert_eq!(report.orphaned, 2);
        assert_eq!(fx.status("T9-1").await, ChunkStatus::Pending);
    }

    #[tokio::test]
    async fn finalize_failure_keeps_session() {
        let fx = fixture().await;
        fx.live_track("T1").await;
        fx.chunk("T1", 1).await;
        fx.queue.tick().await;
        fx.remote.fail_next_completes(1);

        assert!(fx.queue.finalize_track("T1").await.is_err());
        assert!(fx.store.get_session("T1").await.unwrap().is_some());
        assert!(!fx.queue.uploaders().contains("T1"));
        assert_eq!(fx.queue.finalize_track("T1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn finalize_prunes_when_enabled() {
        let (dir, store) = temp_store().await;
        let remote = FakeRemote::new();
        let factory = fake_factory(&remote);
        let queue = UploadQueue::new(store.clone(), UploaderRegistry::default(), factory.clone())
            .with_pruning(true);
        let mut uploader = factory.fresh("T1");
        uploader.start().await.unwrap();
        store.put_session(&uploader.session().unwrap()).await.unwrap();
        queue
            .uploaders()
            .insert("T1", uploader, UploaderOrigin::Live);
        store
            .put_chunk(&StoredChunk::pending("T1", 1, vec![1]))
            .await
            .unwrap();

        queue.tick().await;
        let outcome = queue.finalize_track("T1").await.unwrap();
        assert_eq!(outcome, Some(CompleteOutcome::Completed { parts: 1 }));
        assert!(store.list_chunks("T1").await.unwrap().is_empty());
        drop(dir);
    }

    #[tokio::test]
    async fn worker_uploads_in_background() {
        let fx = fixture().await;
        fx.live_track("T1").await;
        fx.chunk("T1", 1).await;

        let worker = fx.queue.spawn(Duration::from_millis(10));
        assert!(worker.is_running());

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while fx.status("T1-1").await != ChunkStatus::Uploaded {
            assert!(std::time::Instant::now() < deadline, "chunk never uploaded");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        worker.shutdown().await;
    }
}
