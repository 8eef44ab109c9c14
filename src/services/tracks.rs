//! Track source and capture facility seams, plus the channel-backed
//! implementations the agent binary drives over HTTP.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("track `{0}` is already capturing")]
    AlreadyCapturing(String),
    #[error("track `{0}` is not capturing")]
    NotCapturing(String),
    #[error("ingestion for track `{0}` has shut down")]
    SinkClosed(String),
    #[error("capture failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    /// Container format slices of this kind are recorded in.
    pub fn mime_type(&self) -> &'static str {
        match self {
            TrackKind::Video => "video/webm;codecs=vp9,opus",
            TrackKind::Audio => "audio/webm;codecs=opus",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalTrack {
    pub sid: String,
    pub kind: TrackKind,
}

impl LocalTrack {
    pub fn new(sid: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            sid: sid.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackEvent {
    Published(LocalTrack),
    Unpublished(String),
    Disconnected,
}

/// The conferencing side: which local tracks are published, and a stream of
/// changes to that set.
pub trait TrackSource: Send + Sync {
    fn published_tracks(&self) -> Vec<LocalTrack>;

    fn subscribe(&self) -> broadcast::Receiver<TrackEvent>;
}

/// Where a capture facility hands its slices. Delivery never waits on disk or
/// network.
#[derive(Debug, Clone)]
pub struct ChunkSink {
    track_id: String,
    tx: mpsc::UnboundedSender<Bytes>,
}

impl ChunkSink {
    pub fn new(track_id: impl Into<String>, tx: mpsc::UnboundedSender<Bytes>) -> Self {
        Self {
            track_id: track_id.into(),
            tx,
        }
    }

    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    pub fn deliver(&self, slice: Bytes) -> Result<(), CaptureError> {
        self.tx
            .send(slice)
            .map_err(|_| CaptureError::SinkClosed(self.track_id.clone()))
    }
}

/// Starts time-sliced capture of a track.
#[async_trait]
pub trait CaptureFacility: Send + Sync {
    async fn start(
        &self,
        track: &LocalTrack,
        slice_interval: Duration,
        sink: ChunkSink,
    ) -> Result<Box<dyn CaptureHandle>, CaptureError>;
}

#[async_trait]
pub trait CaptureHandle: Send + Sync {
    /// Stop capturing. Slices emitted before this returns have been handed
    /// to the sink.
    async fn stop(&self);

    async fn pause(&self);

    async fn resume(&self);
}

/// Track source fed by explicit publish/unpublish calls.
pub struct ChannelTrackSource {
    tracks: RwLock<BTreeMap<String, LocalTrack>>,
    events: broadcast::Sender<TrackEvent>,
}

impl Default for ChannelTrackSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelTrackSource {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            tracks: RwLock::new(BTreeMap::new()),
            events,
        }
    }

    /// Returns false if the track was already published.
    pub fn publish(&self, track: LocalTrack) -> bool {
        let added = {
            let mut tracks = self.tracks.write();
            if tracks.contains_key(&track.sid) {
                false
            } else {
                tracks.insert(track.sid.clone(), track.clone());
                true
            }
        };
        if added {
            // No subscribers is fine.
            let _ = self.events.send(TrackEvent::Published(track));
        }
        added
    }

    pub fn unpublish(&self, sid: &str) -> Option<LocalTrack> {
        let removed = self.tracks.write().remove(sid);
        if removed.is_some() {
            let _ = self.events.send(TrackEvent::Unpublished(sid.to_string()));
        }
        removed
    }

    /// Drops every published track and announces the disconnect.
    pub fn disconnect(&self) {
        self.tracks.write().clear();
        let _ = self.events.send(TrackEvent::Disconnected);
    }
}

impl TrackSource for ChannelTrackSource {
    fn published_tracks(&self) -> Vec<LocalTrack> {
        self.tracks.read().values().cloned().collect()
    }

    fn subscribe(&self) -> broadcast::Receiver<TrackEvent> {
        self.events.subscribe()
    }
}

struct PushSlot {
    sink: ChunkSink,
    paused: Arc<AtomicBool>,
}

/// Capture facility for an external encoder that pushes finished slices.
#[derive(Clone, Default)]
pub struct PushCapture {
    slots: Arc<RwLock<HashMap<String, PushSlot>>>,
}

impl PushCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_capturing(&self, track_id: &str) -> bool {
        self.slots.read().contains_key(track_id)
    }

    /// Hand one slice to the track's sink. Returns false when the capture is
    /// paused and the slice was dropped.
    pub fn push(&self, track_id: &str, slice: Bytes) -> Result<bool, CaptureError> {
        let slots = self.slots.read();
        let slot = slots
            .get(track_id)
            .ok_or_else(|| CaptureError::NotCapturing(track_id.to_string()))?;
        if slot.paused.load(Ordering::SeqCst) {
            debug!(track_id, "capture paused, dropping slice");
            return Ok(false);
        }
        slot.sink.deliver(slice)?;
        Ok(true)
    }
}

#[async_trait]
impl CaptureFacility for PushCapture {
    async fn start(
        &self,
        track: &LocalTrack,
        slice_interval: Duration,
        sink: ChunkSink,
    ) -> Result<Box<dyn CaptureHandle>, CaptureError> {
        let mut slots = self.slots.write();
        if slots.contains_key(&track.sid) {
            return Err(CaptureError::AlreadyCapturing(track.sid.clone()));
        }
        let paused = Arc::new(AtomicBool::new(false));
        slots.insert(
            track.sid.clone(),
            PushSlot {
                sink,
                paused: paused.clone(),
            },
        );
        debug!(track_id = %track.sid, ?slice_interval, mime = track.kind.mime_type(), "push capture armed");
        Ok(Box::new(PushHandle {
            track_id: track.sid.clone(),
            slots: self.slots.clone(),
            paused,
        }))
    }
}

struct PushHandle {
    track_id: String,
    slots: Arc<RwLock<HashMap<String, PushSlot>>>,
    paused: Arc<AtomicBool>,
}

#[async_trait]
impl CaptureHandle for PushHandle {
    async fn stop(&self) {
        self.slots.write().remove(&self.track_id);
    }

    async fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    async fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_types_follow_kind() {
        assert_eq!(TrackKind::Video.mime_type(), "video/webm;codecs=vp9,opus");
        assert_eq!(TrackKind::Audio.mime_type(), "audio/webm;codecs=opus");
    }

    #[tokio::test]
    async fn channel_source_broadcasts_changes() {
        let source = ChannelTrackSource::new();
        let mut events = source.subscribe();

        assert!(source.publish(LocalTrack::new("T1", TrackKind::Audio)));
        assert!(!source.publish(LocalTrack::new("T1", TrackKind::Audio)));
        assert_eq!(source.published_tracks().len(), 1);
        assert!(source.unpublish("T1").is_some());
        assert!(source.unpublish("T1").is_none());
        source.publish(LocalTrack::new("T2", TrackKind::Video));
        source.disconnect();

        assert_eq!(
            events.recv().await.unwrap(),
            TrackEvent::Published(LocalTrack::new("T1", TrackKind::Audio))
        );
        assert_eq!(
            events.recv().await.unwrap(),
            TrackEvent::Unpublished("T1".into())
        );
        assert!(matches!(events.recv().await.unwrap(), TrackEvent::Published(_)));
        assert_eq!(events.recv().await.unwrap(), TrackEvent::Disconnected);
        assert!(source.published_tracks().is_empty());
    }

    #[tokio::test]
    async fn push_capture_delivers_until_stopped() {
        let capture = PushCapture::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let track = LocalTrack::new("T1", TrackKind::Video);
        let handle = capture
            .start(&track, Duration::from_secs(4), ChunkSink::new("T1", tx.clone()))
            .await
            .unwrap();

        assert!(matches!(
            capture
                .start(&track, Duration::from_secs(4), ChunkSink::new("T1", tx))
                .await,
            Err(CaptureError::AlreadyCapturing(_))
        ));

        assert!(capture.push("T1", Bytes::from_static(b"one")).unwrap());
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"one"));

        handle.stop().await;
        assert!(!capture.is_capturing("T1"));
        assert!(matches!(
            capture.push("T1", Bytes::from_static(b"two")),
            Err(CaptureError::NotCapturing(_))
        ));
    }

    #[tokio::test]
    async fn paused_capture_drops_slices() {
        let capture = PushCapture::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = capture
            .start(
                &LocalTrack::new("T1", TrackKind::Audio),
                Duration::from_secs(4),
                ChunkSink::new("T1", tx),
            )
            .await
            .unwrap();

        handle.pause().await;
        assert!(!capture.push("T1", Bytes::from_static(b"x")).unwrap());
        handle.resume().await;
        assert!(capture.push("T1", Bytes::from_static(b"y")).unwrap());
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"y"));
    }

    #[test]
    fn closed_sink_reports_track() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let sink = ChunkSink::new("T3", tx);
        assert!(matches!(
            sink.deliver(Bytes::from_static(b"z")),
            Err(CaptureError::SinkClosed(id)) if id == "T3"
        ));
    }
}
