use crate::services::{
    recorder::RecordingOrchestrator,
    tracks::{ChannelTrackSource, PushCapture},
};
use std::sync::Arc;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub recorder: RecordingOrchestrator,
    pub source: Arc<ChannelTrackSource>,
    pub capture: PushCapture,
}

impl AppState {
    pub fn new(
        recorder: RecordingOrchestrator,
        source: Arc<ChannelTrackSource>,
        capture: PushCapture,
    ) -> Self {
        Self {
            recorder,
            source,
            capture,
        }
    }
}
