//! Routes of the recorder's local control surface.
//!
//! - `GET    /healthz`, `GET /readyz`: probes
//! - `GET    /status`: orchestrator snapshot
//! - `POST   /recording/{command}`: `start-recording`, `stop-recording`,
//!   `pause-recording`, `resume-recording`
//! - `POST   /tracks/{track_id}`: publish a local track
//! - `DELETE /tracks/{track_id}`: unpublish it
//! - `POST   /tracks/{track_id}/chunks`: push one captured slice
//! - `POST   /disconnect`: the conferencing connection dropped

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        recording_handlers::{
            control, disconnect, publish_track, push_chunk, status, unpublish_track,
        },
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Build the router. Handlers share [`AppState`]. Slice pushes may carry
/// up to `max_slice_bytes`; other bodies keep axum's default limit.
pub fn routes(max_slice_bytes: usize) -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/status", get(status))
        .route("/recording/{command}", post(control))
        .route(
            "/tracks/{track_id}",
            post(publish_track).delete(unpublish_track),
        )
        .route(
            "/tracks/{track_id}/chunks",
            post(push_chunk).layer(DefaultBodyLimit::max(max_slice_bytes)),
        )
        .route("/disconnect", post(disconnect))
}
