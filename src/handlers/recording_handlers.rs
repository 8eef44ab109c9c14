//! HTTP handlers for the recording control surface.
//!
//! The application drives the recorder through control commands, announces
//! published tracks and pushes captured slices; everything else happens in
//! the orchestrator.

use crate::{
    errors::AppError,
    services::{
        recorder::{ControlCommand, RecorderStatus},
        tracks::{LocalTrack, TrackKind},
    },
    state::AppState,
};
use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct PublishTrackReq {
    pub kind: TrackKind,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishTrackResp {
    pub track_id: String,
    pub kind: TrackKind,
    pub mime_type: &'static str,
    pub slice_interval_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct PushChunkResp {
    pub accepted: bool,
}

/// `GET /status`
pub async fn status(State(state): State<AppState>) -> Result<Json<RecorderStatus>, AppError> {
    Ok(Json(state.recorder.status().await?))
}

/// `POST /recording/{command}`; responds with the resulting status.
pub async fn control(
    State(state): State<AppState>,
    Path(command): Path<String>,
) -> Result<Json<RecorderStatus>, AppError> {
    let command: ControlCommand = command.parse()?;
    tracing::info!(?command, "control command received");
    state.recorder.apply(command).await?;
    Ok(Json(state.recorder.status().await?))
}

/// `POST /tracks/{track_id}`
pub async fn publish_track(
    State(state): State<AppState>,
    Path(track_id): Path<String>,
    Json(req): Json<PublishTrackReq>,
) -> impl IntoResponse {
    let added = state
        .source
        .publish(LocalTrack::new(track_id.clone(), req.kind));
    let code = if added {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    (
        code,
        Json(PublishTrackResp {
            track_id,
            kind: req.kind,
            mime_type: req.kind.mime_type(),
            slice_interval_ms: state.recorder.config().slice_interval.as_millis() as u64,
        }),
    )
}

/// `DELETE /tracks/{track_id}`
pub async fn unpublish_track(
    State(state): State<AppState>,
    Path(track_id): Path<String>,
) -> Result<StatusCode, AppError> {
    match state.source.unpublish(&track_id) {
        Some(_) => Ok(StatusCode::NO_CONTENT),
        None => Err(AppError::not_found(format!(
            "track `{}` is not published",
            track_id
        ))),
    }
}

/// `POST /tracks/{track_id}/chunks`; the raw body is one captured slice.
pub async fn push_chunk(
    State(state): State<AppState>,
    Path(track_id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let accepted = state.capture.push(&track_id, body)?;
    Ok((StatusCode::ACCEPTED, Json(PushChunkResp { accepted })))
}

/// `POST /disconnect`
pub async fn disconnect(State(state): State<AppState>) -> StatusCode {
    state.source.disconnect();
    StatusCode::NO_CONTENT
}
