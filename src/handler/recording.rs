use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::api::AppState;
use crate::handler::{ApiError, ApiResult};
use crate::pipeline::{Pipeline, PipelineOptions};

pub fn recording_router() -> Router<AppState> {
    Router::new()
        .route("/ping", get(ping))
        .route("/start-recording", post(start_recording))
        .route("/stop-recording", patch(stop_recording))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChunkingRequest {
    /// Segment duration in seconds.
    pub duration: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartRecordingRequest {
    pub record_url: String,
    #[serde(default)]
    pub stream_url: Option<String>,
    #[serde(default)]
    pub chunking: Option<ChunkingRequest>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartRecordingResponse {
    pub status: String,
    pub id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StopRecordingRequest {
    pub id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StopRecordingResponse {
    pub id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recording_url: Option<String>,
}

async fn ping() -> &'static str {
    "pong"
}

async fn start_recording(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<Json<StartRecordingResponse>> {
    let request: StartRecordingRequest = serde_json::from_slice(&body)
        .map_err(|_| ApiError::bad_request("Invalid request payload"))?;

    if request.record_url.is_empty() {
        return Err(ApiError::bad_request("Invalid request payload"));
    }

    let pipeline = Arc::new(Pipeline::new(
        &state.shutdown,
        PipelineOptions {
            record_url: request.record_url,
            stream_url: request.stream_url,
            chunking: request
                .chunking
                .map(|c| Duration::from_secs(c.duration)),
        },
    ));

    log::info!("starting recording pipeline {}", pipeline.id);

    if let Err(err) = pipeline
        .start(Arc::clone(&state.store), &state.config)
        .await
    {
        log::error!("pipeline {} failed to start: {err}", pipeline.id);
        return Err(ApiError::internal("Failed to start Recording Pipeline"));
    }

    state
        .registry
        .add(pipeline.id.clone(), Arc::clone(&pipeline))
        .await;

    Ok(Json(StartRecordingResponse {
        status: "Recording Pipeline started".to_string(),
        id: pipeline.id.clone(),
    }))
}

async fn stop_recording(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<Json<StopRecordingResponse>> {
    let request: StopRecordingRequest = serde_json::from_slice(&body)
        .map_err(|_| ApiError::bad_request("Invalid request payload"))?;

    let Some(pipeline) = state.registry.get(&request.id).await else {
        return Err(ApiError::not_found("Recording not found"));
    };

    let completed = pipeline.stop().await.map_err(|err| {
        log::error!("pipeline {} failed to stop: {err:#}", request.id);
        ApiError::internal("Failed to stop recording")
    })?;

    state.registry.remove(&request.id).await;

    Ok(Json(StopRecordingResponse {
        id: request.id,
        status: "Recording stopped".to_string(),
        recording_url: completed.map(|c| c.recording_url),
    }))
}
