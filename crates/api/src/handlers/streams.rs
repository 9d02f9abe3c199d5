//! Handlers for live-stream relay sessions.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::Json;
use kiln_core::error::CoreError;
use kiln_core::session::{validate_session_id, SessionState};
use kiln_core::types::Timestamp;
use kiln_relay::registry::{DescriptorOrigin, SessionDescriptor};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::response::DataResponse;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartStreamRequest {
    pub source_url: String,
    pub session_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartStreamResponse {
    pub url: String,
    pub session_id: String,
    pub reused: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopStreamRequest {
    pub session_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopStreamResponse {
    /// Always `true`: stop is idempotent.
    pub success: bool,
    pub session_id: String,
    pub was_running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

/// Public view of a tracked session.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub session_id: String,
    pub pid: u32,
    pub state: SessionState,
    pub url: String,
    pub started_at: Timestamp,
    pub uptime_secs: i64,
    /// Launched by another server instance and known only by its marker.
    pub adopted: bool,
}

impl From<SessionDescriptor> for SessionView {
    fn from(d: SessionDescriptor) -> Self {
        let uptime_secs = (chrono::Utc::now() - d.started_at).num_seconds().max(0);
        Self {
            session_id: d.id,
            pid: d.pid,
            state: d.state,
            url: d.url,
            started_at: d.started_at,
            uptime_secs,
            adopted: d.origin == DescriptorOrigin::Marker,
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// POST /streams/start
///
/// Start (or reuse) a relay session and block until its playlist exists.
/// The launch runs on its own task so a client disconnect cancels the
/// readiness wait and tears the launch down instead of orphaning it.
pub async fn start_stream(
    State(state): State<AppState>,
    payload: Result<Json<StartStreamRequest>, JsonRejection>,
) -> AppResult<Json<DataResponse<StartStreamResponse>>> {
    let Json(body) = payload.map_err(|e| AppError::BadRequest(e.body_text()))?;

    let cancel = state.shutdown.child_token();
    let _disconnect_guard = cancel.clone().drop_guard();

    let supervisor = state.supervisor.clone();
    let started = tokio::spawn(async move {
        supervisor
            .start_stream(&body.session_id, &body.source_url, &cancel)
            .await
    })
    .await
    .map_err(|e| CoreError::Internal(format!("start task failed: {e}")))??;

    Ok(Json(DataResponse {
        data: StartStreamResponse {
            url: started.url,
            session_id: started.session_id,
            reused: started.reused,
        },
    }))
}

/// POST /streams/stop
///
/// Kill a session. Never fails for unknown or already-stopped sessions.
pub async fn stop_stream(
    State(state): State<AppState>,
    payload: Result<Json<StopStreamRequest>, JsonRejection>,
) -> AppResult<Json<DataResponse<StopStreamResponse>>> {
    let Json(body) = payload.map_err(|e| AppError::BadRequest(e.body_text()))?;
    let outcome = state.supervisor.stop_stream(&body.session_id).await;

    Ok(Json(DataResponse {
        data: StopStreamResponse {
            success: true,
            session_id: outcome.session_id,
            was_running: outcome.was_running,
            pid: outcome.pid,
        },
    }))
}

/// GET /streams
pub async fn list_streams(
    State(state): State<AppState>,
) -> AppResult<Json<DataResponse<Vec<SessionView>>>> {
    let sessions = state.supervisor.registry().list().await;
    Ok(Json(DataResponse {
        data: sessions.into_iter().map(SessionView::from).collect(),
    }))
}

/// GET /streams/{id}
pub async fn get_stream(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> AppResult<Json<DataResponse<SessionView>>> {
    validate_session_id(&session_id)?;
    let descriptor = state
        .supervisor
        .registry()
        .get(&session_id)
        .await
        .ok_or(CoreError::NotFound {
            entity: "Stream session",
            id: session_id,
        })?;
    Ok(Json(DataResponse {
        data: descriptor.into(),
    }))
}
