//! Admin API handlers.
//!
//! The state store is synchronous, so each handler runs its cloud
//! operation on the blocking pool and wraps the outcome in an
//! [`ApiResponse`].

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error};

use fleet_events::{AgentRegistration, PartitionError, ServerRegistration};
use fleet_state::{
    AgentInfo, ExecutionStatus, OperationMode, PartitionEventType, ServerEntry, StateError,
    epoch_secs,
};

use crate::ApiState;

/// Response envelope shared by every route.
#[derive(Debug, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

/// Why a request failed.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Partition(#[from] PartitionError),

    #[error(transparent)]
    State(#[from] StateError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Partition(PartitionError::Configuration(_)) => StatusCode::BAD_REQUEST,
            Self::Partition(_) | Self::State(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

async fn run_blocking<T, F>(work: F) -> Response
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Serialize + Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(Ok(data)) => ApiResponse::ok(data).into_response(),
        Ok(Err(e)) => {
            let status = e.status();
            if status.is_server_error() {
                error!(error = %e, "admin request failed");
            } else {
                debug!(error = %e, %status, "admin request rejected");
            }
            error_response(&e.to_string(), status)
        }
        Err(e) => {
            error!(error = %e, "admin request task failed");
            error_response("internal error", StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

// ── Request / response bodies ──────────────────────────────────

/// Body of `PUT .../affinity`. A missing group clears it.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AffinityRequest {
    #[serde(default)]
    pub group: Option<String>,
}

/// Body of `POST /api/v1/operation-mode`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ModeRequest {
    pub mode: OperationMode,
    pub names: Vec<String>,
}

/// Body of `POST /api/v1/agents/{name}/connect`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub server: String,
}

/// Body of `POST /api/v1/repartition`.
#[derive(Debug, Serialize, Deserialize)]
pub struct RepartitionRequest {
    #[serde(default = "default_detail")]
    pub detail: String,
}

fn default_detail() -> String {
    "operator request".to_string()
}

/// Query of `GET /api/v1/events`.
#[derive(Debug, Default, Deserialize)]
pub struct EventQuery {
    pub status: Option<ExecutionStatus>,
}

/// A registered agent and the failover list it should use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRegistered {
    pub agent: AgentInfo,
    pub failover_list: Vec<ServerEntry>,
}

// ── Cloud ──────────────────────────────────────────────────────

/// GET /api/v1/status
pub async fn cloud_status(State(state): State<ApiState>) -> Response {
    run_blocking(move || Ok(state.cloud.cloud_status()?)).await
}

/// POST /api/v1/repartition
pub async fn repartition(
    State(state): State<ApiState>,
    Json(req): Json<RepartitionRequest>,
) -> Response {
    run_blocking(move || {
        Ok(state
            .cloud
            .coordinator()
            .fleet_wide_event(PartitionEventType::ManualRequest, &req.detail)?)
    })
    .await
}

/// GET /api/v1/events
pub async fn list_events(
    State(state): State<ApiState>,
    Query(query): Query<EventQuery>,
) -> Response {
    run_blocking(move || {
        let events = match query.status {
            Some(status) => state.events.list_by_status(status)?,
            None => state.events.list_events()?,
        };
        Ok(events)
    })
    .await
}

// ── Servers ────────────────────────────────────────────────────

/// POST /api/v1/servers
pub async fn register_server(
    State(state): State<ApiState>,
    Json(registration): Json<ServerRegistration>,
) -> Response {
    run_blocking(move || Ok(state.cloud.register_server(registration)?)).await
}

/// DELETE /api/v1/servers/{name}
pub async fn delete_server(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    run_blocking(move || {
        state.cloud.delete_server(&name)?;
        Ok(json!({ "deleted": name }))
    })
    .await
}

/// POST /api/v1/servers/{name}/heartbeat
pub async fn heartbeat(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    run_blocking(move || {
        if !state.cloud.heartbeat(&name)? {
            return Err(ApiError::NotFound(format!("unknown server: {name}")));
        }
        Ok(json!({ "server": name, "heartbeat": epoch_secs() }))
    })
    .await
}

/// PUT /api/v1/servers/{name}/affinity
pub async fn set_server_affinity(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(req): Json<AffinityRequest>,
) -> Response {
    run_blocking(move || {
        state.cloud.set_server_affinity_group(&name, req.group.clone())?;
        Ok(json!({ "server": name, "affinity_group": req.group }))
    })
    .await
}

/// POST /api/v1/operation-mode
pub async fn set_operation_mode(
    State(state): State<ApiState>,
    Json(req): Json<ModeRequest>,
) -> Response {
    run_blocking(move || {
        let changed = state.cloud.set_operation_mode(&req.names, req.mode)?;
        Ok(json!({ "mode": req.mode, "changed": changed }))
    })
    .await
}

// ── Agents ─────────────────────────────────────────────────────

/// POST /api/v1/agents
pub async fn register_agent(
    State(state): State<ApiState>,
    Json(registration): Json<AgentRegistration>,
) -> Response {
    run_blocking(move || {
        let (agent, failover_list) = state.cloud.register_agent(registration)?;
        Ok(AgentRegistered {
            agent,
            failover_list,
        })
    })
    .await
}

/// POST /api/v1/agents/{name}/connect
pub async fn agent_connected(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(req): Json<ConnectRequest>,
) -> Response {
    run_blocking(move || {
        state.cloud.agent_connected(&name, &req.server)?;
        Ok(json!({ "agent": name, "server": req.server }))
    })
    .await
}

/// POST /api/v1/agents/{name}/shutdown
pub async fn agent_shutdown(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    run_blocking(move || {
        state.cloud.agent_shutdown(&name)?;
        Ok(json!({ "agent": name, "shutdown": true }))
    })
    .await
}

/// PUT /api/v1/agents/{name}/affinity
pub async fn set_agent_affinity(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(req): Json<AffinityRequest>,
) -> Response {
    run_blocking(move || {
        state.cloud.set_agent_affinity_group(&name, req.group.clone())?;
        Ok(json!({ "agent": name, "affinity_group": req.group }))
    })
    .await
}

/// GET /api/v1/agents/{name}/failover-list
pub async fn failover_list(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    run_blocking(move || match state.cloud.coordinator().existing_for_agent(&name)? {
        Some(list) => Ok(list),
        None => Err(ApiError::NotFound(format!("agent {name} has no failover list"))),
    })
    .await
}
