//! JSON control relay: the control surface over HTTP, for dashboards and
//! scripts driving a master (or a standalone worker).

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::cluster::master::{MasterNode, WorkerView};
use crate::engine::controller::{RunController, RunState};
use crate::engine::spawner::StopOutcome;
use crate::error::SwarmError;
use crate::stats::ReportStats;

#[derive(Clone)]
pub struct ApiState {
    pub controller: RunController,
    /// Present when the controller relays to workers.
    pub master: Option<Arc<MasterNode>>,
}

#[derive(Debug, Deserialize)]
pub struct SwarmRequest {
    pub user_count: usize,
    #[serde(alias = "rate")]
    pub spawn_rate: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiMessage {
    pub success: bool,
    pub message: String,
}

impl ApiMessage {
    fn ok(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: true,
            message: message.into(),
        })
    }
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub state: RunState,
    pub report: ReportStats,
}

pub struct ApiError(SwarmError);

impl From<SwarmError> for ApiError {
    fn from(e: SwarmError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SwarmError::InvalidRate(_)
            | SwarmError::InvalidWeight { .. }
            | SwarmError::InvalidBehavior { .. }
            | SwarmError::UnknownBehavior(_)
            | SwarmError::Config(_) => StatusCode::BAD_REQUEST,
            SwarmError::InvalidTransition { .. } => StatusCode::CONFLICT,
            SwarmError::UnknownWorker(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(ApiMessage {
            success: false,
            message: self.0.to_string(),
        });
        (status, body).into_response()
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/swarm", post(handle_swarm))
        .route("/stop", post(handle_stop))
        .route("/stats", get(handle_stats))
        .route("/stats/reset", post(handle_reset))
        .route("/workers", get(handle_workers))
        .route("/workers/{id}/drain", post(handle_drain))
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: ApiState) -> anyhow::Result<()> {
    tracing::info!(addr = ?listener.local_addr().ok(), "control api listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn handle_swarm(State(state): State<ApiState>, Json(req): Json<SwarmRequest>) -> Result<Json<ApiMessage>, ApiError> {
    state.controller.start(req.user_count, req.spawn_rate).await?;
    Ok(ApiMessage::ok(format!(
        "swarming {} users at {} users/s",
        req.user_count, req.spawn_rate
    )))
}

async fn handle_stop(State(state): State<ApiState>) -> Json<StopOutcome> {
    Json(state.controller.stop().await)
}

async fn handle_reset(State(state): State<ApiState>) -> Result<Json<ApiMessage>, ApiError> {
    state.controller.reset_stats().await?;
    Ok(ApiMessage::ok("stats reset"))
}

async fn handle_stats(State(state): State<ApiState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        state: state.controller.state(),
        report: state.controller.report(),
    })
}

async fn handle_workers(State(state): State<ApiState>) -> Json<Vec<WorkerView>> {
    Json(state.master.as_ref().map(|m| m.workers()).unwrap_or_default())
}

async fn handle_drain(State(state): State<ApiState>, Path(id): Path<String>) -> Result<Json<ApiMessage>, ApiError> {
    let master = state
        .master
        .as_ref()
        .ok_or_else(|| SwarmError::UnknownWorker(id.clone()))?;
    master.drain(&id)?;
    Ok(ApiMessage::ok(format!("draining {}", id)))
}
