//! Stub pipeline authoring surface. Full CRUD (versioning, validation,
//! scanner/agent sub-resources) is an external orchestration control plane
//! out of scope for this core; this exists only so a pipeline definition
//! can be registered with the dispatcher's `dispatcher_pipelines` table and
//! exercised end-to-end through the approval/event surface in tests.

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use pipeline_executor::PipelineConfig;
use serde::{Deserialize, Serialize};
use state_store::ExecutionMode;
use trigger_dispatcher::{PipelineRecord, TriggerMode};
use uuid::Uuid;

use crate::{ApiResponse, AppError, AppState};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/pipelines", post(create_pipeline))
        .route("/api/pipelines/:id", get(get_pipeline))
}

#[derive(Deserialize)]
struct CreatePipelineRequest {
    user_id: Uuid,
    tickers: Vec<String>,
    #[serde(default)]
    signal_triggered: bool,
    #[serde(default = "default_monitor_interval")]
    monitor_interval_seconds: i64,
    #[serde(default = "default_mode")]
    mode: String,
    config: PipelineConfig,
}

fn default_monitor_interval() -> i64 {
    300
}

fn default_mode() -> String {
    "paper".to_string()
}

#[derive(Serialize, utoipa::ToSchema)]
struct PipelineResponse {
    pipeline_id: Uuid,
}

#[utoipa::path(
    post,
    path = "/api/pipelines",
    tag = "Pipelines",
    responses(
        (status = 200, description = "Pipeline registered with the dispatcher", body = PipelineResponse),
        (status = 400, description = "Pipeline config failed validation"),
    ),
)]
async fn create_pipeline(
    State(state): State<AppState>,
    Json(req): Json<CreatePipelineRequest>,
) -> Result<Json<ApiResponse<PipelineResponse>>, AppError> {
    validation::validate_pipeline(&req.config, state.agent_registry.as_ref(), req.monitor_interval_seconds)
        .map_err(|e| AppError::Other(e.into()))?;

    let pipeline_id = req.config.pipeline_id;
    let record = PipelineRecord {
        pipeline_id,
        user_id: req.user_id,
        is_active: true,
        trigger_mode: if req.signal_triggered { TriggerMode::Signal } else { TriggerMode::Periodic },
        tickers: req.tickers,
        monitor_interval_seconds: req.monitor_interval_seconds,
        mode: ExecutionMode::parse(&req.mode).unwrap_or(ExecutionMode::Paper),
        config: req.config,
    };

    state.dispatcher.register_pipeline(&record).await.map_err(AppError::Other)?;
    Ok(Json(ApiResponse::success(PipelineResponse { pipeline_id })))
}

#[utoipa::path(
    get,
    path = "/api/pipelines/{id}",
    tag = "Pipelines",
    params(("id" = Uuid, Path, description = "Pipeline id")),
    responses(
        (status = 200, description = "The pipeline's registered graph config"),
        (status = 500, description = "Pipeline not found"),
    ),
)]
async fn get_pipeline(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<PipelineConfig>>, AppError> {
    let record = state
        .dispatcher
        .get_pipeline(id)
        .await
        .map_err(AppError::Other)?
        .ok_or_else(|| anyhow::anyhow!("pipeline {id} not found"))?;
    Ok(Json(ApiResponse::success(record.config)))
}
