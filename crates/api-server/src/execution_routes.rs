//! Read and approval-intent routes over `Execution`. No agent logic runs on
//! these request threads: approve/reject hand off to `approval-gate`, which
//! spawns the actual resume off the request, and every other route is a
//! plain read through `state-store`.

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use state_store::{Execution, ExecutionFilter, ExecutionStatus};
use uuid::Uuid;

use crate::{audit, ApiResponse, AppError, AppState};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/executions", get(list_executions))
        .route("/api/executions/:id", get(get_execution))
        .route("/api/executions/:id/approve", post(approve_execution))
        .route("/api/executions/:id/reject", post(reject_execution))
        .route("/api/approvals/:token", get(get_by_token))
        .route("/api/approvals/:token/approve", post(approve_by_token))
        .route("/api/approvals/:token/reject", post(reject_by_token))
}

#[derive(Deserialize, utoipa::IntoParams)]
struct ListQuery {
    user_id: Option<Uuid>,
    pipeline_id: Option<Uuid>,
    status: Option<String>,
}

#[derive(Serialize, utoipa::ToSchema)]
struct ExecutionSummary {
    id: Uuid,
    pipeline_id: Uuid,
    symbol: String,
    status: String,
    approval_status: String,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl From<&Execution> for ExecutionSummary {
    fn from(e: &Execution) -> Self {
        Self {
            id: e.id,
            pipeline_id: e.pipeline_id,
            symbol: e.symbol.clone(),
            status: e.status.as_str().to_string(),
            approval_status: e.approval_status.as_str().to_string(),
            created_at: e.created_at,
        }
    }
}

#[utoipa::path(
    get,
    path = "/api/executions",
    tag = "Executions",
    params(ListQuery),
    responses(
        (status = 200, description = "Executions matching the filter", body = [ExecutionSummary]),
    ),
)]
async fn list_executions(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> Result<Json<ApiResponse<Vec<ExecutionSummary>>>, AppError> {
    let filter = ExecutionFilter {
        user_id: q.user_id,
        pipeline_id: q.pipeline_id,
        status: q.status.as_deref().and_then(ExecutionStatus::parse),
        ..Default::default()
    };
    let executions = state.store.list_by(&filter).await.map_err(anyhow::Error::from)?;
    let summaries: Vec<ExecutionSummary> = executions.iter().map(ExecutionSummary::from).collect();
    Ok(Json(ApiResponse::success(summaries)))
}

#[utoipa::path(
    get,
    path = "/api/executions/{id}",
    tag = "Executions",
    params(("id" = Uuid, Path, description = "Execution id")),
    responses(
        (status = 200, description = "The execution's current state"),
        (status = 500, description = "Execution not found"),
    ),
)]
async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Execution>>, AppError> {
    let execution = state.store.load(id).await.map_err(anyhow::Error::from)?;
    Ok(Json(ApiResponse::success(execution)))
}

#[derive(Deserialize, utoipa::ToSchema)]
struct ApproveRequest {
    token: String,
}

#[derive(Deserialize, utoipa::ToSchema)]
struct RejectRequest {
    token: String,
    #[serde(default = "default_reject_reason")]
    reason: String,
}

fn default_reject_reason() -> String {
    "rejected by user".to_string()
}

#[utoipa::path(
    post,
    path = "/api/executions/{id}/approve",
    tag = "Executions",
    params(("id" = Uuid, Path, description = "Execution id")),
    request_body = ApproveRequest,
    responses(
        (status = 200, description = "Execution resumed"),
        (status = 400, description = "Not awaiting approval, or the approval window expired"),
        (status = 403, description = "Token does not match"),
    ),
)]
async fn approve_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ApproveRequest>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    resolve_approval(&state, id, &req.token, true, None).await
}

#[utoipa::path(
    post,
    path = "/api/executions/{id}/reject",
    tag = "Executions",
    params(("id" = Uuid, Path, description = "Execution id")),
    request_body = RejectRequest,
    responses(
        (status = 200, description = "Execution rejected"),
        (status = 400, description = "Not awaiting approval, or the approval window expired"),
        (status = 403, description = "Token does not match"),
    ),
)]
async fn reject_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<RejectRequest>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    resolve_approval(&state, id, &req.token, false, Some(req.reason)).await
}

/// Token-authenticated variant used from out-of-band links (e.g. an email or
/// Discord alert carrying `approval_token` directly, with no session).
async fn get_by_token(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Json<ApiResponse<Execution>>, AppError> {
    let matches = state
        .store
        .list_by(&ExecutionFilter { approval_token: Some(token), ..Default::default() })
        .await
        .map_err(anyhow::Error::from)?;
    let execution = matches
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("no execution awaiting approval for this token"))?;
    Ok(Json(ApiResponse::success(execution)))
}

async fn approve_by_token(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    let id = execution_id_for_token(&state, &token).await?;
    resolve_approval(&state, id, &token, true, None).await
}

async fn reject_by_token(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    let id = execution_id_for_token(&state, &token).await?;
    resolve_approval(&state, id, &token, false, Some(default_reject_reason())).await
}

async fn execution_id_for_token(state: &AppState, token: &str) -> Result<Uuid, AppError> {
    let matches = state
        .store
        .list_by(&ExecutionFilter { approval_token: Some(token.to_string()), ..Default::default() })
        .await
        .map_err(anyhow::Error::from)?;
    matches
        .first()
        .map(|e| e.id)
        .ok_or_else(|| anyhow::anyhow!("no execution awaiting approval for this token").into())
}

async fn resolve_approval(
    state: &AppState,
    id: Uuid,
    token: &str,
    approve: bool,
    reason: Option<String>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    let execution = state.store.load(id).await.map_err(anyhow::Error::from)?;
    let pipeline = state
        .dispatcher
        .get_pipeline(execution.pipeline_id)
        .await
        .map_err(AppError::Other)?
        .ok_or_else(|| anyhow::anyhow!("no pipeline definition registered for execution {id}"))?;

    let pool = state.store.pool().clone();

    if approve {
        state.approvals.approve(id, token, pipeline.config).await?;
        state.metrics.approvals_granted.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        audit::log_audit(&pool, "execution_approved", Some(&execution.symbol), Some("approve"), None, "api", None).await;
        Ok(Json(ApiResponse::success(serde_json::json!({ "execution_id": id, "approval_status": "approved" }))))
    } else {
        let reason = reason.unwrap_or_else(default_reject_reason);
        state.approvals.reject(id, token, &reason).await?;
        state.metrics.approvals_rejected.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        audit::log_audit(&pool, "execution_rejected", Some(&execution.symbol), Some("reject"), Some(&reason), "api", None).await;
        Ok(Json(ApiResponse::success(serde_json::json!({ "execution_id": id, "approval_status": "rejected", "reason": reason }))))
    }
}
