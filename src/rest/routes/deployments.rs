// SPDX-License-Identifier: MIT
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::deployment::orchestrator::StartRequest;
use crate::deployment::Deployment;
use crate::planner::BuildPlan;
use crate::rest::error::ApiError;
use crate::rest::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateDeploymentRequest {
    pub project_id: String,
    pub user_id: String,
    pub provider: String,
    pub environment: Option<String>,
    pub branch: Option<String>,
    pub build_command: Option<String>,
    pub output_dir: Option<String>,
    pub install_cmd: Option<String>,
    pub framework: Option<String>,
    #[serde(default)]
    pub env_vars: serde_json::Map<String, Value>,
    /// Caller asserts it's allowed to see files marked `protected` in the
    /// project snapshot. Defaults to false — an out-of-scope auth layer is
    /// expected to set this based on the caller's actual role, not trust it
    /// blindly from the request body; this crate just forwards it.
    #[serde(default)]
    pub privileged: bool,
}

pub async fn create_deployment(
    State(state): State<AppState>,
    Json(body): Json<CreateDeploymentRequest>,
) -> Result<(StatusCode, Json<Deployment>), ApiError> {
    let user_plan = BuildPlan {
        framework: body.framework,
        install_cmd: body.install_cmd,
        build_cmd: body.build_command,
        output_dir: body.output_dir,
        service_type: None,
        runtime_version: None,
    };

    let request = StartRequest {
        project_id: body.project_id,
        user_id: body.user_id,
        provider: body.provider,
        environment: body.environment.unwrap_or_else(|| "production".to_string()),
        branch: body.branch.unwrap_or_else(|| "main".to_string()),
        user_plan,
        privileged: body.privileged,
    };

    let deployment = state.orchestrator.start(request).await?;
    Ok((StatusCode::CREATED, Json(deployment)))
}

pub async fn get_deployment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Deployment>, ApiError> {
    let deployment = state.orchestrator.status(id).await?;
    Ok(Json(deployment))
}

pub async fn cancel_deployment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.orchestrator.cancel(id).await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    pub since: Option<i64>,
    pub limit: Option<i64>,
}

pub async fn get_deployment_logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<LogQuery>,
) -> Result<Json<Value>, ApiError> {
    let logs = state.orchestrator.logs(id, query.since, query.limit).await?;
    Ok(Json(json!(logs)))
}

pub async fn redeploy_deployment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<RedeployRequest>,
) -> Result<(StatusCode, Json<Deployment>), ApiError> {
    let deployment = state.orchestrator.redeploy(id, &body.user_id, body.privileged).await?;
    Ok((StatusCode::CREATED, Json(deployment)))
}

#[derive(Debug, Deserialize)]
pub struct RedeployRequest {
    pub user_id: String,
    #[serde(default)]
    pub privileged: bool,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

pub async fn list_project_deployments(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Value>, ApiError> {
    let page = query.page.unwrap_or(1);
    let limit = query.limit.unwrap_or(20);
    let (items, total) = state.orchestrator.history(&project_id, page, limit).await?;
    Ok(Json(json!({ "items": items, "total": total })))
}
