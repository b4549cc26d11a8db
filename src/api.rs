//! REST admission layer: thin validated entry points over the services.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};

use crate::branches::BranchService;
use crate::deploys::DeploymentService;
use crate::errors::{kind_of, Kind};
use crate::models::{AddDeploymentForm, AddRepositoryForm, RedeployForm};
use crate::repos::RepositoryService;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub repositories: Arc<RepositoryService>,
    pub branches: Arc<BranchService>,
    pub deployments: Arc<DeploymentService>,
    /// Shared access key; `None` disables authentication.
    pub access_key: Option<String>,
}

pub type SharedState = Arc<AppState>;

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized,
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotFound(msg) => {
                (StatusCode::NOT_FOUND, Json(serde_json::json!({"error": msg}))).into_response()
            }
            ApiError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": msg})),
            )
                .into_response(),
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED.into_response(),
            ApiError::Internal(msg) => {
                eprintln!("[api] internal error: {}", msg);
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        match kind_of(&err) {
            Some(Kind::NotFound) => ApiError::NotFound(err.to_string()),
            Some(Kind::BadInput) => ApiError::BadRequest(err.to_string()),
            Some(Kind::Unauthorized) => ApiError::Unauthorized,
            _ => ApiError::Internal(format!("{:#}", err)),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/repositories", get(list_repositories).post(create_repository))
        .route("/branches", get(list_branches))
        .route("/branch/:id", post(rebuild_branch))
        .route("/deployments", get(list_deployments).post(create_deployment))
        .route(
            "/deployment/:id",
            post(rebuild_deployment).delete(close_deployment),
        )
        .route("/health", get(health_check))
}

fn check_key(state: &AppState, query: &HashMap<String, String>) -> Result<(), ApiError> {
    if let Some(expected) = &state.access_key {
        if query.get("accessKey").map(String::as_str) != Some(expected.as_str()) {
            return Err(ApiError::Unauthorized);
        }
    }
    Ok(())
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_repositories(
    State(state): State<SharedState>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, ApiError> {
    check_key(&state, &query)?;
    let repositories = state.repositories.list().await?;
    Ok(Json(repositories))
}

async fn create_repository(
    State(state): State<SharedState>,
    Query(query): Query<HashMap<String, String>>,
    Json(form): Json<AddRepositoryForm>,
) -> Result<impl IntoResponse, ApiError> {
    check_key(&state, &query)?;
    let repository = state.repositories.add(form).await?;
    Ok(Json(repository))
}

async fn list_branches(
    State(state): State<SharedState>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, ApiError> {
    check_key(&state, &query)?;
    let branches = state.branches.list().await?;
    Ok(Json(branches))
}

async fn rebuild_branch(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, ApiError> {
    check_key(&state, &query)?;
    let branch = state.branches.rebuild(id).await?;
    Ok(Json(branch))
}

async fn list_deployments(
    State(state): State<SharedState>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, ApiError> {
    check_key(&state, &query)?;
    let deployments = state.deployments.list().await?;
    Ok(Json(deployments))
}

async fn create_deployment(
    State(state): State<SharedState>,
    Query(query): Query<HashMap<String, String>>,
    Json(form): Json<AddDeploymentForm>,
) -> Result<impl IntoResponse, ApiError> {
    check_key(&state, &query)?;
    let deployment = state.deployments.add(form).await?;
    Ok(Json(deployment))
}

async fn rebuild_deployment(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Query(query): Query<HashMap<String, String>>,
    Json(form): Json<RedeployForm>,
) -> Result<impl IntoResponse, ApiError> {
    check_key(&state, &query)?;
    let deployment = state.deployments.rebuild(id, form).await?;
    Ok(Json(deployment))
}

async fn close_deployment(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, ApiError> {
    check_key(&state, &query)?;
    state.deployments.close(id).await?;
    Ok(Json(serde_json::Value::Null))
}
