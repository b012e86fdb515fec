use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use loki_db::models::{Chain, ChainWithSteps, RunWithStepRuns};
use loki_db::repo::{ChainChanges, ChainRepo};
use loki_engine::{NewChain, RunReceipt};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/execution-chains", post(create_chain).get(list_chains))
        .route(
            "/api/execution-chains/{id}",
            get(get_chain).put(update_chain).delete(delete_chain),
        )
        .route("/api/execution-chains/{id}/execute", post(execute_chain))
        .route("/api/execution-chains/{id}/runs", get(list_runs))
        .route("/api/execution-chains/runs/{run_id}", get(get_run))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct CreateChainResponse {
    chain_id: Uuid,
    name: String,
    trigger_event: String,
    steps_count: usize,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct ListChainsQuery {
    tenant_id: String,
    page: Option<i64>,
    limit: Option<i64>,
}

#[derive(Debug, Serialize)]
struct ChainListResponse {
    chains: Vec<Chain>,
    total: i64,
    page: i64,
    limit: i64,
}

#[derive(Debug, Deserialize)]
struct UpdateChainRequest {
    name: Option<String>,
    description: Option<String>,
    is_active: Option<bool>,
}

#[derive(Debug, Serialize)]
struct UpdateChainResponse {
    chain_id: Uuid,
    updated: bool,
}

#[derive(Debug, Serialize)]
struct DeleteChainResponse {
    chain_id: Uuid,
    deleted: bool,
}

#[derive(Debug, Deserialize, Default)]
struct ExecuteChainRequest {
    #[serde(default)]
    trigger_data: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ListRunsQuery {
    page: Option<i64>,
    limit: Option<i64>,
}

#[derive(Debug, Serialize)]
struct RunListResponse {
    runs: Vec<loki_db::models::ChainRun>,
    total: i64,
    page: i64,
    limit: i64,
}

/// Create a chain with its steps. Step structure is immutable afterwards.
async fn create_chain(
    State(state): State<AppState>,
    Json(payload): Json<NewChain>,
) -> ApiResult<(StatusCode, Json<CreateChainResponse>)> {
    if payload.tenant_id.trim().is_empty() {
        return Err(ApiError::BadRequest("tenant_id is required".to_string()));
    }
    if payload.name.trim().is_empty() {
        return Err(ApiError::BadRequest("name is required".to_string()));
    }
    if payload.trigger_event.trim().is_empty() {
        return Err(ApiError::BadRequest("trigger_event is required".to_string()));
    }

    let created = state.executor.create_chain(payload).await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateChainResponse {
            chain_id: created.chain.id,
            name: created.chain.name,
            trigger_event: created.chain.trigger_event,
            steps_count: created.steps.len(),
            created_at: created.chain.created_at,
        }),
    ))
}

async fn get_chain(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ChainWithSteps>> {
    let chain = state
        .chains
        .get_chain(id)
        .await?
        .ok_or_else(|| ApiError::NotFound("chain not found".to_string()))?;
    Ok(Json(chain))
}

async fn list_chains(
    State(state): State<AppState>,
    Query(query): Query<ListChainsQuery>,
) -> ApiResult<Json<ChainListResponse>> {
    if query.tenant_id.trim().is_empty() {
        return Err(ApiError::BadRequest("tenant_id is required".to_string()));
    }
    let (page, limit) = normalize_pagination(query.page, query.limit);

    let (chains, total) = state
        .chains
        .list_chains(&query.tenant_id, (page - 1) * limit, limit)
        .await?;

    Ok(Json(ChainListResponse {
        chains,
        total,
        page,
        limit,
    }))
}

/// Rename, redescribe, or toggle the active flag.
async fn update_chain(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateChainRequest>,
) -> ApiResult<Json<UpdateChainResponse>> {
    let changes = ChainChanges {
        name: payload.name,
        description: payload.description,
        is_active: payload.is_active,
    };
    if changes.is_empty() {
        return Err(ApiError::BadRequest("no fields to update".to_string()));
    }

    let updated = state.chains.update_chain(id, changes).await?;
    if !updated {
        return Err(ApiError::NotFound("chain not found".to_string()));
    }

    Ok(Json(UpdateChainResponse {
        chain_id: id,
        updated: true,
    }))
}

async fn delete_chain(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<DeleteChainResponse>> {
    let deleted = state.chains.delete_chain(id).await?;
    if !deleted {
        return Err(ApiError::NotFound("chain not found".to_string()));
    }

    Ok(Json(DeleteChainResponse {
        chain_id: id,
        deleted: true,
    }))
}

/// Start a run manually. Returns as soon as the run record exists; the
/// steps execute in the background.
async fn execute_chain(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ExecuteChainRequest>,
) -> ApiResult<(StatusCode, Json<RunReceipt>)> {
    let receipt = state
        .executor
        .execute_chain(id, payload.trigger_data)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

async fn list_runs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<ListRunsQuery>,
) -> ApiResult<Json<RunListResponse>> {
    // 404 for a chain that never existed, rather than an empty page.
    if state.chains.get_chain(id).await?.is_none() {
        return Err(ApiError::NotFound("chain not found".to_string()));
    }
    let (page, limit) = normalize_pagination(query.page, query.limit);

    let (runs, total) = state.chains.list_runs(id, (page - 1) * limit, limit).await?;

    Ok(Json(RunListResponse {
        runs,
        total,
        page,
        limit,
    }))
}

async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> ApiResult<Json<RunWithStepRuns>> {
    let run = state
        .chains
        .get_run(run_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("run not found".to_string()))?;
    Ok(Json(run))
}

fn normalize_pagination(page: Option<i64>, limit: Option<i64>) -> (i64, i64) {
    let page = page.filter(|p| *p >= 1).unwrap_or(1);
    let limit = limit.filter(|l| (1..=100).contains(l)).unwrap_or(10);
    (page, limit)
}
