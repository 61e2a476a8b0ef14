use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde_json::json;
use tracing::info;

use crate::{
    auth::verify_bearer,
    error::{ApiError, PipelineError},
    models::{
        ConnectorAccount, CreatePlanRequest, DataFolder, ListPlansQuery, PlanStatus,
        RunAcceptedResponse, RunPlanRequest, StaleEntriesQuery,
    },
    queue::PipelineJob,
    AppState,
};

const DEFAULT_STALE_LIMIT: usize = 100;
const MAX_STALE_LIMIT: usize = 1000;

pub async fn healthz() -> impl IntoResponse {
    Json(json!({ "ok": true, "timestamp": Utc::now() }))
}

pub async fn create_plan(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(workbook_id): Path<String>,
    Json(payload): Json<CreatePlanRequest>,
) -> Result<impl IntoResponse, ApiError> {
    verify_bearer(&headers, &state.config.api_key)?;

    let user_id = payload.user_id.trim();
    if user_id.is_empty() {
        return Err(ApiError::bad_request("userId is required."));
    }
    let connector_account_id = payload
        .connector_account_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty());

    let plan = state
        .pipeline
        .open_plan(&workbook_id, user_id, connector_account_id)?;
    let job = PipelineJob::Build {
        plan_id: plan.id.clone(),
    };
    if state.queue_tx.send(job).await.is_err() {
        return Err(ApiError::unavailable("Pipeline queue is unavailable."));
    }

    info!(plan_id = %plan.id, workbook_id = %workbook_id, "Publish plan queued for build");
    let info = state.pipeline.get(&plan.id)?;
    Ok((StatusCode::ACCEPTED, Json(info)))
}

pub async fn list_plans(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(workbook_id): Path<String>,
    Query(query): Query<ListPlansQuery>,
) -> Result<impl IntoResponse, ApiError> {
    verify_bearer(&headers, &state.config.api_key)?;
    let plans = state
        .pipeline
        .list(&workbook_id, query.connector_account_id.as_deref())?;
    Ok(Json(plans))
}

pub async fn get_plan(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(plan_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    verify_bearer(&headers, &state.config.api_key)?;
    Ok(Json(state.pipeline.get(&plan_id)?))
}

pub async fn list_entries(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(plan_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    verify_bearer(&headers, &state.config.api_key)?;
    Ok(Json(state.pipeline.entries(&plan_id)?))
}

pub async fn run_plan(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(plan_id): Path<String>,
    payload: Option<Json<RunPlanRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    verify_bearer(&headers, &state.config.api_key)?;
    let phase = payload.and_then(|Json(request)| request.phase);

    let info = state.pipeline.get(&plan_id)?;
    if info.plan.status == PlanStatus::Planning {
        return Err(anyhow::Error::new(PipelineError::InvalidPlanState {
            plan_id,
            action: "run",
            status: info.plan.status.as_str().to_string(),
        })
        .into());
    }

    let job = PipelineJob::Run {
        plan_id: plan_id.clone(),
        phase,
    };
    if state.queue_tx.send(job).await.is_err() {
        return Err(ApiError::unavailable("Pipeline queue is unavailable."));
    }

    info!(plan_id = %plan_id, phase = phase.map(|p| p.as_str()).unwrap_or("all"), "Publish run queued");
    let response = RunAcceptedResponse {
        plan_id,
        phase,
        status: info.plan.status,
        queued_at: Utc::now(),
    };
    Ok((StatusCode::ACCEPTED, Json(response)))
}

pub async fn put_data_folders(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(workbook_id): Path<String>,
    Json(folders): Json<Vec<DataFolder>>,
) -> Result<impl IntoResponse, ApiError> {
    verify_bearer(&headers, &state.config.api_key)?;

    let mut saved = Vec::with_capacity(folders.len());
    for mut folder in folders {
        if folder.id.trim().is_empty() {
            return Err(ApiError::bad_request("Every data folder needs an id."));
        }
        folder.workbook_id = workbook_id.clone();
        state.folders.upsert_folder(&folder)?;
        if let Some(stored) = state.folders.get_folder(&folder.id)? {
            saved.push(stored);
        }
    }

    info!(workbook_id = %workbook_id, folders = saved.len(), "Data folders registered");
    Ok(Json(saved))
}

pub async fn delete_data_folder(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((workbook_id, folder_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    verify_bearer(&headers, &state.config.api_key)?;

    let Some(folder) = state.folders.remove_folder(&workbook_id, &folder_id)? else {
        return Err(anyhow::Error::new(PipelineError::FolderNotFound(folder_id)).into());
    };
    let forgotten = state.file_index.delete_folder(&workbook_id, &folder.path)?;

    info!(workbook_id = %workbook_id, folder_id = %folder.id, forgotten, "Data folder removed");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn put_connector_account(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(account): Json<ConnectorAccount>,
) -> Result<impl IntoResponse, ApiError> {
    verify_bearer(&headers, &state.config.api_key)?;

    if account.id.trim().is_empty() || account.base_url.trim().is_empty() {
        return Err(ApiError::bad_request("Connector accounts need an id and a baseUrl."));
    }
    state.folders.upsert_account(&account)?;
    let stored = state
        .folders
        .get_account(&account.id)?
        .ok_or_else(|| PipelineError::ConnectorAccountNotFound(account.id.clone()))
        .map_err(anyhow::Error::new)?;

    info!(connector_account_id = %stored.id, service = %stored.service, "Connector account registered");
    Ok(Json(stored))
}

pub async fn stale_file_index_entries(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<StaleEntriesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    verify_bearer(&headers, &state.config.api_key)?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_STALE_LIMIT)
        .clamp(1, MAX_STALE_LIMIT);
    Ok(Json(state.file_index.find_stale_entries(query.before, limit)?))
}
