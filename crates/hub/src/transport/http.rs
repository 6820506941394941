// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Thin JSON handlers over the session manager and executor registry.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use roost_core::epoch_ms;
use roost_core::record::{ExecutorKeyRecord, SessionMode};

use crate::error::ErrorCode;
use crate::manager::{CreateParams, JobParams};
use crate::registry::hash_token;
use crate::transport::{auth, AppState};

/// Config keys the UI may persist; everything else is rejected on write.
const CONFIG_KEYS: &[&str] =
    &["theme", "mode", "font", "richFont", "fontSize", "showHints", "shortcuts", "forkHooks"];

fn owner_or_401(state: &AppState, headers: &HeaderMap) -> Result<String, Response> {
    auth::resolve_owner(&state.config, headers, None)
        .map_err(|code| code.to_http_response("unauthorized").into_response())
}

/// `GET /api/health`
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let executor_count = state
        .manager
        .store()
        .list_executors()
        .map(|e| e.len())
        .unwrap_or_default();
    Json(serde_json::json!({
        "status": "running",
        "version": env!("CARGO_PKG_VERSION"),
        "executor_count": executor_count,
    }))
}

// -- sessions -----------------------------------------------------------------

/// `GET /api/sessions`
pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let owner = match owner_or_401(&state, &headers) {
        Ok(o) => o,
        Err(resp) => return resp,
    };
    match state.manager.list(&owner).await {
        Ok(views) => Json(views).into_response(),
        Err(e) => e.to_http_response().into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateBody {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub executor: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
}

/// `POST /api/sessions`: 201 on success.
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateBody>,
) -> Response {
    let owner = match owner_or_401(&state, &headers) {
        Ok(o) => o,
        Err(resp) => return resp,
    };
    let mode = match body.mode.as_deref() {
        None => None,
        Some(m) => match SessionMode::from_str(m) {
            Ok(mode) => Some(mode),
            Err(_) => {
                return ErrorCode::BadRequest
                    .to_http_response(format!("unknown mode '{m}'"))
                    .into_response()
            }
        },
    };
    let params = CreateParams {
        description: body.description,
        command: body.command,
        executor_id: body.executor,
        mode,
    };
    match state.manager.create(params, &owner).await {
        Ok(view) => (StatusCode::CREATED, Json(view)).into_response(),
        Err(e) => e.to_http_response().into_response(),
    }
}

/// `DELETE /api/sessions/{name}`: 204 on success, 404 if not owned.
pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Response {
    let owner = match owner_or_401(&state, &headers) {
        Ok(o) => o,
        Err(resp) => return resp,
    };
    match state.manager.delete(&name, &owner).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => e.to_http_response().into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct ForkBody {
    pub source: Option<String>,
}

/// `POST /api/sessions/fork`: 201, or 400 when the source is missing or unknown.
pub async fn fork_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ForkBody>,
) -> Response {
    let owner = match owner_or_401(&state, &headers) {
        Ok(o) => o,
        Err(resp) => return resp,
    };
    let Some(source) = body.source.filter(|s| !s.is_empty()) else {
        return ErrorCode::BadRequest.to_http_response("source is required").into_response();
    };
    match state.manager.fork(&source, &owner).await {
        Ok(view) => (StatusCode::CREATED, Json(view)).into_response(),
        Err(e) if e.code == ErrorCode::NotFound => ErrorCode::BadRequest
            .to_http_response(format!("unknown source '{source}'"))
            .into_response(),
        Err(e) => e.to_http_response().into_response(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobBody {
    pub prompt: Option<String>,
    #[serde(default)]
    pub max_iterations: Option<u32>,
    #[serde(default)]
    pub executor: Option<String>,
    #[serde(default)]
    pub skip_permissions: Option<bool>,
}

/// `POST /api/sessions/job`: 201.
pub async fn create_job(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<JobBody>,
) -> Response {
    let owner = match owner_or_401(&state, &headers) {
        Ok(o) => o,
        Err(resp) => return resp,
    };
    let Some(prompt) = body.prompt.filter(|p| !p.is_empty()) else {
        return ErrorCode::BadRequest.to_http_response("prompt is required").into_response();
    };
    let params = JobParams {
        prompt,
        max_iterations: body.max_iterations,
        executor_id: body.executor,
        skip_permissions: body.skip_permissions.unwrap_or(false),
    };
    match state.manager.create_job(params, &owner).await {
        Ok(view) => (StatusCode::CREATED, Json(view)).into_response(),
        Err(e) => e.to_http_response().into_response(),
    }
}

/// `GET /api/sessions/{name}/snapshot`
pub async fn snapshot_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Response {
    let owner = match owner_or_401(&state, &headers) {
        Ok(o) => o,
        Err(resp) => return resp,
    };
    match state.manager.snapshot(&name, &owner).await {
        Ok(text) => Json(serde_json::json!({ "text": text })).into_response(),
        Err(e) => e.to_http_response().into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct SummarizeBody {
    pub description: Option<String>,
}

/// `POST /api/sessions/{name}/summarize`
pub async fn summarize_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Json(body): Json<SummarizeBody>,
) -> Response {
    let owner = match owner_or_401(&state, &headers) {
        Ok(o) => o,
        Err(resp) => return resp,
    };
    let Some(description) = body.description else {
        return ErrorCode::BadRequest.to_http_response("description is required").into_response();
    };
    match state.manager.summarize(&name, &owner, &description) {
        Ok(()) => Json(serde_json::json!({ "description": description })).into_response(),
        Err(e) => e.to_http_response().into_response(),
    }
}

/// `GET /api/sessions/{name}/diagnose`: remote rich sessions only.
pub async fn diagnose_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Response {
    let owner = match owner_or_401(&state, &headers) {
        Ok(o) => o,
        Err(resp) => return resp,
    };
    match state.manager.diagnose(&name, &owner).await {
        Ok(data) => Json(data).into_response(),
        Err(e) => e.to_http_response().into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct ReorderBody {
    pub names: Option<serde_json::Value>,
}

/// `PUT /api/sessions/reorder`: 400 on anything but an array of strings.
pub async fn reorder_sessions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ReorderBody>,
) -> Response {
    let owner = match owner_or_401(&state, &headers) {
        Ok(o) => o,
        Err(resp) => return resp,
    };
    let names: Vec<String> = match body.names {
        Some(serde_json::Value::Array(items)) => {
            let mut names = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    serde_json::Value::String(s) => names.push(s),
                    _ => {
                        return ErrorCode::BadRequest
                            .to_http_response("names must be an array of strings")
                            .into_response()
                    }
                }
            }
            names
        }
        _ => {
            return ErrorCode::BadRequest
                .to_http_response("names must be an array of strings")
                .into_response()
        }
    };
    match state.manager.reorder(&names, &owner) {
        Ok(()) => Json(serde_json::json!({ "ok": true })).into_response(),
        Err(e) => e.to_http_response().into_response(),
    }
}

// -- config -------------------------------------------------------------------

/// `GET /api/config`
pub async fn get_config(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let owner = match owner_or_401(&state, &headers) {
        Ok(o) => o,
        Err(resp) => return resp,
    };
    match state.manager.store().get_all_config(&owner) {
        Ok(map) => Json(map).into_response(),
        Err(e) => ErrorCode::Internal.to_http_response(format!("{e}")).into_response(),
    }
}

/// `PUT /api/config`: rejects unknown keys with 400 and returns the merged map.
pub async fn put_config(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<BTreeMap<String, String>>,
) -> Response {
    let owner = match owner_or_401(&state, &headers) {
        Ok(o) => o,
        Err(resp) => return resp,
    };
    for key in body.keys() {
        if !CONFIG_KEYS.contains(&key.as_str()) {
            return ErrorCode::BadRequest
                .to_http_response(format!("unknown config key '{key}'"))
                .into_response();
        }
    }
    for (key, value) in &body {
        if let Err(e) = state.manager.store().set_config(&owner, key, value) {
            return ErrorCode::Internal.to_http_response(format!("{e}")).into_response();
        }
    }
    match state.manager.store().get_all_config(&owner) {
        Ok(map) => Json(map).into_response(),
        Err(e) => ErrorCode::Internal.to_http_response(format!("{e}")).into_response(),
    }
}

// -- executors ----------------------------------------------------------------

/// `GET /api/executors`
pub async fn list_executors(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = owner_or_401(&state, &headers) {
        return resp;
    }
    match state.manager.list_executors().await {
        Ok(views) => Json(views).into_response(),
        Err(e) => e.to_http_response().into_response(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeBody {
    #[serde(default)]
    pub executor_id: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// `POST /api/executors/upgrade`: one executor, or all when unspecified.
pub async fn upgrade_executors(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<UpgradeBody>,
) -> Response {
    if let Err(resp) = owner_or_401(&state, &headers) {
        return resp;
    }
    match body.executor_id {
        Some(id) => match state.registry.upgrade_executor(&id, body.reason).await {
            Ok(()) => Json(serde_json::json!({ "contacted": [id] })).into_response(),
            Err(e) => e.to_http_response().into_response(),
        },
        None => {
            let contacted = state.registry.upgrade_all_executors(body.reason).await;
            Json(serde_json::json!({ "contacted": contacted })).into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    pub since: Option<u64>,
}

/// `GET /api/executors/logs?since=<micros>`
pub async fn executor_logs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<LogsQuery>,
) -> Response {
    if let Err(resp) = owner_or_401(&state, &headers) {
        return resp;
    }
    let entries = state.registry.logs_since(query.since.unwrap_or(0));
    Json(entries).into_response()
}

// -- executor keys ------------------------------------------------------------

/// `GET /api/executor-keys`
pub async fn list_keys(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let owner = match owner_or_401(&state, &headers) {
        Ok(o) => o,
        Err(resp) => return resp,
    };
    match state.manager.store().list_keys(&owner) {
        Ok(keys) => Json(keys).into_response(),
        Err(e) => ErrorCode::Internal.to_http_response(format!("{e}")).into_response(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateKeyBody {
    pub name: Option<String>,
    #[serde(default)]
    pub expires_at: Option<u64>,
}

/// `POST /api/executor-keys`: returns the one-time token.
pub async fn create_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateKeyBody>,
) -> Response {
    let owner = match owner_or_401(&state, &headers) {
        Ok(o) => o,
        Err(resp) => return resp,
    };
    let Some(name) = body.name.filter(|n| !n.is_empty()) else {
        return ErrorCode::BadRequest.to_http_response("name is required").into_response();
    };

    let token = format!("rk_{}", uuid::Uuid::new_v4().simple());
    let record = ExecutorKeyRecord {
        id: uuid::Uuid::new_v4().to_string(),
        owner_id: owner,
        name,
        prefix: token.chars().take(8).collect(),
        hashed_token: hash_token(&token),
        created_at: epoch_ms(),
        expires_at: body.expires_at,
    };
    if let Err(e) = state.manager.store().create_key(&record) {
        return ErrorCode::Internal.to_http_response(format!("{e}")).into_response();
    }

    let mut out = serde_json::to_value(&record).unwrap_or_default();
    if let Some(obj) = out.as_object_mut() {
        obj.insert("token".to_owned(), serde_json::Value::String(token));
    }
    (StatusCode::CREATED, Json(out)).into_response()
}

/// `DELETE /api/executor-keys/{id}`: revoke.
pub async fn delete_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let owner = match owner_or_401(&state, &headers) {
        Ok(o) => o,
        Err(resp) => return resp,
    };
    match state.manager.store().delete_key(&owner, &id) {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => ErrorCode::NotFound.to_http_response("key not found").into_response(),
        Err(e) => ErrorCode::Internal.to_http_response(format!("{e}")).into_response(),
    }
}
