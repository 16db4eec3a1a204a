//! REST management API for preset queues and bypass configuration.

use std::collections::BTreeMap;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Local;
use mockgate_core::ControlEvent;
use mockgate_store::validate::{
    validate_array_elements, validate_import_array, validate_response_object, MAX_IMPORT_BYTES,
};
use mockgate_store::{BypassConfigUpdate, BypassConfigView, PresetItem};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::control::DEFAULT_STATUS_CODE;
use crate::error::ApiError;
use crate::server::AppState;

pub fn preset_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/api/preset-queue",
            get(get_all_queues).delete(clear_all_queues),
        )
        .route("/api/preset-queue/export", get(export_all_queues))
        .route(
            "/api/preset-queue/{ip}",
            get(get_queue).post(add_response).delete(clear_queue),
        )
        .route("/api/preset-queue/{ip}/batch", post(batch_add))
        .route(
            "/api/preset-queue/{ip}/import",
            // One byte over the limit so oversized payloads reach validation.
            post(import_queue).layer(DefaultBodyLimit::max(MAX_IMPORT_BYTES + 1)),
        )
        .route("/api/preset-queue/{ip}/export", get(export_queue))
        .route("/api/preset-queue/{ip}/{response_id}", delete(delete_response))
}

pub fn bypass_routes() -> Router<AppState> {
    Router::new()
        .route("/api/bypass/config", get(get_bypass_config).put(update_bypass_config))
        .route("/api/bypass/enable", post(enable_bypass))
        .route("/api/bypass/disable", post(disable_bypass))
}

#[derive(Serialize)]
struct QueueView {
    count: usize,
    items: Vec<PresetItem>,
}

#[derive(Serialize)]
struct ItemError {
    index: usize,
    error: String,
}

fn item_errors(errors: Vec<(usize, String)>) -> Vec<ItemError> {
    errors
        .into_iter()
        .map(|(index, error)| ItemError { index, error })
        .collect()
}

fn default_status() -> u16 {
    DEFAULT_STATUS_CODE
}

fn check_status(code: u16) -> Result<(), ApiError> {
    if (100..=999).contains(&code) {
        Ok(())
    } else {
        Err(ApiError::BadRequest(format!(
            "status_code must be 100-999, got {code}"
        )))
    }
}

#[derive(Deserialize)]
struct AddResponseBody {
    response: Value,
    #[serde(default = "default_status")]
    status_code: u16,
}

#[derive(Deserialize)]
struct BatchAddBody {
    responses: Vec<Value>,
    #[serde(default = "default_status")]
    status_code: u16,
}

async fn get_all_queues(State(state): State<AppState>) -> Json<Value> {
    let queues: BTreeMap<String, QueueView> = state
        .handler_state
        .presets
        .get_all_queues()
        .into_iter()
        .map(|(ip, items)| {
            let view = QueueView {
                count: items.len(),
                items,
            };
            (ip, view)
        })
        .collect();
    Json(json!({ "queues": queues }))
}

async fn get_queue(State(state): State<AppState>, Path(ip): Path<String>) -> Json<Value> {
    let items = state.handler_state.presets.get_queue(&ip);
    Json(json!({ "ip": ip, "count": items.len(), "items": items }))
}

async fn add_response(
    State(state): State<AppState>,
    Path(ip): Path<String>,
    Json(req): Json<AddResponseBody>,
) -> Result<Json<Value>, ApiError> {
    validate_response_object(&req.response)?;
    check_status(req.status_code)?;

    let hs = &state.handler_state;
    let id = hs.presets.add_response(&ip, req.response, req.status_code);
    hs.broadcast(&ControlEvent::QueueUpdated { ip: ip.clone() });

    Ok(Json(json!({
        "success": true,
        "response_id": id,
        "queue_length": hs.presets.queue_length(&ip),
    })))
}

async fn batch_add(
    State(state): State<AppState>,
    Path(ip): Path<String>,
    Json(req): Json<BatchAddBody>,
) -> Result<Json<Value>, ApiError> {
    check_status(req.status_code)?;
    let hs = &state.handler_state;
    let errors = validate_array_elements(&req.responses);

    let mut added = 0;
    for response in req.responses.into_iter().filter(Value::is_object) {
        hs.presets.add_response(&ip, response, req.status_code);
        added += 1;
    }
    hs.broadcast(&ControlEvent::QueueUpdated { ip: ip.clone() });

    Ok(Json(json!({
        "success": true,
        "added_count": added,
        "failed_count": errors.len(),
        "errors": item_errors(errors),
        "queue_length": hs.presets.queue_length(&ip),
    })))
}

/// Body is the raw JSON array (the contents of an exported file).
async fn import_queue(
    State(state): State<AppState>,
    Path(ip): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let items = validate_import_array(&body)?;
    let errors = validate_array_elements(&items);
    let total = items.len();

    let hs = &state.handler_state;
    let mut added = 0;
    for response in items.into_iter().filter(Value::is_object) {
        hs.presets.add_response(&ip, response, DEFAULT_STATUS_CODE);
        added += 1;
    }
    hs.broadcast(&ControlEvent::QueueUpdated { ip: ip.clone() });
    tracing::info!(ip = %ip, total, added, "Imported preset responses");

    Ok(Json(json!({
        "success": true,
        "total": total,
        "added_count": added,
        "failed_count": errors.len(),
        "errors": item_errors(errors),
    })))
}

async fn export_queue(
    State(state): State<AppState>,
    Path(ip): Path<String>,
) -> Result<Response, ApiError> {
    let items = state.handler_state.presets.get_queue(&ip);
    if items.is_empty() {
        return Err(ApiError::NotFound(format!(
            "queue for {ip} does not exist or is empty"
        )));
    }
    let responses: Vec<Value> = items.into_iter().map(|item| item.response).collect();
    let filename = format!("queue_{ip}_{}.json", Local::now().format("%Y%m%d_%H%M%S"));
    attachment(&Value::Array(responses), &filename)
}

async fn export_all_queues(State(state): State<AppState>) -> Result<Response, ApiError> {
    let all = state.handler_state.presets.get_all_queues();
    if all.is_empty() {
        return Err(ApiError::NotFound("no queues to export".into()));
    }
    let export: BTreeMap<String, Vec<Value>> = all
        .into_iter()
        .map(|(ip, items)| (ip, items.into_iter().map(|item| item.response).collect()))
        .collect();
    let filename = format!("queue_all_{}.json", Local::now().format("%Y%m%d_%H%M%S"));
    let value = serde_json::to_value(export).map_err(|e| ApiError::Internal(e.to_string()))?;
    attachment(&value, &filename)
}

fn attachment(value: &Value, filename: &str) -> Result<Response, ApiError> {
    let body = serde_json::to_string_pretty(value).map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/json".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename={filename}"),
            ),
        ],
        body,
    )
        .into_response())
}

async fn delete_response(
    State(state): State<AppState>,
    Path((ip, response_id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let hs = &state.handler_state;
    if !hs.presets.delete_response(&ip, &response_id) {
        return Err(ApiError::NotFound("response not found".into()));
    }
    hs.broadcast(&ControlEvent::QueueUpdated { ip });
    Ok(Json(json!({ "success": true })))
}

async fn clear_queue(
    State(state): State<AppState>,
    Path(ip): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let hs = &state.handler_state;
    if !hs.presets.clear_queue(&ip) {
        return Err(ApiError::NotFound("queue not found".into()));
    }
    hs.broadcast(&ControlEvent::QueueUpdated { ip });
    Ok(Json(json!({ "success": true })))
}

async fn clear_all_queues(State(state): State<AppState>) -> Json<Value> {
    let hs = &state.handler_state;
    hs.presets.clear_all();
    hs.broadcast(&ControlEvent::AllQueuesUpdated);
    Json(json!({ "success": true }))
}

async fn get_bypass_config(State(state): State<AppState>) -> Json<BypassConfigView> {
    Json(state.handler_state.bypass.get().view())
}

async fn update_bypass_config(
    State(state): State<AppState>,
    Json(update): Json<BypassConfigUpdate>,
) -> Result<Json<BypassConfigView>, ApiError> {
    let hs = &state.handler_state;
    let config = hs.bypass.update(update)?;
    hs.broadcast(&ControlEvent::BypassConfigUpdated);
    Ok(Json(config.view()))
}

async fn enable_bypass(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let hs = &state.handler_state;
    hs.bypass.enable()?;
    hs.broadcast(&ControlEvent::BypassConfigUpdated);
    Ok(Json(json!({ "enabled": true })))
}

async fn disable_bypass(State(state): State<AppState>) -> Json<Value> {
    let hs = &state.handler_state;
    hs.bypass.disable();
    hs.broadcast(&ControlEvent::BypassConfigUpdated);
    Json(json!({ "enabled": false }))
}
