//! HTTP control plane.
//!
//! Everything is JSON. Any request body that cannot become a valid
//! [`DataRequest`] is answered with 422, whether the JSON is malformed, a
//! field is missing, or validation fails, and no transfer is created.

use crate::models::DataRequest;
use crate::transfer::TransferManager;
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use std::time::Instant;

/// Shared state for web handlers
#[derive(Clone)]
pub struct WebState {
    pub manager: Arc<TransferManager>,
    pub start_time: Instant,
}

impl WebState {
    pub fn new(manager: Arc<TransferManager>) -> Self {
        Self {
            manager,
            start_time: Instant::now(),
        }
    }
}

pub fn router(state: WebState) -> Router {
    Router::new()
        .route("/", get(serve_root))
        .route("/health", get(handle_health))
        .route("/transfers", get(list_transfers))
        .route("/transfers/new", post(new_transfer))
        .route("/transfers/delete/{id}", post(delete_transfer))
        .route("/transfers/{id}", get(get_transfer).delete(delete_transfer))
        .route("/transfers/{id}/info", get(transfer_info))
        .with_state(state)
}

/// Serve root discovery endpoint
async fn serve_root() -> impl IntoResponse {
    Json(serde_json::json!({
        "name": "lclstream",
        "version": env!("CARGO_PKG_VERSION"),
        "links": {
            "health": "/health",
            "transfers": "/transfers",
            "new_transfer": "/transfers/new",
            "transfer": "/transfers/{id}",
            "transfer_info": "/transfers/{id}/info",
            "delete_transfer": "/transfers/delete/{id}",
        }
    }))
}

async fn handle_health(State(state): State<WebState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
        "transfers": state.manager.counts(),
    }))
}

fn unprocessable(message: String) -> Response {
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Json("not found")).into_response()
}

async fn new_transfer(
    State(state): State<WebState>,
    payload: Result<Json<DataRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            tracing::debug!("rejected transfer request: {}", rejection.body_text());
            return unprocessable(rejection.body_text());
        }
    };

    match state.manager.create(request) {
        Ok(id) => Json(id).into_response(),
        Err(e) => {
            tracing::debug!("rejected transfer request: {}", e);
            unprocessable(e.to_string())
        }
    }
}

async fn list_transfers(State(state): State<WebState>) -> Json<Vec<DataRequest>> {
    Json(state.manager.list())
}

async fn get_transfer(State(state): State<WebState>, Path(id): Path<u64>) -> Response {
    match state.manager.get(id) {
        Some(transfer_state) => Json(transfer_state).into_response(),
        None => not_found(),
    }
}

async fn transfer_info(State(state): State<WebState>, Path(id): Path<u64>) -> Response {
    match state.manager.info(id) {
        Some(info) => Json(info).into_response(),
        None => not_found(),
    }
}

async fn delete_transfer(State(state): State<WebState>, Path(id): Path<u64>) -> Json<bool> {
    Json(state.manager.delete(id))
}
