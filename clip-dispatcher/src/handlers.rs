//! Thin HTTP wiring over the dispatcher. Request validation, rate
//! limiting and auth live upstream; this just maps JSON to `submit` /
//! `job_status` and back.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tracing::error;

use crate::dispatch::{DispatchError, Dispatcher};
use clip_common::queue::JobOutcome;

#[derive(Deserialize)]
pub struct ProcessRequest {
    url: String,
    localization: Option<String>,
}

pub fn add_routes(router: Router, dispatcher: Arc<Dispatcher>) -> Router {
    router.merge(
        Router::new()
            .route("/process", post(process))
            .route("/status/:job_id", get(status))
            .with_state(dispatcher),
    )
}

async fn process(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(request): Json<ProcessRequest>,
) -> Response {
    let request_id = uuid::Uuid::now_v7().to_string();

    match dispatcher
        .submit(&request.url, request.localization.as_deref(), &request_id)
        .await
    {
        Ok(submitted) => Json(submitted).into_response(),
        Err(DispatchError::Validation(error)) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": error.to_string() })),
        )
            .into_response(),
        Err(error) => {
            error!("failed to dispatch request {}: {}", request_id, error);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "failed to process video" })),
            )
                .into_response()
        }
    }
}

async fn status(
    State(dispatcher): State<Arc<Dispatcher>>,
    Path(job_id): Path<String>,
) -> Response {
    match dispatcher.job_status(&job_id).await {
        Ok(JobOutcome::NotFound) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "status": "not_found" })),
        )
            .into_response(),
        Ok(outcome) => Json(outcome).into_response(),
        Err(error) => {
            error!("failed to read status for job {}: {}", job_id, error);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "failed to read job status" })),
            )
                .into_response()
        }
    }
}
