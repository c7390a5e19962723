use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::warn;

use crate::application::error::HttpError;
use crate::cache::{ClearReport, ContentEvent, StoreError};

use super::AdminState;

const SOURCE: &str = "infra::http::admin::events";

#[derive(Debug, Serialize)]
struct ClearResponse {
    cause: &'static str,
    removed: usize,
    failed: usize,
}

pub(super) async fn content_event(
    State(state): State<AdminState>,
    Json(event): Json<ContentEvent>,
) -> Response {
    if let Some(watermarks) = state.watermarks.as_ref()
        && let Err(err) = watermarks.touch_content().await
    {
        warn!(
            target = "quire::http::admin",
            event = event.as_str(),
            error = %err,
            "Failed to advance content watermark"
        );
    }

    clear_response(event.as_str(), state.coordinator.on_content_changed(event).await)
}

pub(super) async fn purge(State(state): State<AdminState>) -> Response {
    clear_response("manual_purge", state.coordinator.purge().await)
}

fn clear_response(cause: &'static str, result: Result<ClearReport, StoreError>) -> Response {
    match result {
        Ok(report) => (
            StatusCode::OK,
            Json(ClearResponse {
                cause,
                removed: report.removed,
                failed: report.failed,
            }),
        )
            .into_response(),
        Err(err) => HttpError::from_error(
            SOURCE,
            StatusCode::INTERNAL_SERVER_ERROR,
            "Cache clear failed",
            &err,
        )
        .into_response(),
    }
}
