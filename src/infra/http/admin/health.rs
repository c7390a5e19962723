use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::application::error::ErrorReport;

use super::AdminState;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    cache_entries: usize,
    cleanup_scheduled: bool,
}

pub(super) async fn admin_health(State(state): State<AdminState>) -> Response {
    match state.store.entry_count().await {
        Ok(cache_entries) => Json(HealthResponse {
            status: "ok",
            cache_entries,
            cleanup_scheduled: state.coordinator.is_cleanup_scheduled(),
        })
        .into_response(),
        Err(err) => {
            let mut response = StatusCode::SERVICE_UNAVAILABLE.into_response();
            ErrorReport::from_error(
                "infra::http::admin::health",
                StatusCode::SERVICE_UNAVAILABLE,
                &err,
            )
            .attach(&mut response);
            response
        }
    }
}
