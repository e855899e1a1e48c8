//! The action-script endpoint the PBX control loop fetches from.

use crate::app::AppState;
use axum::{
    extract::{Path, Query, State},
    http::header,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/action/{status}", get(action))
        .route("/action/debug/campaigns", get(debug_campaigns))
        .route("/action/debug/reload", post(debug_reload))
}

#[derive(Debug, Deserialize)]
struct ActionQuery {
    uuid: Option<String>,
    #[serde(rename = "Digits")]
    digits: Option<String>,
}

/// Always 200 with XML; the PBX cannot interpret anything else mid-call.
async fn action(
    State(state): State<AppState>,
    Path(status): Path<String>,
    Query(query): Query<ActionQuery>,
) -> impl IntoResponse {
    let xml = state
        .engine
        .handle(&status, query.uuid.as_deref(), query.digits.as_deref());
    ([(header::CONTENT_TYPE, "application/xml")], xml)
}

async fn debug_campaigns(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.catalog.snapshot())
}

async fn debug_reload(State(state): State<AppState>) -> impl IntoResponse {
    match state.catalog.reload().await {
        Ok(count) => Json(json!({"success": true, "campaigns": count})),
        Err(e) => Json(json!({"success": false, "error": e.to_string()})),
    }
}
