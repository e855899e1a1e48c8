//! Trunk assignment endpoints and the trunk-management proxy.

use crate::app::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

const TRUNK_MGMT_PORT: u16 = 56201;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/trunks/assign", post(assign))
        .route("/api/trunks/release", post(release))
        .route("/trunk/add", post(add_trunk))
        .route("/trunk/delete/{trunk_id}", delete(delete_trunk))
        .route("/trunk/list", get(list_trunks))
}

#[derive(Debug, Deserialize)]
struct AssignRequest {
    user_token: Option<String>,
}

async fn assign(
    State(state): State<AppState>,
    Json(body): Json<AssignRequest>,
) -> impl IntoResponse {
    let Some(user_token) = body.user_token.filter(|t| !t.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"success": false, "error": "user_token is required"})),
        );
    };
    match state.trunks.assign(&user_token) {
        Ok(assignment) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "assignment_uuid": assignment.assignment_id,
                "trunk_name": assignment.trunk_id,
            })),
        ),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(json!({"success": false, "error": e.to_string()})),
        ),
    }
}

#[derive(Debug, Deserialize)]
struct ReleaseRequest {
    assignment_uuid: Option<String>,
}

async fn release(
    State(state): State<AppState>,
    Json(body): Json<ReleaseRequest>,
) -> impl IntoResponse {
    let Some(assignment_uuid) = body.assignment_uuid.filter(|t| !t.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"success": false, "error": "assignment_uuid is required"})),
        );
    };
    match state.trunks.release(&assignment_uuid) {
        Ok(()) => (StatusCode::OK, Json(json!({"success": true}))),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(json!({"success": false, "error": e.to_string()})),
        ),
    }
}

#[derive(Debug, Deserialize)]
struct AddTrunkRequest {
    ip_server: String,
    sip_username: String,
    sip_password: String,
    sip_server_url: String,
    #[serde(rename = "type")]
    kind: Option<String>,
}

async fn add_trunk(
    State(state): State<AppState>,
    Json(body): Json<AddTrunkRequest>,
) -> impl IntoResponse {
    let url = format!("http://{}:{}/add-trunk", body.ip_server, TRUNK_MGMT_PORT);
    let payload = json!({
        "username": body.sip_username,
        "password": body.sip_password,
        "server": body.sip_server_url,
        "type": body.kind,
    });
    proxy_response(state.http.post(&url).json(&payload).send().await).await
}

#[derive(Debug, Deserialize)]
struct DeleteTrunkRequest {
    ip_server: String,
}

async fn delete_trunk(
    State(state): State<AppState>,
    Path(trunk_id): Path<String>,
    Json(body): Json<DeleteTrunkRequest>,
) -> impl IntoResponse {
    let url = format!(
        "http://{}:{}/delete-trunk/{}",
        body.ip_server, TRUNK_MGMT_PORT, trunk_id
    );
    proxy_response(state.http.delete(&url).send().await).await
}

async fn proxy_response(
    result: reqwest::Result<reqwest::Response>,
) -> (StatusCode, Json<Value>) {
    match result {
        Ok(response) => {
            let status = StatusCode::from_u16(response.status().as_u16())
                .unwrap_or(StatusCode::BAD_GATEWAY);
            let body = response
                .json::<Value>()
                .await
                .unwrap_or_else(|_| json!({"success": status.is_success()}));
            (status, Json(body))
        }
        Err(e) => {
            warn!("trunk management proxy failed: {}", e);
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({"success": false, "error": e.to_string()})),
            )
        }
    }
}

async fn list_trunks(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.trunks.stats())
}
