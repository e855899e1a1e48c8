//! Call origination and teardown endpoints.

use crate::app::AppState;
use crate::call::queue::OriginateJob;
use crate::channel::ChannelSession;
use crate::pbx::OriginateRequest;
use crate::Error;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/calls/create", post(create))
        .route("/api/calls/{id}/destroy", post(destroy))
        .route("/api/calls/queue/stats", get(queue_stats))
}

#[derive(Debug, Deserialize)]
struct CreateRequest {
    phone_number: Option<String>,
    campaign: Option<String>,
    assignment_uuid: Option<String>,
}

async fn create(
    State(state): State<AppState>,
    Json(body): Json<CreateRequest>,
) -> impl IntoResponse {
    let (Some(phone_number), Some(campaign), Some(assignment_uuid)) =
        (body.phone_number, body.campaign, body.assignment_uuid)
    else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "success": false,
                "error": "phone_number, campaign and assignment_uuid are required",
            })),
        );
    };

    // creating a call keeps the reservation alive
    let assignment = match state.trunks.keep_alive(&assignment_uuid) {
        Ok(assignment) => assignment,
        Err(e) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"success": false, "error": e.to_string()})),
            )
        }
    };
    let Some(from_number) = assignment.trunk.random_number() else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"success": false, "error": "trunk has no phone numbers"})),
        );
    };

    let trunk_id = assignment.trunk_id.clone();
    let request = OriginateRequest {
        trunk_id: trunk_id.clone(),
        phone_number,
        from_number,
    };
    let pbx = state.pbx.clone();
    let registry = state.registry.clone();
    let calls = state.calls.clone();
    let http = state.http.clone();
    let job: OriginateJob = Box::pin(async move {
        let channel_id = pbx.originate(request).await?;
        ChannelSession::create(&channel_id, pbx, registry, http);
        calls.save(&channel_id, "created", &campaign);
        Ok(channel_id)
    });

    match state.queue.enqueue(&trunk_id, job).await {
        Ok(call_id) => {
            info!(call_id, trunk_id, "call created");
            (
                StatusCode::OK,
                Json(json!({"success": true, "call_id": call_id})),
            )
        }
        Err(Error::QueueFull(trunk)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"success": false, "error": format!("queue full for trunk {}", trunk)})),
        ),
        Err(e) => {
            warn!(trunk_id, "origination failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"success": false, "error": e.to_string()})),
            )
        }
    }
}

async fn destroy(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.registry.get(&id) {
        Some(session) => {
            session.destroy().await;
            (StatusCode::OK, Json(json!({"success": true})))
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"success": false, "error": format!("call {} not found", id)})),
        ),
    }
}

async fn queue_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "queues": state.queue.stats(),
        "active_push": state.push.active_call_ids(),
        "active_channels": state.registry.len(),
    }))
}
