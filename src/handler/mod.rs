use crate::app::AppState;
use axum::Router;

pub mod action;
pub mod calls;
pub mod otp;
pub mod trunks;
pub mod ws;

pub fn router() -> Router<AppState> {
    trunks::router()
        .merge(calls::router())
        .merge(action::router())
        .merge(otp::router())
        .merge(ws::router())
}
