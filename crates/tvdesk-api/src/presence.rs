use axum::{Json, extract::State};

use tvdesk_types::api::HealthResponse;
use tvdesk_types::models::Identity;

use crate::AppState;

pub async fn online(State(state): State<AppState>) -> Json<Vec<Identity>> {
    Json(state.dispatcher.online_users().await)
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        connections: state.dispatcher.connection_count().await,
    })
}
