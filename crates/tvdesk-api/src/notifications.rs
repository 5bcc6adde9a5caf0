use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use tracing::debug;

use tvdesk_types::api::{DispatchAccepted, DispatchNotificationRequest};

use crate::AppState;

/// Queue a notification. Answers before delivery; failures only reach the log.
pub async fn dispatch(
    State(state): State<AppState>,
    Json(req): Json<DispatchNotificationRequest>,
) -> impl IntoResponse {
    debug!("Internal dispatch of {} to {:?}", req.kind.as_str(), req.scope);
    let _ = state.dispatcher.dispatch_notification(req);
    (StatusCode::ACCEPTED, Json(DispatchAccepted { accepted: true }))
}
