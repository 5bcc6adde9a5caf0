use axum::{
    extract::{Path, State},
    http::StatusCode,
};
use tracing::error;

use crate::AppState;

/// Re-broadcast a conversation to its room after an edit made over HTTP.
pub async fn sync(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> Result<StatusCode, StatusCode> {
    match state.dispatcher.sync_conversation(&conversation_id).await {
        Ok(true) => Ok(StatusCode::NO_CONTENT),
        Ok(false) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            error!("Resync of {} failed: {}", conversation_id, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
