//! Internal HTTP surface for the web application, plus the public health check.

pub mod conversations;
pub mod middleware;
pub mod notifications;
pub mod presence;

use std::sync::Arc;

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post},
};

use tvdesk_gateway::Dispatcher;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub dispatcher: Dispatcher,
    /// Bearer key the web application presents on `/internal/*`.
    pub internal_key: String,
}

pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/health", get(presence::health))
        .with_state(state.clone());

    let internal_routes = Router::new()
        .route("/internal/notifications", post(notifications::dispatch))
        .route("/internal/conversations/{conversation_id}/sync", post(conversations::sync))
        .route("/internal/presence", get(presence::online))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::require_internal_key,
        ))
        .with_state(state);

    Router::new().merge(public_routes).merge(internal_routes)
}
