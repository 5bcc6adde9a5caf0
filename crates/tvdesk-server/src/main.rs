mod config;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade, rejection::QueryRejection},
    response::IntoResponse,
    routing::get,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use tvdesk_api::AppStateInner;
use tvdesk_gateway::connection;
use tvdesk_gateway::{Dispatcher, SqliteStore};
use tvdesk_types::api::Handshake;

use crate::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tvdesk=debug,tower_http=debug".into()),
        )
        .init();

    let config = ServerConfig::from_env()?;
    if config.gateway.trust_handshake {
        warn!("TVDESK_TRUST_HANDSHAKE is on: raw userId/role handshakes are accepted");
    }

    // Init database
    let db = Arc::new(tvdesk_db::Database::open(&config.db_path)?);

    // Shared state
    let store = Arc::new(SqliteStore::new(db));
    let dispatcher = Dispatcher::new(config.gateway.clone(), store);
    let app_state = Arc::new(AppStateInner {
        dispatcher: dispatcher.clone(),
        internal_key: config.internal_key.clone(),
    });

    // Routes
    let ws_route = Router::new()
        .route("/socket", get(ws_upgrade))
        .with_state(dispatcher);

    let app = Router::new()
        .merge(tvdesk_api::router(app_state))
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("tvdesk listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn ws_upgrade(
    State(dispatcher): State<Dispatcher>,
    query: Result<Query<Handshake>, QueryRejection>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let handshake = handshake_or_guest(query);
    ws.on_upgrade(move |socket| connection::handle_socket(socket, dispatcher, handshake))
}

/// A handshake that doesn't parse connects as a guest instead of failing the upgrade.
fn handshake_or_guest(query: Result<Query<Handshake>, QueryRejection>) -> Handshake {
    match query {
        Ok(Query(handshake)) => handshake,
        Err(e) => {
            warn!("Unreadable socket handshake, connecting as guest: {}", e);
            Handshake::default()
        }
    }
}
