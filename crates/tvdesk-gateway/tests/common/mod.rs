#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tvdesk_db::Database;
use tvdesk_gateway::{ConnectionHandle, Dispatcher, GatewayConfig, SqliteStore};
use tvdesk_types::api::Handshake;
use tvdesk_types::events::ServerEvent;
use tvdesk_types::models::Role;

pub const JWT_SECRET: &str = "integration-test-secret";

/// Customers `u1` (fr) and `u2`, admin `a1`. `c1` belongs to `u1`, `c2` to `u2`.
pub fn seeded_db() -> Arc<Database> {
    let db = Database::open_in_memory().unwrap();
    db.create_user("u1", "Ana", "ana@example.com", Role::User, "fr").unwrap();
    db.create_user("u2", "Ben", "ben@example.com", Role::User, "en").unwrap();
    db.create_user("a1", "Support", "support@example.com", Role::Admin, "en").unwrap();
    db.create_conversation("c1", "u1", Some("Buffering on channel 4")).unwrap();
    db.create_conversation("c2", "u2", None).unwrap();
    Arc::new(db)
}

pub fn config() -> GatewayConfig {
    GatewayConfig {
        jwt_secret: JWT_SECRET.to_string(),
        trust_handshake: true,
        ..GatewayConfig::default()
    }
}

pub fn dispatcher(db: &Arc<Database>) -> Dispatcher {
    Dispatcher::new(config(), Arc::new(SqliteStore::new(db.clone())))
}

pub fn user(user_id: &str, name: &str) -> Handshake {
    Handshake {
        user_id: Some(user_id.to_string()),
        role: Some("user".to_string()),
        name: Some(name.to_string()),
        ..Handshake::default()
    }
}

pub fn admin(user_id: &str, name: &str) -> Handshake {
    Handshake {
        role: Some("admin".to_string()),
        ..user(user_id, name)
    }
}

pub fn guest() -> Handshake {
    Handshake::default()
}

pub fn named<'a>(events: &'a [ServerEvent], name: &str) -> Vec<&'a ServerEvent> {
    events.iter().filter(|e| e.name() == name).collect()
}

/// Wait for the next event with the given name, skipping others.
pub async fn next_named(handle: &mut ConnectionHandle, name: &str) -> ServerEvent {
    let wait = async {
        loop {
            match handle.recv().await {
                Some(event) if event.name() == name => return event,
                Some(_) => continue,
                None => panic!("connection closed while waiting for {name}"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {name}"))
}

/// Unread pushes in a batch as `(room, count)`; `None` is the global total.
pub fn unread_updates(events: &[ServerEvent]) -> Vec<(Option<String>, u32)> {
    events
        .iter()
        .filter_map(|e| match e {
            ServerEvent::UnreadCountUpdate { room_id, total } => Some((room_id.clone(), *total)),
            _ => None,
        })
        .collect()
}
