//! Connection registry: every live socket and the identity bound to it.

use std::collections::{HashMap, HashSet};

use jsonwebtoken::{DecodingKey, Validation, decode};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use tvdesk_types::api::{Claims, Handshake};
use tvdesk_types::events::ServerEvent;
use tvdesk_types::models::{GUEST_PREFIX, Identity, Role, RoomId, is_guest_id};

use crate::config::GatewayConfig;

pub type ConnectionId = Uuid;

const GUEST_NAME_PREFIX: &str = "Guest ";

pub struct Connection {
    pub id: ConnectionId,
    pub identity: Identity,
    pub rooms: HashSet<RoomId>,
    /// Registration order, used for presence ordering.
    seq: u64,
    tx: mpsc::UnboundedSender<ServerEvent>,
}

impl Connection {
    /// Queue an event for this socket. Returns false if the socket is gone.
    pub fn send(&self, event: ServerEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, Connection>,
    next_seq: u64,
}

impl ConnectionRegistry {
    pub fn insert(&mut self, id: ConnectionId, identity: Identity, tx: mpsc::UnboundedSender<ServerEvent>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.connections.insert(
            id,
            Connection {
                id,
                identity,
                rooms: HashSet::new(),
                seq,
                tx,
            },
        );
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        self.connections.remove(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Connections in registration order.
    pub fn ordered(&self) -> Vec<&Connection> {
        let mut conns: Vec<&Connection> = self.connections.values().collect();
        conns.sort_by_key(|c| c.seq);
        conns
    }

    pub fn identities(&self) -> impl Iterator<Item = &Identity> {
        self.connections.values().map(|c| &c.identity)
    }

    pub fn has_user(&self, user_id: &str) -> bool {
        self.identities().any(|i| i.user_id == user_id)
    }

    pub fn has_admin(&self) -> bool {
        self.identities().any(|i| i.role.is_admin())
    }

    pub fn send_to(&self, id: ConnectionId, event: ServerEvent) {
        if let Some(conn) = self.connections.get(&id) {
            if !conn.send(event) {
                debug!("Dropped event for closing connection {}", id);
            }
        }
    }

    /// Send to every connection of one user. Returns how many sockets got it.
    pub fn send_to_user(&self, user_id: &str, event: &ServerEvent) -> usize {
        self.send_where(|i| i.user_id == user_id, event)
    }

    pub fn send_to_admins(&self, event: &ServerEvent) -> usize {
        self.send_where(|i| i.role.is_admin(), event)
    }

    pub fn broadcast(&self, event: &ServerEvent) -> usize {
        self.send_where(|_| true, event)
    }

    /// Send to the listed connections, skipping any that belong to `except_user`.
    pub fn send_to_many(&self, ids: &[ConnectionId], event: &ServerEvent, except_user: Option<&str>) -> usize {
        ids.iter()
            .filter_map(|id| self.connections.get(id))
            .filter(|c| except_user != Some(c.identity.user_id.as_str()))
            .filter(|c| c.send(event.clone()))
            .count()
    }

    fn send_where(&self, pred: impl Fn(&Identity) -> bool, event: &ServerEvent) -> usize {
        self.connections
            .values()
            .filter(|c| pred(&c.identity))
            .filter(|c| c.send(event.clone()))
            .count()
    }
}

/// Resolve the identity for a new connection.
///
/// A valid session token wins; raw handshake fields are honoured only when the
/// gateway is configured to trust them. Anything else, including a bad token,
/// degrades to a guest rather than rejecting the connection.
pub fn resolve_identity<'a>(
    handshake: &Handshake,
    connection_id: ConnectionId,
    config: &GatewayConfig,
    online: impl IntoIterator<Item = &'a Identity>,
) -> Identity {
    if let Some(identity) = identity_from_token(handshake, config) {
        return identity;
    }

    if config.trust_handshake {
        if let Some(user_id) = handshake.user_id.as_deref().map(str::trim).filter(|id| !id.is_empty()) {
            if !is_guest_id(user_id) {
                let role = handshake
                    .role
                    .as_deref()
                    .and_then(Role::from_name)
                    .filter(|r| *r != Role::Guest)
                    .unwrap_or(Role::User);
                return Identity {
                    user_id: user_id.to_string(),
                    role,
                    display_name: display_name_or(handshake.name.as_deref(), user_id),
                };
            }
        }
    }

    guest_identity(connection_id, online)
}

fn identity_from_token(handshake: &Handshake, config: &GatewayConfig) -> Option<Identity> {
    let token = handshake.token.as_deref()?;
    if config.jwt_secret.is_empty() {
        return None;
    }

    let claims = match decode::<Claims>(
        token,
        &DecodingKey::from_secret(config.jwt_secret.as_bytes()),
        &Validation::default(),
    ) {
        Ok(data) => data.claims,
        Err(e) => {
            warn!("Rejected handshake token ({}), continuing as guest", e);
            return None;
        }
    };

    if claims.role == Role::Guest || claims.sub.trim().is_empty() || is_guest_id(&claims.sub) {
        return None;
    }

    Some(Identity {
        display_name: display_name_or(claims.name.as_deref(), &claims.sub),
        user_id: claims.sub,
        role: claims.role,
    })
}

fn display_name_or(name: Option<&str>, fallback: &str) -> String {
    name.map(str::trim)
        .filter(|n| !n.is_empty())
        .unwrap_or(fallback)
        .to_string()
}

pub fn guest_identity<'a>(connection_id: ConnectionId, online: impl IntoIterator<Item = &'a Identity>) -> Identity {
    Identity {
        user_id: format!("{GUEST_PREFIX}{connection_id}"),
        role: Role::Guest,
        display_name: next_guest_name(online),
    }
}

/// Lowest "Guest N" (N >= 1) not held by a currently online guest.
///
/// Computed from the live identities only, so numbers freed by a disconnect
/// are handed out again.
pub fn next_guest_name<'a>(online: impl IntoIterator<Item = &'a Identity>) -> String {
    let taken: HashSet<u32> = online
        .into_iter()
        .filter(|i| i.is_guest())
        .filter_map(|i| i.display_name.strip_prefix(GUEST_NAME_PREFIX))
        .filter_map(|n| n.parse().ok())
        .collect();

    let n = (1..).find(|n| !taken.contains(n)).unwrap_or(1);
    format!("{GUEST_NAME_PREFIX}{n}")
}
