use std::sync::Arc;

use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tvdesk_types::api::Handshake;
use tvdesk_types::events::{ClientCommand, ServerEvent};
use tvdesk_types::models::{Identity, RoomId};

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::presence;
use crate::registry::{ConnectionId, ConnectionRegistry, resolve_identity};
use crate::rooms::RoomRegistry;
use crate::store::ChatStore;
use crate::typing::{TypingKey, TypingTimers};
use crate::unread::{UnreadLedger, Viewer};

/// Owns every piece of live state and handles client commands.
///
/// Cheap to clone; all clones share the same state. Locks are never held
/// across a store call, and at most one is held at a time except for
/// `live` then `unread` during disconnect and unread loads.
#[derive(Clone)]
pub struct Dispatcher {
    pub(crate) inner: Arc<DispatcherInner>,
}

pub(crate) struct DispatcherInner {
    pub(crate) config: GatewayConfig,
    pub(crate) store: Arc<dyn ChatStore>,
    pub(crate) live: RwLock<LiveState>,
    pub(crate) typing: Mutex<TypingTimers>,
    pub(crate) unread: Mutex<UnreadLedger>,
}

/// Connections and rooms change together, so they share one lock.
#[derive(Default)]
pub(crate) struct LiveState {
    pub(crate) connections: ConnectionRegistry,
    pub(crate) rooms: RoomRegistry,
}

impl LiveState {
    /// Send the room's current member list to everyone in it.
    fn broadcast_room(&self, room_id: &str) {
        if !self.rooms.exists(room_id) {
            return;
        }
        let event = ServerEvent::RoomUsersUpdate {
            room_id: room_id.to_string(),
            users: self.rooms.members(room_id),
        };
        self.connections
            .send_to_many(&self.rooms.connections(room_id), &event, None);
    }

    fn broadcast_presence(&self) {
        let snapshot = presence::snapshot(&self.connections);
        self.connections
            .broadcast(&ServerEvent::OnlineUsersUpdate(snapshot));
    }
}

impl Dispatcher {
    pub fn new(config: GatewayConfig, store: Arc<dyn ChatStore>) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                config,
                store,
                live: RwLock::new(LiveState::default()),
                typing: Mutex::new(TypingTimers::default()),
                unread: Mutex::new(UnreadLedger::default()),
            }),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    /// Register a new connection.
    ///
    /// The new socket gets `ready`, everyone gets the new presence list, and
    /// signed-in viewers get their unread counts.
    pub async fn connect(&self, handshake: &Handshake) -> ConnectionHandle {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();

        let identity = {
            let mut live = self.inner.live.write().await;
            let identity = resolve_identity(handshake, id, &self.inner.config, live.connections.identities());
            live.connections.insert(id, identity.clone(), tx);
            live.connections.send_to(
                id,
                ServerEvent::Ready {
                    identity: identity.clone(),
                },
            );
            live.broadcast_presence();
            identity
        };

        info!(
            "{} ({}, {}) connected as {}",
            identity.display_name,
            identity.user_id,
            identity.role.as_str(),
            id
        );

        if !identity.is_guest() {
            let viewer = Viewer::for_identity(&identity);
            match self.ensure_unread_loaded(&viewer).await {
                Ok(()) => self.push_unread_snapshot(id, &viewer).await,
                Err(e) => error!("Loading unread counts for {} failed: {}", identity.user_id, e),
            }
        }

        ConnectionHandle {
            id,
            identity,
            events: Some(rx),
            dispatcher: Some(self.clone()),
        }
    }

    /// Remove a connection and undo everything it was part of. Idempotent.
    pub async fn disconnect(&self, id: ConnectionId) {
        let (identity, abandoned) = {
            let mut live = self.inner.live.write().await;
            let Some(conn) = live.connections.remove(id) else {
                return;
            };

            let mut abandoned = Vec::new();
            for room_id in &conn.rooms {
                live.rooms.leave(room_id, id);
                live.broadcast_room(room_id);
                if !live.rooms.contains_user(room_id, &conn.identity.user_id) {
                    abandoned.push(room_id.clone());
                }
            }
            live.broadcast_presence();

            if !conn.identity.is_guest() {
                let viewer = Viewer::for_identity(&conn.identity);
                if !viewer.has_connections(&live.connections) {
                    self.inner.unread.lock().await.evict(&viewer);
                }
            }

            (conn.identity, abandoned)
        };

        for room_id in abandoned {
            self.stop_typing(&room_id, &identity).await;
        }

        info!("{} ({}) disconnected ({})", identity.display_name, identity.user_id, id);
    }

    /// Run one client command, answering failures with an `error` event.
    pub async fn handle(&self, id: ConnectionId, command: ClientCommand) {
        let name = command.name();
        if let Err(e) = self.handle_command(id, command).await {
            match &e {
                GatewayError::Store(_) => error!("{} from {} failed: {}", name, id, e),
                _ => warn!("{} from {} rejected: {}", name, id, e),
            }
            self.send_to(
                id,
                ServerEvent::Error {
                    command: name.to_string(),
                    message: e.client_message(),
                },
            )
            .await;
        }
    }

    /// Answer a frame that could not be parsed as a command.
    pub async fn reject_frame(&self, id: ConnectionId, command: &str, reason: &str) {
        self.send_to(
            id,
            ServerEvent::Error {
                command: command.to_string(),
                message: reason.to_string(),
            },
        )
        .await;
    }

    async fn handle_command(&self, id: ConnectionId, command: ClientCommand) -> Result<(), GatewayError> {
        match command {
            ClientCommand::RequestOnlineUsers {} => self.request_online_users(id).await,
            ClientCommand::JoinRoom { room_id } => self.join_room(id, &room_id).await,
            ClientCommand::LeaveRoom { room_id } => self.leave_room(id, &room_id).await,
            ClientCommand::Typing { room_id, is_typing } => self.set_typing(id, &room_id, is_typing).await,
            ClientCommand::SendMessage { room_id, body } => self.send_message(id, &room_id, &body).await,
            ClientCommand::EditMessage {
                room_id,
                message_id,
                body,
            } => self.edit_message(id, &room_id, &message_id, &body).await,
            ClientCommand::DeleteMessage { room_id, message_id } => {
                self.delete_message(id, &room_id, &message_id).await
            }
            ClientCommand::RefreshConversation { room_id } => self.refresh_conversation(id, &room_id).await,
            ClientCommand::MarkRead { room_id } => self.mark_read(id, require_room(&room_id)?).await,
            ClientCommand::RequestUnreadCounts {} => self.request_unread_counts(id).await,
            ClientCommand::FetchNotifications { limit, offset } => {
                self.fetch_notifications(id, limit, offset).await
            }
            ClientCommand::RefreshNotifications {} => self.fetch_notifications(id, None, None).await,
            ClientCommand::MarkNotificationsRead { ids } => self.mark_notifications_read(id, ids).await,
        }
    }

    pub async fn identity_of(&self, id: ConnectionId) -> Result<Identity, GatewayError> {
        self.inner
            .live
            .read()
            .await
            .connections
            .get(id)
            .map(|c| c.identity.clone())
            .ok_or(GatewayError::NotFound("connection"))
    }

    pub(crate) async fn send_to(&self, id: ConnectionId, event: ServerEvent) {
        self.inner.live.read().await.connections.send_to(id, event);
    }

    pub(crate) async fn broadcast_to_room(&self, room_id: &str, event: &ServerEvent) -> usize {
        let live = self.inner.live.read().await;
        live.connections
            .send_to_many(&live.rooms.connections(room_id), event, None)
    }

    // -- Presence --

    pub async fn request_online_users(&self, id: ConnectionId) -> Result<(), GatewayError> {
        let live = self.inner.live.read().await;
        if live.connections.get(id).is_none() {
            return Err(GatewayError::NotFound("connection"));
        }
        let snapshot = presence::snapshot(&live.connections);
        live.connections
            .send_to(id, ServerEvent::OnlineUsersUpdate(snapshot));
        Ok(())
    }

    pub async fn broadcast_presence(&self) {
        self.inner.live.read().await.broadcast_presence();
    }

    pub async fn online_users(&self) -> Vec<Identity> {
        presence::snapshot(&self.inner.live.read().await.connections)
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.live.read().await.connections.len()
    }

    /// Rooms the connection has joined, sorted.
    pub async fn rooms_of(&self, id: ConnectionId) -> Vec<RoomId> {
        let live = self.inner.live.read().await;
        let mut rooms: Vec<RoomId> = live
            .connections
            .get(id)
            .map(|c| c.rooms.iter().cloned().collect())
            .unwrap_or_default();
        rooms.sort();
        rooms
    }

    pub async fn room_members(&self, room_id: &str) -> Vec<Identity> {
        self.inner.live.read().await.rooms.members(room_id)
    }

    // -- Rooms --

    /// Every join broadcasts the member list, even a repeated one.
    pub async fn join_room(&self, id: ConnectionId, room_id: &str) -> Result<(), GatewayError> {
        let room_id = require_room(room_id)?;
        let mut live = self.inner.live.write().await;
        let LiveState { connections, rooms } = &mut *live;

        let conn = connections
            .get_mut(id)
            .ok_or(GatewayError::NotFound("connection"))?;
        if rooms.join(room_id, id, &conn.identity) {
            conn.rooms.insert(room_id.to_string());
            info!("{} ({}) joined room {}", conn.identity.display_name, conn.identity.user_id, room_id);
        } else {
            debug!("{} already in room {}", id, room_id);
        }

        live.broadcast_room(room_id);
        Ok(())
    }

    /// Leaving a room the connection is not in is a no-op.
    pub async fn leave_room(&self, id: ConnectionId, room_id: &str) -> Result<(), GatewayError> {
        let room_id = require_room(room_id)?;
        let (identity, user_gone) = {
            let mut live = self.inner.live.write().await;
            let LiveState { connections, rooms } = &mut *live;

            let conn = connections
                .get_mut(id)
                .ok_or(GatewayError::NotFound("connection"))?;
            if !conn.rooms.remove(room_id) {
                return Ok(());
            }
            rooms.leave(room_id, id);
            let identity = conn.identity.clone();
            info!("{} ({}) left room {}", identity.display_name, identity.user_id, room_id);

            live.broadcast_room(room_id);
            let user_gone = !live.rooms.contains_user(room_id, &identity.user_id);
            (identity, user_gone)
        };

        if user_gone {
            self.stop_typing(room_id, &identity).await;
        }
        Ok(())
    }

    // -- Typing --

    /// Only connections in the room may signal typing there.
    pub async fn set_typing(&self, id: ConnectionId, room_id: &str, is_typing: bool) -> Result<(), GatewayError> {
        let room_id = require_room(room_id)?;
        let identity = {
            let live = self.inner.live.read().await;
            let conn = live
                .connections
                .get(id)
                .ok_or(GatewayError::NotFound("connection"))?;
            if !conn.rooms.contains(room_id) {
                return Err(GatewayError::Validation("join the room first"));
            }
            conn.identity.clone()
        };
        let key: TypingKey = (room_id.to_string(), identity.user_id.clone());

        if is_typing {
            let weak = Arc::downgrade(&self.inner);
            let timeout = self.inner.config.typing_timeout;
            let timer_key = key.clone();
            self.inner
                .typing
                .lock()
                .await
                .arm(key, identity.clone(), move |generation| {
                    tokio::spawn(async move {
                        tokio::time::sleep(timeout).await;
                        if let Some(inner) = weak.upgrade() {
                            Dispatcher { inner }.expire_typing(&timer_key, generation).await;
                        }
                    })
                    .abort_handle()
                });
        } else {
            self.inner.typing.lock().await.clear(&key);
        }

        self.broadcast_typing(room_id, &identity, is_typing).await;
        Ok(())
    }

    /// Timer callback. A refreshed or already-cleared entry is left alone.
    pub(crate) async fn expire_typing(&self, key: &TypingKey, generation: u64) {
        let expired = self.inner.typing.lock().await.expire(key, generation);
        if let Some(identity) = expired {
            debug!("Typing expired for {} in {}", identity.user_id, key.0);
            self.broadcast_typing(&key.0, &identity, false).await;
        }
    }

    /// Clear typing without a client request; only announced if it was set.
    pub(crate) async fn stop_typing(&self, room_id: &str, identity: &Identity) {
        let key: TypingKey = (room_id.to_string(), identity.user_id.clone());
        let cleared = self.inner.typing.lock().await.clear(&key);
        if let Some(identity) = cleared {
            self.broadcast_typing(room_id, &identity, false).await;
        }
    }

    async fn broadcast_typing(&self, room_id: &str, identity: &Identity, is_typing: bool) {
        let event = ServerEvent::UserTyping {
            room_id: room_id.to_string(),
            user: identity.clone(),
            is_typing,
        };
        let live = self.inner.live.read().await;
        live.connections
            .send_to_many(&live.rooms.connections(room_id), &event, Some(&identity.user_id));
    }

    pub async fn is_typing(&self, room_id: &str, user_id: &str) -> bool {
        self.inner
            .typing
            .lock()
            .await
            .is_typing(&(room_id.to_string(), user_id.to_string()))
    }

    // -- Unread --

    /// Re-read the viewer's counts from the store and send them all.
    pub async fn request_unread_counts(&self, id: ConnectionId) -> Result<(), GatewayError> {
        let identity = self.identity_of(id).await?;
        if identity.is_guest() {
            self.send_to(
                id,
                ServerEvent::UnreadCountUpdate {
                    room_id: None,
                    total: 0,
                },
            )
            .await;
            return Ok(());
        }

        let viewer = Viewer::for_identity(&identity);
        self.reload_unread(&viewer).await?;
        self.push_unread_snapshot(id, &viewer).await;
        Ok(())
    }

    pub async fn unread_total(&self, viewer: &Viewer) -> u32 {
        self.inner.unread.lock().await.total(viewer)
    }

    pub async fn unread_count(&self, viewer: &Viewer, room_id: &str) -> u32 {
        self.inner.unread.lock().await.count(viewer, room_id)
    }

    /// Whether the viewer's counts are cached; only while it has sockets.
    pub async fn is_unread_cached(&self, viewer: &Viewer) -> bool {
        self.inner.unread.lock().await.is_loaded(viewer)
    }
}

pub(crate) fn require_room(room_id: &str) -> Result<&str, GatewayError> {
    let room_id = room_id.trim();
    if room_id.is_empty() {
        return Err(GatewayError::Validation("roomId is required"));
    }
    Ok(room_id)
}

/// A registered connection: its outbound event stream plus a cleanup guard.
///
/// Call [`ConnectionHandle::close`] when the socket ends. Dropping the handle
/// without closing schedules the same cleanup on the current runtime.
pub struct ConnectionHandle {
    id: ConnectionId,
    identity: Identity,
    events: Option<mpsc::UnboundedReceiver<ServerEvent>>,
    dispatcher: Option<Dispatcher>,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Take the outbound receiver, e.g. to move it into a socket writer task.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ServerEvent>> {
        self.events.take()
    }

    pub async fn send(&self, command: ClientCommand) {
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.handle(self.id, command).await;
        }
    }

    /// Next outbound event. `None` once the connection is removed.
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        self.events.as_mut()?.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ServerEvent> {
        self.events.as_mut()?.try_recv().ok()
    }

    /// Everything queued right now.
    pub fn drain(&mut self) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        while let Some(event) = self.try_recv() {
            out.push(event);
        }
        out
    }

    pub async fn close(mut self) {
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.disconnect(self.id).await;
        }
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        let Some(dispatcher) = self.dispatcher.take() else {
            return;
        };
        let id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { dispatcher.disconnect(id).await });
            }
            Err(_) => warn!("Connection {} dropped outside a runtime, cleanup skipped", id),
        }
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .finish()
    }
}
