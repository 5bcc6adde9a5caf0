//! Unread bookkeeping.
//!
//! The store is the source of truth (messages without `read_at`); the ledger
//! caches per-conversation counts for viewers that currently have sockets so
//! pushes don't need a query per badge. A viewer's global total is always the
//! sum of its cached per-conversation counts.

use std::collections::HashMap;

use tracing::{debug, warn};

use tvdesk_types::events::ServerEvent;
use tvdesk_types::models::{Conversation, Identity, RoomId};

use crate::dispatcher::Dispatcher;
use crate::error::GatewayError;
use crate::registry::{ConnectionId, ConnectionRegistry};

/// Store reads per recount before giving up on a busy viewer.
const RECOUNT_ATTEMPTS: usize = 3;

/// Whose unread view a count belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Viewer {
    /// Shared admin view: customer-authored messages nobody on staff has read.
    Admins,
    /// A customer: staff-authored messages in conversations they own.
    User(String),
}

impl Viewer {
    pub fn for_identity(identity: &Identity) -> Self {
        if identity.role.is_admin() {
            Self::Admins
        } else {
            Self::User(identity.user_id.clone())
        }
    }

    /// Which side's messages count as unread for this viewer.
    pub fn reads_admin_messages(&self) -> bool {
        matches!(self, Self::User(_))
    }

    /// The viewer who did not write a message in `conversation`.
    pub fn recipient_of(conversation: &Conversation, sender_is_admin: bool) -> Self {
        if sender_is_admin {
            Self::User(conversation.user_id.clone())
        } else {
            Self::Admins
        }
    }

    /// May this viewer read (and mark read) the conversation?
    pub fn can_view(&self, conversation: &Conversation) -> bool {
        match self {
            Self::Admins => true,
            Self::User(user_id) => conversation.user_id == *user_id,
        }
    }

    pub fn has_connections(&self, registry: &ConnectionRegistry) -> bool {
        match self {
            Self::Admins => registry.has_admin(),
            Self::User(user_id) => registry.has_user(user_id),
        }
    }

    pub fn send(&self, registry: &ConnectionRegistry, event: &ServerEvent) -> usize {
        match self {
            Self::Admins => registry.send_to_admins(event),
            Self::User(user_id) => registry.send_to_user(user_id, event),
        }
    }
}

/// Counts for one room after a change, plus the viewer's new total.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreadChange {
    pub room_id: RoomId,
    pub room: u32,
    pub total: u32,
}

impl UnreadChange {
    pub fn events(&self) -> [ServerEvent; 2] {
        [
            ServerEvent::UnreadCountUpdate {
                room_id: Some(self.room_id.clone()),
                total: self.room,
            },
            ServerEvent::UnreadCountUpdate {
                room_id: None,
                total: self.total,
            },
        ]
    }
}

/// Outcome of a write that was computed from a store read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardedWrite {
    Applied(UnreadChange),
    /// The viewer's counts changed since the version was taken.
    Stale,
    /// The viewer is no longer cached.
    Unloaded,
}

#[derive(Default)]
struct ViewerCounts {
    rooms: HashMap<RoomId, u32>,
    version: u64,
}

/// Cached counts per viewer. Every write bumps the viewer's version, taken
/// from one ledger-wide clock so a reloaded viewer never repeats an old one.
#[derive(Default)]
pub struct UnreadLedger {
    views: HashMap<Viewer, ViewerCounts>,
    clock: u64,
}

impl UnreadLedger {
    pub fn is_loaded(&self, viewer: &Viewer) -> bool {
        self.views.contains_key(viewer)
    }

    /// `None` when the viewer is not cached.
    pub fn version(&self, viewer: &Viewer) -> Option<u64> {
        self.views.get(viewer).map(|view| view.version)
    }

    /// Replace the viewer's cached counts with a fresh store read.
    pub fn load(&mut self, viewer: Viewer, counts: impl IntoIterator<Item = (RoomId, u32)>) {
        let rooms = counts.into_iter().filter(|(_, n)| *n > 0).collect();
        let version = self.tick();
        self.views.insert(viewer, ViewerCounts { rooms, version });
    }

    pub fn evict(&mut self, viewer: &Viewer) {
        self.views.remove(viewer);
    }

    /// `None` when the viewer is not cached (nobody to push to).
    pub fn increment(&mut self, viewer: &Viewer, room_id: &str) -> Option<UnreadChange> {
        self.update(viewer, room_id, |n| n.saturating_add(1))
    }

    pub fn decrement(&mut self, viewer: &Viewer, room_id: &str) -> Option<UnreadChange> {
        self.update(viewer, room_id, |n| n.saturating_sub(1))
    }

    pub fn set(&mut self, viewer: &Viewer, room_id: &str, count: u32) -> Option<UnreadChange> {
        self.update(viewer, room_id, |_| count)
    }

    /// Set a count read from the store, unless the viewer changed since `seen`.
    pub fn set_if_unchanged(&mut self, viewer: &Viewer, room_id: &str, count: u32, seen: u64) -> GuardedWrite {
        match self.version(viewer) {
            None => GuardedWrite::Unloaded,
            Some(version) if version != seen => GuardedWrite::Stale,
            Some(_) => self
                .set(viewer, room_id, count)
                .map_or(GuardedWrite::Unloaded, GuardedWrite::Applied),
        }
    }

    pub fn clear(&mut self, viewer: &Viewer, room_id: &str) -> Option<UnreadChange> {
        self.set(viewer, room_id, 0)
    }

    pub fn count(&self, viewer: &Viewer, room_id: &str) -> u32 {
        self.views
            .get(viewer)
            .and_then(|view| view.rooms.get(room_id))
            .copied()
            .unwrap_or(0)
    }

    pub fn total(&self, viewer: &Viewer) -> u32 {
        self.views
            .get(viewer)
            .map(|view| view.rooms.values().fold(0u32, |acc, n| acc.saturating_add(*n)))
            .unwrap_or(0)
    }

    /// Non-zero rooms, sorted by id.
    pub fn rooms(&self, viewer: &Viewer) -> Vec<(RoomId, u32)> {
        let mut rooms: Vec<(RoomId, u32)> = self
            .views
            .get(viewer)
            .map(|view| view.rooms.iter().map(|(id, n)| (id.clone(), *n)).collect())
            .unwrap_or_default();
        rooms.sort();
        rooms
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn update(&mut self, viewer: &Viewer, room_id: &str, f: impl FnOnce(u32) -> u32) -> Option<UnreadChange> {
        if !self.views.contains_key(viewer) {
            return None;
        }
        let version = self.tick();
        let view = self.views.get_mut(viewer)?;
        view.version = version;
        let next = f(view.rooms.get(room_id).copied().unwrap_or(0));
        if next == 0 {
            view.rooms.remove(room_id);
        } else {
            view.rooms.insert(room_id.to_string(), next);
        }
        Some(UnreadChange {
            room_id: room_id.to_string(),
            room: next,
            total: self.total(viewer),
        })
    }
}

impl Dispatcher {
    /// Load a viewer's counts from the store unless already cached.
    pub(crate) async fn ensure_unread_loaded(&self, viewer: &Viewer) -> Result<(), GatewayError> {
        if self.inner.unread.lock().await.is_loaded(viewer) {
            return Ok(());
        }
        self.reload_unread(viewer).await
    }

    /// Replace the viewer's cached counts with a store read.
    ///
    /// Nothing is cached for a viewer whose last socket closed during the
    /// read, and a read that raced with a live update is retried.
    pub(crate) async fn reload_unread(&self, viewer: &Viewer) -> Result<(), GatewayError> {
        for _ in 0..RECOUNT_ATTEMPTS {
            let seen = self.inner.unread.lock().await.version(viewer);
            let counts = self.inner.store.unread_by_conversation(viewer).await?;

            let live = self.inner.live.read().await;
            let mut ledger = self.inner.unread.lock().await;
            if !viewer.has_connections(&live.connections) {
                debug!("{:?} went offline during unread load, not caching", viewer);
                ledger.evict(viewer);
                return Ok(());
            }
            if ledger.version(viewer) == seen {
                ledger.load(viewer.clone(), counts);
                return Ok(());
            }
            debug!("Unread for {:?} changed during load, reading again", viewer);
        }
        warn!("Unread load for {:?} kept racing with updates, keeping cached counts", viewer);
        Ok(())
    }

    /// Push every non-zero room count and the global total to one connection.
    pub(crate) async fn push_unread_snapshot(&self, connection_id: ConnectionId, viewer: &Viewer) {
        let (rooms, total) = {
            let ledger = self.inner.unread.lock().await;
            (ledger.rooms(viewer), ledger.total(viewer))
        };

        let live = self.inner.live.read().await;
        for (room_id, count) in rooms {
            live.connections.send_to(
                connection_id,
                ServerEvent::UnreadCountUpdate {
                    room_id: Some(room_id),
                    total: count,
                },
            );
        }
        live.connections
            .send_to(connection_id, ServerEvent::UnreadCountUpdate { room_id: None, total });
    }

    async fn push_unread_change(&self, viewer: &Viewer, change: &UnreadChange) {
        let live = self.inner.live.read().await;
        for event in change.events() {
            viewer.send(&live.connections, &event);
        }
    }

    /// Re-read one room's count and store it, unless another write to the
    /// viewer landed during the read, in which case the read is repeated.
    /// `fallback` adjusts the cache when the store read fails.
    async fn recount(
        &self,
        viewer: &Viewer,
        room_id: &str,
        fallback: fn(&mut UnreadLedger, &Viewer, &str) -> Option<UnreadChange>,
    ) -> Option<UnreadChange> {
        for _ in 0..RECOUNT_ATTEMPTS {
            let Some(seen) = self.inner.unread.lock().await.version(viewer) else {
                debug!("Unread for {:?} not cached, skipping live push", viewer);
                return None;
            };
            let fresh = self.inner.store.count_unread(room_id, viewer).await;

            let mut ledger = self.inner.unread.lock().await;
            match fresh {
                Ok(count) => match ledger.set_if_unchanged(viewer, room_id, count, seen) {
                    GuardedWrite::Applied(change) => return Some(change),
                    GuardedWrite::Unloaded => return None,
                    GuardedWrite::Stale => debug!("Unread for {:?} in {} changed during recount", viewer, room_id),
                },
                Err(e) => {
                    warn!("count_unread for {} failed, adjusting cached count: {:#}", room_id, e);
                    return fallback(&mut *ledger, viewer, room_id);
                }
            }
        }
        warn!("Unread count for {:?} in {} kept changing, leaving cache as is", viewer, room_id);
        None
    }

    /// A message landed in `conversation`: refresh the recipient side's counts.
    pub(crate) async fn on_message_created(&self, conversation: &Conversation, sender_is_admin: bool) {
        let viewer = Viewer::recipient_of(conversation, sender_is_admin);
        if let Some(change) = self.recount(&viewer, &conversation.id, UnreadLedger::increment).await {
            self.push_unread_change(&viewer, &change).await;
        }
    }

    /// An unread message was deleted before anyone read it.
    pub(crate) async fn on_unread_message_removed(&self, conversation: &Conversation, sender_is_admin: bool) {
        let viewer = Viewer::recipient_of(conversation, sender_is_admin);
        if let Some(change) = self.recount(&viewer, &conversation.id, UnreadLedger::decrement).await {
            self.push_unread_change(&viewer, &change).await;
        }
    }

    /// Stamp the viewer's unread messages in `room_id` as read and push the new count.
    pub(crate) async fn mark_read(&self, connection_id: ConnectionId, room_id: &str) -> Result<(), GatewayError> {
        let identity = self.identity_of(connection_id).await?;
        let viewer = Viewer::for_identity(&identity);

        let conversation = self
            .inner
            .store
            .find_conversation(room_id)
            .await?
            .ok_or(GatewayError::NotFound("conversation"))?;
        if !viewer.can_view(&conversation) {
            return Err(GatewayError::Forbidden("read this conversation"));
        }

        let changed = self.inner.store.mark_messages_read(room_id, &viewer).await?;
        debug!("{} marked {} messages read in {}", identity.user_id, changed, room_id);

        self.ensure_unread_loaded(&viewer).await?;
        if let Some(change) = self.recount(&viewer, room_id, UnreadLedger::clear).await {
            self.push_unread_change(&viewer, &change).await;
        }
        Ok(())
    }
}
