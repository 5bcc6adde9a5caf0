use serde::{Deserialize, Serialize};

use crate::models::{ConversationWithMessages, Identity, Message, Notification, RoomId};

/// Events sent FROM server TO client over the socket.
///
/// Frames are adjacently tagged: `{"type": "room_users_update", "data": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    /// Sent once, right after the connection's identity is resolved.
    Ready { identity: Identity },

    /// Full-replace list of everyone connected.
    OnlineUsersUpdate(Vec<Identity>),

    /// Full-replace member list of one room.
    RoomUsersUpdate { room_id: RoomId, users: Vec<Identity> },

    UserTyping {
        room_id: RoomId,
        user: Identity,
        is_typing: bool,
    },

    MessageCreated(Message),

    MessageUpdated(Message),

    MessageDeleted { room_id: RoomId, message_id: String },

    /// Wholesale resync of a room's conversation and messages.
    ConversationUpdated(ConversationWithMessages),

    /// Per-room count when `room_id` is set, the viewer's global total otherwise.
    UnreadCountUpdate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<RoomId>,
        total: u32,
    },

    NotificationsList {
        notifications: Vec<Notification>,
        unread_count: u32,
        has_more: bool,
    },

    /// Live push of a freshly persisted notification.
    Notification(Notification),

    /// Error acknowledgment, only ever sent to the connection that caused it.
    Error { command: String, message: String },
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ready { .. } => "ready",
            Self::OnlineUsersUpdate(_) => "online_users_update",
            Self::RoomUsersUpdate { .. } => "room_users_update",
            Self::UserTyping { .. } => "user_typing",
            Self::MessageCreated(_) => "message_created",
            Self::MessageUpdated(_) => "message_updated",
            Self::MessageDeleted { .. } => "message_deleted",
            Self::ConversationUpdated(_) => "conversation_updated",
            Self::UnreadCountUpdate { .. } => "unread_count_update",
            Self::NotificationsList { .. } => "notifications_list",
            Self::Notification(_) => "notification",
            Self::Error { .. } => "error",
        }
    }
}

/// Commands sent FROM client TO server over the socket.
///
/// Payload-less commands are empty struct variants so clients may send
/// `"data": {}` as the event table documents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ClientCommand {
    RequestOnlineUsers {},

    JoinRoom { room_id: RoomId },

    LeaveRoom { room_id: RoomId },

    Typing { room_id: RoomId, is_typing: bool },

    SendMessage { room_id: RoomId, body: String },

    EditMessage {
        room_id: RoomId,
        message_id: String,
        body: String,
    },

    DeleteMessage { room_id: RoomId, message_id: String },

    RefreshConversation { room_id: RoomId },

    MarkRead { room_id: RoomId },

    RequestUnreadCounts {},

    FetchNotifications {
        #[serde(default)]
        limit: Option<u32>,
        #[serde(default)]
        offset: Option<u32>,
    },

    RefreshNotifications {},

    MarkNotificationsRead {
        #[serde(default)]
        ids: Option<Vec<String>>,
    },
}

impl ClientCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RequestOnlineUsers {} => "request_online_users",
            Self::JoinRoom { .. } => "join_room",
            Self::LeaveRoom { .. } => "leave_room",
            Self::Typing { .. } => "typing",
            Self::SendMessage { .. } => "send_message",
            Self::EditMessage { .. } => "edit_message",
            Self::DeleteMessage { .. } => "delete_message",
            Self::RefreshConversation { .. } => "refresh_conversation",
            Self::MarkRead { .. } => "mark_read",
            Self::RequestUnreadCounts {} => "request_unread_counts",
            Self::FetchNotifications { .. } => "fetch_notifications",
            Self::RefreshNotifications {} => "refresh_notifications",
            Self::MarkNotificationsRead { .. } => "mark_notifications_read",
        }
    }
}
