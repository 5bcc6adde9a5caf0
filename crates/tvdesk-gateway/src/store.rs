//! The persistence collaborator the real-time core talks to.
//!
//! Every call is async and fallible with no retry; callers decide what a
//! failure means for their event.

use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tracing::warn;
use uuid::Uuid;

use tvdesk_db::Database;
use tvdesk_db::models::{ConversationRow, MessageRow, NotificationRow};
use tvdesk_types::models::{
    Conversation, ConversationWithMessages, Identity, Message, Notification, NotificationKind, RoomId,
};

use crate::unread::Viewer;

/// Messages returned by a conversation resync.
pub const RESYNC_MESSAGE_LIMIT: u32 = 200;

pub struct NewMessage {
    pub conversation_id: String,
    pub sender: Identity,
    pub body: String,
}

pub struct NewNotification {
    pub user_id: String,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub data: serde_json::Value,
}

pub struct NotificationPage {
    pub notifications: Vec<Notification>,
    pub unread_count: u32,
    pub has_more: bool,
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn find_conversation(&self, id: &str) -> Result<Option<Conversation>>;

    async fn find_conversation_with_messages(&self, id: &str) -> Result<Option<ConversationWithMessages>>;

    async fn find_message(&self, id: &str) -> Result<Option<Message>>;

    async fn create_message(&self, new: NewMessage) -> Result<Message>;

    async fn update_message(&self, id: &str, body: &str) -> Result<Option<Message>>;

    /// Returns the message as it was before deletion.
    async fn delete_message(&self, id: &str) -> Result<Option<Message>>;

    async fn count_unread(&self, conversation_id: &str, viewer: &Viewer) -> Result<u32>;

    async fn unread_by_conversation(&self, viewer: &Viewer) -> Result<Vec<(RoomId, u32)>>;

    /// Returns how many messages were stamped.
    async fn mark_messages_read(&self, conversation_id: &str, viewer: &Viewer) -> Result<usize>;

    async fn create_notification(&self, new: NewNotification) -> Result<Notification>;

    async fn list_notifications(&self, user_id: &str, limit: u32, offset: u32) -> Result<NotificationPage>;

    async fn mark_notifications_read(&self, user_id: &str, ids: Option<Vec<String>>) -> Result<usize>;

    async fn find_admin_ids(&self) -> Result<Vec<String>>;

    async fn find_user_locale(&self, user_id: &str) -> Result<Option<String>>;
}

/// `ChatStore` over the SQLite database. Queries run on the blocking pool.
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Database>,
}

impl SqliteStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(db.as_ref()))
            .await
            .map_err(|e| anyhow!("spawn_blocking join error: {}", e))?
    }
}

#[async_trait]
impl ChatStore for SqliteStore {
    async fn find_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let id = id.to_string();
        let row = self.blocking(move |db| db.get_conversation(&id)).await?;
        Ok(row.map(conversation_from_row))
    }

    async fn find_conversation_with_messages(&self, id: &str) -> Result<Option<ConversationWithMessages>> {
        let id = id.to_string();
        self.blocking(move |db| {
            let Some(row) = db.get_conversation(&id)? else {
                return Ok(None);
            };
            let messages = db.get_messages(&id, RESYNC_MESSAGE_LIMIT)?;
            Ok(Some(ConversationWithMessages {
                conversation: conversation_from_row(row),
                messages: messages.into_iter().map(message_from_row).collect(),
            }))
        })
        .await
    }

    async fn find_message(&self, id: &str) -> Result<Option<Message>> {
        let id = id.to_string();
        let row = self.blocking(move |db| db.get_message(&id)).await?;
        Ok(row.map(message_from_row))
    }

    async fn create_message(&self, new: NewMessage) -> Result<Message> {
        let row = MessageRow {
            id: Uuid::new_v4().to_string(),
            conversation_id: new.conversation_id,
            sender_id: new.sender.user_id,
            sender_name: new.sender.display_name,
            sender_is_admin: new.sender.role.is_admin(),
            body: new.body,
            created_at: tvdesk_db::now_timestamp(),
            edited_at: None,
            read_at: None,
        };
        let inserted = row.clone();
        self.blocking(move |db| db.insert_message(&inserted)).await?;
        Ok(message_from_row(row))
    }

    async fn update_message(&self, id: &str, body: &str) -> Result<Option<Message>> {
        let (id, body) = (id.to_string(), body.to_string());
        let row = self
            .blocking(move |db| db.update_message_body(&id, &body, &tvdesk_db::now_timestamp()))
            .await?;
        Ok(row.map(message_from_row))
    }

    async fn delete_message(&self, id: &str) -> Result<Option<Message>> {
        let id = id.to_string();
        let row = self.blocking(move |db| db.delete_message(&id)).await?;
        Ok(row.map(message_from_row))
    }

    async fn count_unread(&self, conversation_id: &str, viewer: &Viewer) -> Result<u32> {
        let id = conversation_id.to_string();
        let authored_by_admin = viewer.reads_admin_messages();
        self.blocking(move |db| db.count_unread(&id, authored_by_admin)).await
    }

    async fn unread_by_conversation(&self, viewer: &Viewer) -> Result<Vec<(RoomId, u32)>> {
        let viewer = viewer.clone();
        self.blocking(move |db| match &viewer {
            Viewer::Admins => db.unread_for_admins(),
            Viewer::User(user_id) => db.unread_for_user(user_id),
        })
        .await
    }

    async fn mark_messages_read(&self, conversation_id: &str, viewer: &Viewer) -> Result<usize> {
        let id = conversation_id.to_string();
        let authored_by_admin = viewer.reads_admin_messages();
        self.blocking(move |db| db.mark_read(&id, authored_by_admin, &tvdesk_db::now_timestamp()))
            .await
    }

    async fn create_notification(&self, new: NewNotification) -> Result<Notification> {
        let row = NotificationRow {
            id: Uuid::new_v4().to_string(),
            user_id: new.user_id,
            kind: new.kind.as_str().to_string(),
            title: new.title,
            body: new.body,
            data: new.data.to_string(),
            read_at: None,
            created_at: tvdesk_db::now_timestamp(),
        };
        let inserted = row.clone();
        self.blocking(move |db| db.insert_notification(&inserted)).await?;
        notification_from_row(row).ok_or_else(|| anyhow!("unknown notification kind"))
    }

    async fn list_notifications(&self, user_id: &str, limit: u32, offset: u32) -> Result<NotificationPage> {
        let user_id = user_id.to_string();
        let (rows, total, unread_count) = self
            .blocking(move |db| {
                let rows = db.list_notifications(&user_id, limit, offset)?;
                let total = db.count_notifications(&user_id, false)?;
                let unread = db.count_notifications(&user_id, true)?;
                Ok((rows, total, unread))
            })
            .await?;

        let shown = offset.saturating_add(rows.len() as u32);
        Ok(NotificationPage {
            notifications: rows.into_iter().filter_map(notification_from_row).collect(),
            unread_count,
            has_more: shown < total,
        })
    }

    async fn mark_notifications_read(&self, user_id: &str, ids: Option<Vec<String>>) -> Result<usize> {
        let user_id = user_id.to_string();
        self.blocking(move |db| db.mark_notifications_read(&user_id, ids.as_deref(), &tvdesk_db::now_timestamp()))
            .await
    }

    async fn find_admin_ids(&self) -> Result<Vec<String>> {
        self.blocking(|db| db.get_admin_ids()).await
    }

    async fn find_user_locale(&self, user_id: &str) -> Result<Option<String>> {
        let user_id = user_id.to_string();
        let row = self.blocking(move |db| db.get_user_by_id(&user_id)).await?;
        Ok(row.map(|u| u.locale))
    }
}

// -- Row conversion --

/// Timestamps are written as RFC 3339, but rows created by SQLite defaults or
/// older tooling may carry "YYYY-MM-DD HH:MM:SS"; accept both.
fn parse_timestamp(raw: &str, what: &str) -> chrono::DateTime<chrono::Utc> {
    raw.parse::<chrono::DateTime<chrono::Utc>>()
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            warn!("Corrupt timestamp '{}' on {}: {}", raw, what, e);
            chrono::DateTime::default()
        })
}

fn conversation_from_row(row: ConversationRow) -> Conversation {
    Conversation {
        created_at: parse_timestamp(&row.created_at, &row.id),
        updated_at: parse_timestamp(&row.updated_at, &row.id),
        id: row.id,
        user_id: row.user_id,
        subject: row.subject,
        status: row.status,
    }
}

fn message_from_row(row: MessageRow) -> Message {
    Message {
        created_at: parse_timestamp(&row.created_at, &row.id),
        edited_at: row.edited_at.as_deref().map(|t| parse_timestamp(t, &row.id)),
        read_at: row.read_at.as_deref().map(|t| parse_timestamp(t, &row.id)),
        id: row.id,
        conversation_id: row.conversation_id,
        sender_id: row.sender_id,
        sender_name: row.sender_name,
        sender_is_admin: row.sender_is_admin,
        body: row.body,
    }
}

fn notification_from_row(row: NotificationRow) -> Option<Notification> {
    let Some(kind) = NotificationKind::from_name(&row.kind) else {
        warn!("Skipping notification {} with unknown kind '{}'", row.id, row.kind);
        return None;
    };
    let data = serde_json::from_str(&row.data).unwrap_or_else(|e| {
        warn!("Corrupt data on notification {}: {}", row.id, e);
        serde_json::Value::Null
    });
    Some(Notification {
        created_at: parse_timestamp(&row.created_at, &row.id),
        read_at: row.read_at.as_deref().map(|t| parse_timestamp(t, &row.id)),
        id: row.id,
        user_id: row.user_id,
        kind,
        title: row.title,
        body: row.body,
        data,
    })
}
