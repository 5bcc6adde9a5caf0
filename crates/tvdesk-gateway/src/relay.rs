//! Message relay: persist first, then fan out to the room.

use tracing::debug;

use tvdesk_types::events::ServerEvent;
use tvdesk_types::models::{Conversation, Identity, Message, NotificationKind, NotificationScope};

use crate::dispatcher::{Dispatcher, require_room};
use crate::error::GatewayError;
use crate::i18n;
use crate::registry::ConnectionId;
use crate::store::NewMessage;
use crate::unread::Viewer;

/// Longest accepted message body, in characters.
pub const MAX_BODY_CHARS: usize = 4000;

fn validate_body(body: &str) -> Result<&str, GatewayError> {
    let body = body.trim();
    if body.is_empty() {
        return Err(GatewayError::Validation("message body is empty"));
    }
    if body.chars().count() > MAX_BODY_CHARS {
        return Err(GatewayError::Validation("message body is too long"));
    }
    Ok(body)
}

impl Dispatcher {
    /// The conversation behind `room_id`, if `identity` may take part in it.
    async fn authorize(
        &self,
        identity: &Identity,
        room_id: &str,
        action: &'static str,
    ) -> Result<Conversation, GatewayError> {
        let conversation = self
            .inner
            .store
            .find_conversation(room_id)
            .await?
            .ok_or(GatewayError::NotFound("conversation"))?;
        if identity.is_guest() || !Viewer::for_identity(identity).can_view(&conversation) {
            return Err(GatewayError::Forbidden(action));
        }
        Ok(conversation)
    }

    /// An existing message of `room_id` that `identity` wrote, or any message for admins.
    async fn own_message(
        &self,
        identity: &Identity,
        room_id: &str,
        message_id: &str,
        action: &'static str,
    ) -> Result<Message, GatewayError> {
        let message = self
            .inner
            .store
            .find_message(message_id)
            .await?
            .filter(|m| m.conversation_id == room_id)
            .ok_or(GatewayError::NotFound("message"))?;
        if message.sender_id != identity.user_id && !identity.role.is_admin() {
            return Err(GatewayError::Forbidden(action));
        }
        Ok(message)
    }

    pub async fn send_message(&self, id: ConnectionId, room_id: &str, body: &str) -> Result<(), GatewayError> {
        let room_id = require_room(room_id)?;
        let body = validate_body(body)?;
        let identity = self.identity_of(id).await?;
        let conversation = self
            .authorize(&identity, room_id, "post in this conversation")
            .await?;

        let message = self
            .inner
            .store
            .create_message(NewMessage {
                conversation_id: room_id.to_string(),
                sender: identity.clone(),
                body: body.to_string(),
            })
            .await?;

        let delivered = self
            .broadcast_to_room(room_id, &ServerEvent::MessageCreated(message.clone()))
            .await;
        debug!("Message {} in {} delivered to {} sockets", message.id, room_id, delivered);

        self.on_message_created(&conversation, message.sender_is_admin).await;
        self.stop_typing(room_id, &identity).await;
        self.notify_chat_message(&conversation, &message);
        Ok(())
    }

    pub async fn edit_message(
        &self,
        id: ConnectionId,
        room_id: &str,
        message_id: &str,
        body: &str,
    ) -> Result<(), GatewayError> {
        let room_id = require_room(room_id)?;
        let body = validate_body(body)?;
        let identity = self.identity_of(id).await?;
        self.authorize(&identity, room_id, "edit in this conversation")
            .await?;
        self.own_message(&identity, room_id, message_id, "edit this message")
            .await?;

        let updated = self
            .inner
            .store
            .update_message(message_id, body)
            .await?
            .ok_or(GatewayError::NotFound("message"))?;

        self.broadcast_to_room(room_id, &ServerEvent::MessageUpdated(updated))
            .await;
        Ok(())
    }

    pub async fn delete_message(&self, id: ConnectionId, room_id: &str, message_id: &str) -> Result<(), GatewayError> {
        let room_id = require_room(room_id)?;
        let identity = self.identity_of(id).await?;
        let conversation = self
            .authorize(&identity, room_id, "delete in this conversation")
            .await?;
        self.own_message(&identity, room_id, message_id, "delete this message")
            .await?;

        let deleted = self
            .inner
            .store
            .delete_message(message_id)
            .await?
            .ok_or(GatewayError::NotFound("message"))?;

        self.broadcast_to_room(
            room_id,
            &ServerEvent::MessageDeleted {
                room_id: room_id.to_string(),
                message_id: deleted.id.clone(),
            },
        )
        .await;

        if deleted.read_at.is_none() {
            self.on_unread_message_removed(&conversation, deleted.sender_is_admin)
                .await;
        }
        Ok(())
    }

    pub async fn refresh_conversation(&self, id: ConnectionId, room_id: &str) -> Result<(), GatewayError> {
        let room_id = require_room(room_id)?;
        let identity = self.identity_of(id).await?;
        self.authorize(&identity, room_id, "read this conversation")
            .await?;
        if !self.sync_conversation(room_id).await? {
            return Err(GatewayError::NotFound("conversation"));
        }
        Ok(())
    }

    /// Re-read a conversation and broadcast it wholesale to its room.
    /// Returns false if the conversation does not exist.
    pub async fn sync_conversation(&self, room_id: &str) -> Result<bool, GatewayError> {
        let Some(full) = self
            .inner
            .store
            .find_conversation_with_messages(room_id)
            .await?
        else {
            return Ok(false);
        };

        let delivered = self
            .broadcast_to_room(room_id, &ServerEvent::ConversationUpdated(full))
            .await;
        debug!("Resynced {} to {} sockets", room_id, delivered);
        Ok(true)
    }

    /// Tell the other side of the conversation about a new message.
    fn notify_chat_message(&self, conversation: &Conversation, message: &Message) {
        let scope = if message.sender_is_admin {
            NotificationScope::User {
                user_id: conversation.user_id.clone(),
            }
        } else {
            NotificationScope::Admins
        };
        let data = serde_json::json!({
            "conversationId": conversation.id,
            "messageId": message.id,
            "senderName": message.sender_name,
            "preview": i18n::preview(&message.body),
        });
        self.spawn_dispatch(NotificationKind::ChatMessage, scope, data, Some(message.sender_id.clone()));
    }
}
