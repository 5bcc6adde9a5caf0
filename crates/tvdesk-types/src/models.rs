use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A conversation identifier doubling as the name of its real-time room.
pub type RoomId = String;

/// Prefix for synthesized guest user ids.
pub const GUEST_PREFIX: &str = "guest-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Guest,
    User,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Guest => "guest",
            Self::User => "user",
            Self::Admin => "admin",
        }
    }

    /// Parses a role name, case-insensitively. Unknown names yield `None`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "guest" => Some(Self::Guest),
            "user" => Some(Self::User),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Self::Admin)
    }
}

/// The identity bound to one live connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: String,
    pub role: Role,
    pub display_name: String,
}

impl Identity {
    pub fn is_guest(&self) -> bool {
        self.role == Role::Guest
    }
}

/// Returns true for ids synthesized for unauthenticated connections.
pub fn is_guest_id(user_id: &str) -> bool {
    user_id.starts_with(GUEST_PREFIX)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    /// Owner of the conversation (the customer side).
    pub user_id: String,
    pub subject: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub sender_is_admin: bool,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
}

/// Full resync payload for one room.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationWithMessages {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    FreeTrialRequested,
    FreeTrialActivated,
    SubscriptionCreated,
    SubscriptionActivated,
    SubscriptionExpiring,
    PaymentReceived,
    ChatMessage,
}

impl NotificationKind {
    pub const ALL: [NotificationKind; 7] = [
        Self::FreeTrialRequested,
        Self::FreeTrialActivated,
        Self::SubscriptionCreated,
        Self::SubscriptionActivated,
        Self::SubscriptionExpiring,
        Self::PaymentReceived,
        Self::ChatMessage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FreeTrialRequested => "free_trial_requested",
            Self::FreeTrialActivated => "free_trial_activated",
            Self::SubscriptionCreated => "subscription_created",
            Self::SubscriptionActivated => "subscription_activated",
            Self::SubscriptionExpiring => "subscription_expiring",
            Self::PaymentReceived => "payment_received",
            Self::ChatMessage => "chat_message",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

/// Who a notification is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum NotificationScope {
    User { user_id: String },
    Admins,
    Both { user_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    /// Structured context the client may use to deep-link (conversation id, plan, ...).
    pub data: serde_json::Value,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}
