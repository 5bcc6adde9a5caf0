//! Database row types, one per SQLite table. Timestamps stay as TEXT here;
//! the gateway converts them into typed models.

pub struct UserRow {
    pub id: String,
    pub name: String,
    pub email: String,
    pub role: String,
    pub locale: String,
    pub created_at: String,
}

pub struct ConversationRow {
    pub id: String,
    pub user_id: String,
    pub subject: Option<String>,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Clone)]
pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub sender_is_admin: bool,
    pub body: String,
    pub created_at: String,
    pub edited_at: Option<String>,
    pub read_at: Option<String>,
}

#[derive(Clone)]
pub struct NotificationRow {
    pub id: String,
    pub user_id: String,
    pub kind: String,
    pub title: String,
    pub body: String,
    /// JSON text.
    pub data: String,
    pub read_at: Option<String>,
    pub created_at: String,
}
