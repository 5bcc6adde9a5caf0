use crate::models::{ConversationRow, MessageRow, NotificationRow, UserRow};
use crate::Database;
use anyhow::{Context, Result};
use rusqlite::Connection;
use tvdesk_types::models::Role;

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, sender_name, sender_is_admin, body, created_at, edited_at, read_at";

const NOTIFICATION_COLUMNS: &str = "id, user_id, kind, title, body, data, read_at, created_at";

impl Database {
    // -- Users --

    /// Guests are never persisted; passing `Role::Guest` is rejected by the schema.
    pub fn create_user(&self, id: &str, name: &str, email: &str, role: Role, locale: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, name, email, role, locale) VALUES (?1, ?2, ?3, ?4, ?5)",
                (id, name, email, role.as_str(), locale),
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user_by_id(conn, id))
    }

    pub fn get_admin_ids(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id FROM users WHERE role = 'admin' ORDER BY created_at")?;
            let ids = stmt
                .query_map([], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            Ok(ids)
        })
    }

    // -- Conversations --

    pub fn create_conversation(&self, id: &str, user_id: &str, subject: Option<&str>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO conversations (id, user_id, subject) VALUES (?1, ?2, ?3)",
                (id, user_id, subject),
            )?;
            Ok(())
        })
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<ConversationRow>> {
        self.with_conn(|conn| query_conversation(conn, id))
    }

    // -- Messages --

    /// Inserts a message and bumps the conversation's `updated_at` in one transaction.
    pub fn insert_message(&self, row: &MessageRow) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                &format!("INSERT INTO messages ({MESSAGE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
                rusqlite::params![
                    row.id,
                    row.conversation_id,
                    row.sender_id,
                    row.sender_name,
                    row.sender_is_admin,
                    row.body,
                    row.created_at,
                    row.edited_at,
                    row.read_at,
                ],
            )
            .with_context(|| format!("insert message into conversation {}", row.conversation_id))?;
            tx.execute(
                "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
                (&row.created_at, &row.conversation_id),
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    pub fn get_message(&self, id: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| query_message(conn, id))
    }

    /// Oldest first; `limit` keeps the newest `limit` messages.
    pub fn get_messages(&self, conversation_id: &str, limit: u32) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM (
                     SELECT *, rowid AS seq FROM messages
                     WHERE conversation_id = ?1
                     ORDER BY created_at DESC, seq DESC
                     LIMIT ?2
                 ) ORDER BY created_at ASC, seq ASC"
            ))?;
            let rows = stmt
                .query_map(rusqlite::params![conversation_id, limit], map_message)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Returns the updated row, or `None` when the message does not exist.
    pub fn update_message_body(&self, id: &str, body: &str, edited_at: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET body = ?1, edited_at = ?2 WHERE id = ?3",
                (body, edited_at, id),
            )?;
            if changed == 0 {
                return Ok(None);
            }
            query_message(conn, id)
        })
    }

    /// Deletes a message, returning the row as it was before deletion.
    pub fn delete_message(&self, id: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let existing = query_message(&tx, id)?;
            if existing.is_some() {
                tx.execute("DELETE FROM messages WHERE id = ?1", [id])?;
            }
            tx.commit()?;
            Ok(existing)
        })
    }

    // -- Unread --

    /// Unread messages in one conversation authored by the given side.
    pub fn count_unread(&self, conversation_id: &str, authored_by_admin: bool) -> Result<u32> {
        self.with_conn(|conn| {
            let count: u32 = conn.query_row(
                "SELECT COUNT(*) FROM messages
                 WHERE conversation_id = ?1 AND sender_is_admin = ?2 AND read_at IS NULL",
                rusqlite::params![conversation_id, authored_by_admin],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }

    /// Per-conversation unread counts of customer-authored messages, across all conversations.
    pub fn unread_for_admins(&self) -> Result<Vec<(String, u32)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT conversation_id, COUNT(*) FROM messages
                 WHERE sender_is_admin = 0 AND read_at IS NULL
                 GROUP BY conversation_id",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Per-conversation unread counts of admin-authored messages in conversations `user_id` owns.
    pub fn unread_for_user(&self, user_id: &str) -> Result<Vec<(String, u32)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.conversation_id, COUNT(*)
                 FROM messages m
                 JOIN conversations c ON c.id = m.conversation_id
                 WHERE c.user_id = ?1 AND m.sender_is_admin = 1 AND m.read_at IS NULL
                 GROUP BY m.conversation_id",
            )?;
            let rows = stmt
                .query_map([user_id], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Stamps `read_at` on every unread message authored by the given side.
    /// Returns the number of messages that changed.
    pub fn mark_read(&self, conversation_id: &str, authored_by_admin: bool, read_at: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET read_at = ?1
                 WHERE conversation_id = ?2 AND sender_is_admin = ?3 AND read_at IS NULL",
                rusqlite::params![read_at, conversation_id, authored_by_admin],
            )?;
            Ok(changed)
        })
    }

    // -- Notifications --

    pub fn insert_notification(&self, row: &NotificationRow) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                &format!("INSERT INTO notifications ({NOTIFICATION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
                rusqlite::params![
                    row.id,
                    row.user_id,
                    row.kind,
                    row.title,
                    row.body,
                    row.data,
                    row.read_at,
                    row.created_at,
                ],
            )?;
            Ok(())
        })
    }

    /// Newest first.
    pub fn list_notifications(&self, user_id: &str, limit: u32, offset: u32) -> Result<Vec<NotificationRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {NOTIFICATION_COLUMNS} FROM notifications
                 WHERE user_id = ?1
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT ?2 OFFSET ?3"
            ))?;
            let rows = stmt
                .query_map(rusqlite::params![user_id, limit, offset], map_notification)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn count_notifications(&self, user_id: &str, unread_only: bool) -> Result<u32> {
        self.with_conn(|conn| {
            let sql = if unread_only {
                "SELECT COUNT(*) FROM notifications WHERE user_id = ?1 AND read_at IS NULL"
            } else {
                "SELECT COUNT(*) FROM notifications WHERE user_id = ?1"
            };
            let count: u32 = conn.query_row(sql, [user_id], |row| row.get(0))?;
            Ok(count)
        })
    }

    /// Marks the given notifications (all of the user's when `ids` is `None`) as read.
    pub fn mark_notifications_read(&self, user_id: &str, ids: Option<&[String]>, read_at: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let changed = match ids {
                None => conn.execute(
                    "UPDATE notifications SET read_at = ?1 WHERE user_id = ?2 AND read_at IS NULL",
                    (read_at, user_id),
                )?,
                Some([]) => 0,
                Some(ids) => {
                    let placeholders: Vec<String> = (3..ids.len() + 3).map(|i| format!("?{}", i)).collect();
                    let sql = format!(
                        "UPDATE notifications SET read_at = ?1
                         WHERE user_id = ?2 AND read_at IS NULL AND id IN ({})",
                        placeholders.join(", ")
                    );
                    let mut params: Vec<&dyn rusqlite::types::ToSql> = vec![&read_at, &user_id];
                    params.extend(ids.iter().map(|id| id as &dyn rusqlite::types::ToSql));
                    conn.execute(&sql, params.as_slice())?
                }
            };
            Ok(changed)
        })
    }
}

fn query_user_by_id(conn: &Connection, id: &str) -> Result<Option<UserRow>> {
    let mut stmt = conn.prepare("SELECT id, name, email, role, locale, created_at FROM users WHERE id = ?1")?;

    let row = stmt
        .query_row([id], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                name: row.get(1)?,
                email: row.get(2)?,
                role: row.get(3)?,
                locale: row.get(4)?,
                created_at: row.get(5)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn query_conversation(conn: &Connection, id: &str) -> Result<Option<ConversationRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, user_id, subject, status, created_at, updated_at FROM conversations WHERE id = ?1",
    )?;

    let row = stmt
        .query_row([id], |row| {
            Ok(ConversationRow {
                id: row.get(0)?,
                user_id: row.get(1)?,
                subject: row.get(2)?,
                status: row.get(3)?,
                created_at: row.get(4)?,
                updated_at: row.get(5)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn query_message(conn: &Connection, id: &str) -> Result<Option<MessageRow>> {
    let mut stmt = conn.prepare(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"))?;
    let row = stmt.query_row([id], map_message).optional()?;
    Ok(row)
}

fn map_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        sender_name: row.get(3)?,
        sender_is_admin: row.get(4)?,
        body: row.get(5)?,
        created_at: row.get(6)?,
        edited_at: row.get(7)?,
        read_at: row.get(8)?,
    })
}

fn map_notification(row: &rusqlite::Row<'_>) -> rusqlite::Result<NotificationRow> {
    Ok(NotificationRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        kind: row.get(2)?,
        title: row.get(3)?,
        body: row.get(4)?,
        data: row.get(5)?,
        read_at: row.get(6)?,
        created_at: row.get(7)?,
    })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
