use crate::common::models::{ChatMessage, MessageType, NewChatMessage, Page, Sender, UserRef};
use crate::server::database::{from_millis, now_millis, Database};
use crate::server::error::{ChatError, Result};
use async_trait::async_trait;
use log::{debug, warn};
use sqlx::Row;

/// Durable message storage.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Write a message row; the store assigns id and creation time.
    async fn save(&self, message: NewChatMessage) -> Result<ChatMessage>;

    /// Messages of a room, newest first. `page` is zero-based.
    async fn find_page(&self, room_id: &str, page: u32, size: u32) -> Result<Page<ChatMessage>>;
}

/// Point-in-time estimate of how many participants have not seen a message:
/// roster minus connected participants minus the sender.
///
/// A negative raw value means presence reported more connected users than the
/// roster holds (stale presence data). It is clamped to zero and logged.
pub fn unread_count(roster_size: usize, active_count: usize) -> i64 {
    let raw = roster_size as i64 - active_count as i64 - 1;
    if raw < 0 {
        warn!(
            "[RELAY] stale presence: roster {} but {} active, unread estimate {} clamped to 0",
            roster_size, active_count, raw
        );
        return 0;
    }
    raw
}

fn message_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ChatMessage> {
    let sender_id: Option<i64> = row.get("sender_id");
    let sender = match sender_id {
        Some(id) => Sender::User(UserRef {
            id,
            email: row.get::<Option<String>, _>("email").unwrap_or_default(),
            username: row.get::<Option<String>, _>("username").unwrap_or_default(),
        }),
        None => Sender::System,
    };
    let message_type: String = row.get("message_type");

    Ok(ChatMessage {
        id: row.get("id"),
        room_id: row.get("room_id"),
        sender,
        message_type: MessageType::parse(&message_type)
            .ok_or_else(|| ChatError::Storage(format!("unknown message type {}", message_type)))?,
        body: row.get("body"),
        created_at: from_millis(row.get("created_at")),
        unread_count: row.get("unread_count"),
    })
}

#[async_trait]
impl MessageStore for Database {
    async fn save(&self, message: NewChatMessage) -> Result<ChatMessage> {
        let created_at = now_millis();
        let id = sqlx::query("INSERT INTO chat_messages (room_id, sender_id, message_type, body, created_at, unread_count) VALUES (?, ?, ?, ?, ?, ?)")
            .bind(&message.room_id)
            .bind(message.sender.user_id())
            .bind(message.message_type.as_str())
            .bind(&message.body)
            .bind(created_at)
            .bind(message.unread_count)
            .execute(&self.pool)
            .await?
            .last_insert_rowid();
        debug!("[DB] Stored message {} in room {}", id, message.room_id);

        Ok(ChatMessage {
            id,
            room_id: message.room_id,
            sender: message.sender,
            message_type: message.message_type,
            body: message.body,
            created_at: from_millis(created_at),
            unread_count: message.unread_count,
        })
    }

    async fn find_page(&self, room_id: &str, page: u32, size: u32) -> Result<Page<ChatMessage>> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chat_messages WHERE room_id = ?")
            .bind(room_id)
            .fetch_one(&self.pool)
            .await?;

        let rows = sqlx::query(r#"
            SELECT m.id, m.room_id, m.sender_id, m.message_type, m.body, m.created_at, m.unread_count,
                   u.email, u.username
            FROM chat_messages m
            LEFT JOIN users u ON u.id = m.sender_id
            WHERE m.room_id = ?
            ORDER BY m.created_at DESC, m.id DESC
            LIMIT ? OFFSET ?
        "#)
            .bind(room_id)
            .bind(size as i64)
            .bind(page as i64 * size as i64)
            .fetch_all(&self.pool)
            .await?;

        Ok(Page {
            content: rows.iter().map(message_from_row).collect::<Result<Vec<_>>>()?,
            number: page,
            size,
            total_elements: total.max(0) as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn talk(room_id: &str, sender: Sender, body: &str) -> NewChatMessage {
        NewChatMessage {
            room_id: room_id.to_string(),
            sender,
            message_type: MessageType::Talk,
            body: body.to_string(),
            unread_count: 0,
        }
    }

    #[test]
    fn unread_excludes_active_participants_and_sender() {
        assert_eq!(unread_count(5, 3), 1);
        assert_eq!(unread_count(2, 0), 1);
        assert_eq!(unread_count(2, 1), 0);
    }

    #[test]
    fn negative_estimate_is_clamped_to_zero() {
        // presence reports more connected users than the roster holds
        assert_eq!(unread_count(2, 2), 0);
        assert_eq!(unread_count(1, 4), 0);
        assert_eq!(unread_count(0, 0), 0);
    }

    #[tokio::test]
    async fn save_keeps_the_unread_snapshot_and_sender() {
        let db = Database::in_memory().await.unwrap();
        let alice = db.register_user("alice@example.com", "alice").await.unwrap();

        let mut message = talk("r1", Sender::User(alice.clone()), "hi");
        message.unread_count = 3;
        let saved = db.save(message).await.unwrap();
        assert_eq!(saved.unread_count, 3);

        let page = db.find_page("r1", 0, 100).await.unwrap();
        assert_eq!(page.content, vec![saved]);
        assert_eq!(page.content[0].sender, Sender::User(alice));
    }

    #[tokio::test]
    async fn system_messages_have_no_user_reference() {
        let db = Database::in_memory().await.unwrap();
        db.save(talk("r1", Sender::System, "notice")).await.unwrap();

        let page = db.find_page("r1", 0, 100).await.unwrap();
        assert_eq!(page.content[0].sender, Sender::System);
    }

    #[tokio::test]
    async fn pages_are_newest_first_and_bounded() {
        let db = Database::in_memory().await.unwrap();
        for i in 0..7 {
            db.save(talk("r1", Sender::System, &format!("m{}", i))).await.unwrap();
        }
        db.save(talk("other", Sender::System, "elsewhere")).await.unwrap();

        let first = db.find_page("r1", 0, 3).await.unwrap();
        assert_eq!(first.total_elements, 7);
        assert_eq!(first.total_pages(), 3);
        let bodies: Vec<&str> = first.content.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["m6", "m5", "m4"]);

        let last = db.find_page("r1", 2, 3).await.unwrap();
        assert_eq!(last.content.len(), 1);
        assert_eq!(last.content[0].body, "m0");
        assert!(!last.has_next());

        for pair in first.content.windows(2) {
            assert!((pair[0].created_at, pair[0].id) > (pair[1].created_at, pair[1].id));
        }
    }
}
