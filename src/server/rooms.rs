use crate::common::models::{ChatRoom, Participant, ParticipantStatus, RoomType, UserId};
use crate::server::database::{from_millis, now_millis, Database};
use crate::server::error::{ChatError, Result};
use async_trait::async_trait;
use log::info;
use sqlx::Row;

/// Resolves rooms and their rosters.
#[async_trait]
pub trait RoomDirectory: Send + Sync {
    async fn find_room(&self, room_id: &str) -> Result<Option<ChatRoom>>;
    async fn find_participant(&self, user_id: UserId, room_id: &str) -> Result<Option<Participant>>;
    /// Mark the participant as left and move their exit-time watermark to now.
    async fn leave_room(&self, room_id: &str, user_id: UserId) -> Result<Participant>;
}

fn participant_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Participant> {
    let status: String = row.get("status");
    Ok(Participant {
        id: row.get("id"),
        user_id: row.get("user_id"),
        room_id: row.get("room_id"),
        exit_time: from_millis(row.get("exit_time")),
        status: ParticipantStatus::parse(&status)
            .ok_or_else(|| ChatError::Storage(format!("unknown participant status {}", status)))?,
    })
}

#[async_trait]
impl RoomDirectory for Database {
    async fn find_room(&self, room_id: &str) -> Result<Option<ChatRoom>> {
        let Some(row) = sqlx::query("SELECT room_id, room_type, created_at FROM chat_rooms WHERE room_id = ?")
            .bind(room_id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };

        let room_type: String = row.get("room_type");
        let room_type = RoomType::parse(&room_type)
            .ok_or_else(|| ChatError::Storage(format!("unknown room type {}", room_type)))?;

        let participants = sqlx::query("SELECT id, user_id, room_id, exit_time, status FROM participants WHERE room_id = ? ORDER BY id")
            .bind(room_id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(participant_from_row)
            .collect::<Result<Vec<_>>>()?;

        Ok(Some(ChatRoom {
            room_id: row.get("room_id"),
            room_type,
            created_at: from_millis(row.get("created_at")),
            participants,
        }))
    }

    async fn find_participant(&self, user_id: UserId, room_id: &str) -> Result<Option<Participant>> {
        let row = sqlx::query("SELECT id, user_id, room_id, exit_time, status FROM participants WHERE user_id = ? AND room_id = ?")
            .bind(user_id)
            .bind(room_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(participant_from_row).transpose()
    }

    async fn leave_room(&self, room_id: &str, user_id: UserId) -> Result<Participant> {
        let updated = sqlx::query("UPDATE participants SET status = ?, exit_time = ? WHERE user_id = ? AND room_id = ?")
            .bind(ParticipantStatus::Left.as_str())
            .bind(now_millis())
            .bind(user_id)
            .bind(room_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(ChatError::participant_not_found(room_id, user_id.to_string()));
        }

        info!("[ROOMS] User {} left room {}", user_id, room_id);
        self.find_participant(user_id, room_id)
            .await?
            .ok_or_else(|| ChatError::participant_not_found(room_id, user_id.to_string()))
    }
}

impl Database {
    /// Create a room and join its creator.
    pub async fn create_room(&self, room_type: RoomType, creator: UserId) -> Result<ChatRoom> {
        let room_id = uuid::Uuid::new_v4().to_string();
        let now = now_millis();

        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO chat_rooms (room_id, room_type, created_at) VALUES (?, ?, ?)")
            .bind(&room_id)
            .bind(room_type.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO participants (user_id, room_id, exit_time, status) VALUES (?, ?, ?, ?)")
            .bind(creator)
            .bind(&room_id)
            .bind(now)
            .bind(ParticipantStatus::Joined.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!("[ROOMS] {} room {} created by user {}", room_type.as_str(), room_id, creator);
        self.find_room(&room_id).await?.ok_or_else(|| ChatError::room_not_found(room_id))
    }

    /// Join a room. Rejoining reuses the existing participant row.
    pub async fn join_room(&self, room_id: &str, user_id: UserId) -> Result<Participant> {
        let mut tx = self.pool.begin().await?;
        if sqlx::query("SELECT 1 FROM chat_rooms WHERE room_id = ?")
            .bind(room_id)
            .fetch_optional(&mut *tx)
            .await?
            .is_none()
        {
            return Err(ChatError::room_not_found(room_id));
        }

        let existing = sqlx::query("SELECT id, status FROM participants WHERE user_id = ? AND room_id = ?")
            .bind(user_id)
            .bind(room_id)
            .fetch_optional(&mut *tx)
            .await?;

        match existing {
            Some(row) => {
                let status: String = row.get("status");
                if status != ParticipantStatus::Joined.as_str() {
                    sqlx::query("UPDATE participants SET status = ? WHERE id = ?")
                        .bind(ParticipantStatus::Joined.as_str())
                        .bind(row.get::<i64, _>("id"))
                        .execute(&mut *tx)
                        .await?;
                }
            }
            None => {
                // private-room cap is checked by the insert itself
                let inserted = sqlx::query(
                    "INSERT INTO participants (user_id, room_id, exit_time, status)
                     SELECT ?, ?, ?, ?
                     WHERE (SELECT room_type FROM chat_rooms WHERE room_id = ?) <> ?
                        OR (SELECT COUNT(*) FROM participants WHERE room_id = ?) < 2",
                )
                .bind(user_id)
                .bind(room_id)
                .bind(now_millis())
                .bind(ParticipantStatus::Joined.as_str())
                .bind(room_id)
                .bind(RoomType::Private.as_str())
                .bind(room_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
                if inserted == 0 {
                    return Err(ChatError::invalid_message(format!("private room {} already has two participants", room_id)));
                }
            }
        }
        tx.commit().await?;

        info!("[ROOMS] User {} joined room {}", user_id, room_id);
        self.find_participant(user_id, room_id)
            .await?
            .ok_or_else(|| ChatError::Storage(format!("participant {} vanished from {}", user_id, room_id)))
    }

    /// Delete a room; participants go with it, messages stay.
    pub async fn delete_room(&self, room_id: &str) -> Result<()> {
        let deleted = sqlx::query("DELETE FROM chat_rooms WHERE room_id = ?")
            .bind(room_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if deleted == 0 {
            return Err(ChatError::room_not_found(room_id));
        }
        Ok(())
    }
}
