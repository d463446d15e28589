use crate::common::models::{UserId, UserRef};
use crate::server::database::{now_millis, Database};
use crate::server::error::{ChatError, Result};
use async_trait::async_trait;
use log::info;
use sqlx::Row;

/// Lookup of known users. Authentication lives outside this crate.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_by_email(&self, email: &str) -> Result<Option<UserRef>>;
    async fn find_by_id(&self, user_id: UserId) -> Result<Option<UserRef>>;
}

fn user_from_row(row: &sqlx::sqlite::SqliteRow) -> UserRef {
    UserRef {
        id: row.get("id"),
        email: row.get("email"),
        username: row.get("username"),
    }
}

#[async_trait]
impl UserDirectory for Database {
    async fn find_by_email(&self, email: &str) -> Result<Option<UserRef>> {
        let row = sqlx::query("SELECT id, email, username FROM users WHERE email = ?")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(user_from_row))
    }

    async fn find_by_id(&self, user_id: UserId) -> Result<Option<UserRef>> {
        let row = sqlx::query("SELECT id, email, username FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(user_from_row))
    }
}

impl Database {
    pub async fn register_user(&self, email: &str, username: &str) -> Result<UserRef> {
        let email = email.trim();
        let username = username.trim();
        if email.is_empty() || username.is_empty() {
            return Err(ChatError::invalid_message("email and username are required"));
        }
        if self.find_by_email(email).await?.is_some() {
            return Err(ChatError::invalid_message(format!("email already registered: {}", email)));
        }
        let taken = sqlx::query("SELECT 1 FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?
            .is_some();
        if taken {
            return Err(ChatError::invalid_message(format!("username already taken: {}", username)));
        }

        let id = sqlx::query("INSERT INTO users (email, username, created_at) VALUES (?, ?, ?)")
            .bind(email)
            .bind(username)
            .bind(now_millis())
            .execute(&self.pool)
            .await?
            .last_insert_rowid();
        info!("[USERS] Registered {} as user {}", username, id);

        Ok(UserRef { id, email: email.to_string(), username: username.to_string() })
    }
}
