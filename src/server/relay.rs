//! Chat relay: validates, persists and publishes chat messages, and serves
//! room history.
//!
//! Persistence and publish hit two different systems with no transaction
//! spanning them. A stored message whose publish fails stays stored and is
//! reachable through [`ChatRelay::get_saved_messages`].

use crate::common::models::{
    Caller, ChatMessage, ChatMessageRequest, ChatMessageResponse, MessageType, NewChatMessage, Page,
    ParticipantStatus, PendingMessage, RoomType, Sender,
};
use crate::server::broker::{Publisher, Topic};
use crate::server::config::{ServerConfig, HISTORY_PAGE_SIZE};
use crate::server::error::{ChatError, Result};
use crate::server::messages::{unread_count, MessageStore};
use crate::server::presence::PresenceOracle;
use crate::server::rooms::RoomDirectory;
use crate::server::users::UserDirectory;
use log::{debug, info, warn};
use std::sync::Arc;

pub struct ChatRelay {
    users: Arc<dyn UserDirectory>,
    rooms: Arc<dyn RoomDirectory>,
    messages: Arc<dyn MessageStore>,
    presence: Arc<dyn PresenceOracle>,
    publisher: Arc<dyn Publisher>,
    max_message_length: usize,
}

/// Body of the notice that replaces a QUIT event.
pub fn quit_notice(room_type: RoomType, username: &str) -> String {
    match room_type {
        RoomType::Private => format!("{} left the chat; please continue in a new room.", username),
        RoomType::Group => format!("{} left the chat.", username),
    }
}

impl ChatRelay {
    pub fn new(
        users: Arc<dyn UserDirectory>,
        rooms: Arc<dyn RoomDirectory>,
        messages: Arc<dyn MessageStore>,
        presence: Arc<dyn PresenceOracle>,
        publisher: Arc<dyn Publisher>,
        config: &ServerConfig,
    ) -> Self {
        Self {
            users,
            rooms,
            messages,
            presence,
            publisher,
            max_message_length: config.max_message_length,
        }
    }

    /// Validate, persist, then publish one message.
    ///
    /// Exactly one row is written and one publish attempted per successful
    /// validation. A publish failure comes back as `BrokerUnavailable` with
    /// `persisted` set; the row is not rolled back.
    ///
    /// A QUIT from a user is stored as a notice and takes the user off the
    /// roster before the notice is published.
    pub async fn send(&self, request: ChatMessageRequest, caller: &Caller) -> Result<ChatMessage> {
        if request.body.chars().count() > self.max_message_length {
            return Err(ChatError::invalid_message(format!(
                "message too long (max {} chars)",
                self.max_message_length
            )));
        }

        let sender = match caller {
            Caller::User { email } => Sender::User(
                self.users
                    .find_by_email(email)
                    .await?
                    .ok_or_else(|| ChatError::user_not_found(email.as_str()))?,
            ),
            Caller::System => Sender::System,
        };
        let room = self
            .rooms
            .find_room(&request.room_id)
            .await?
            .ok_or_else(|| ChatError::room_not_found(request.room_id.as_str()))?;

        let mut pending = PendingMessage {
            room_id: room.room_id.clone(),
            sender,
            message_type: request.message_type,
            body: request.body,
        };
        let mut quitter = None;
        if pending.message_type == MessageType::Quit {
            if let Sender::User(user) = &pending.sender {
                self.rooms
                    .find_participant(user.id, &room.room_id)
                    .await?
                    .filter(|p| p.status == ParticipantStatus::Joined)
                    .ok_or_else(|| ChatError::participant_not_found(room.room_id.as_str(), user.email.as_str()))?;
                pending.body = quit_notice(room.room_type, &user.username);
                quitter = Some(user.id);
                pending.sender = Sender::System;
            }
        }

        let message = self.persist(pending).await?;
        info!("[RELAY] Message {} stored in room {} (unread={})", message.id, message.room_id, message.unread_count);

        if let Some(user_id) = quitter {
            self.rooms.leave_room(&message.room_id, user_id).await?;
        }

        self.publish(&message).await?;
        Ok(message)
    }

    /// Post a relay-generated notice to a room.
    pub async fn send_notice(&self, room_id: &str, body: &str) -> Result<ChatMessage> {
        let request = ChatMessageRequest {
            room_id: room_id.to_string(),
            message_type: MessageType::System,
            body: body.to_string(),
        };
        self.send(request, &Caller::System).await
    }

    /// Compute the unread snapshot and write the row.
    pub async fn persist(&self, pending: PendingMessage) -> Result<ChatMessage> {
        let active = self.presence.active_count(&pending.room_id).await?;
        let room = self
            .rooms
            .find_room(&pending.room_id)
            .await?
            .ok_or_else(|| ChatError::room_not_found(pending.room_id.as_str()))?;
        let unread = unread_count(room.roster_size(), active);
        debug!("[RELAY] Room {} roster={} active={} unread={}", room.room_id, room.roster_size(), active, unread);

        let sender = match pending.sender {
            Sender::User(user) => Sender::User(
                self.users
                    .find_by_id(user.id)
                    .await?
                    .ok_or_else(|| ChatError::user_not_found(user.email))?,
            ),
            Sender::System => Sender::System,
        };

        self.messages
            .save(NewChatMessage {
                room_id: pending.room_id,
                sender,
                message_type: pending.message_type,
                body: pending.body,
                unread_count: unread,
            })
            .await
    }

    async fn publish(&self, message: &ChatMessage) -> Result<()> {
        let topic = Topic::for_room(&message.room_id);
        self.publisher
            .publish(&topic, &ChatMessageResponse::from(message))
            .await
            .map_err(|e| {
                let e = match e {
                    ChatError::BrokerUnavailable { .. } => e,
                    other => ChatError::broker_unavailable(other.to_string()),
                }
                .after_persist(message.id);
                warn!("[RELAY] {}", e);
                e
            })
    }

    /// One page of a room's history, newest first, for a participant of the room.
    /// Messages created at or after the requester's exit-time watermark are
    /// flagged `read`; the flag is never written back.
    pub async fn get_saved_messages(&self, room_id: &str, caller: &Caller, page: u32) -> Result<Page<ChatMessageResponse>> {
        let email = match caller {
            Caller::User { email } => email,
            Caller::System => return Err(ChatError::user_not_found("system")),
        };
        let user = self
            .users
            .find_by_email(email)
            .await?
            .ok_or_else(|| ChatError::user_not_found(email.as_str()))?;
        let room = self
            .rooms
            .find_room(room_id)
            .await?
            .ok_or_else(|| ChatError::room_not_found(room_id))?;
        let participant = self
            .rooms
            .find_participant(user.id, &room.room_id)
            .await?
            .ok_or_else(|| ChatError::participant_not_found(room_id, email.as_str()))?;

        let messages = self.messages.find_page(&room.room_id, page, HISTORY_PAGE_SIZE).await?;
        Ok(messages.map(|message| {
            let mut response = ChatMessageResponse::from(&message);
            if message.created_at >= participant.exit_time {
                response.mark_read();
            }
            response
        }))
    }
}
