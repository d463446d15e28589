//! Error handling for the chat relay

use std::fmt;

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, ChatError>;

/// Relay error kinds. None of them is retried internally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    /// Sender or requester does not resolve to a known user
    UserNotFound(String),
    /// Room id does not resolve to an existing room
    RoomNotFound(String),
    /// Requester is not a participant of the room
    ParticipantNotFound { room_id: String, email: String },
    /// Broker could not take the publish. `persisted` holds the row id when
    /// the message had already been stored before the publish attempt.
    BrokerUnavailable { reason: String, persisted: Option<i64> },
    /// Payload rejected before any persistence
    InvalidMessage(String),
    /// Durable store failure
    Storage(String),
    /// Serialization/deserialization errors
    Serialization(String),
}

impl ChatError {
    /// Get error code for this error type
    pub fn code(&self) -> u32 {
        match self {
            ChatError::UserNotFound(_) => 1006,
            ChatError::RoomNotFound(_) => 1007,
            ChatError::ParticipantNotFound { .. } => 1008,
            ChatError::BrokerUnavailable { .. } => 1013,
            ChatError::InvalidMessage(_) => 1005,
            ChatError::Storage(_) => 1009,
            ChatError::Serialization(_) => 1001,
        }
    }

    pub fn user_not_found<T: Into<String>>(who: T) -> Self {
        ChatError::UserNotFound(who.into())
    }

    pub fn room_not_found<T: Into<String>>(room_id: T) -> Self {
        ChatError::RoomNotFound(room_id.into())
    }

    pub fn participant_not_found<R: Into<String>, E: Into<String>>(room_id: R, email: E) -> Self {
        ChatError::ParticipantNotFound { room_id: room_id.into(), email: email.into() }
    }

    pub fn broker_unavailable<T: Into<String>>(reason: T) -> Self {
        ChatError::BrokerUnavailable { reason: reason.into(), persisted: None }
    }

    pub fn invalid_message<T: Into<String>>(msg: T) -> Self {
        ChatError::InvalidMessage(msg.into())
    }

    /// Attach the id of the already-committed row to a broker failure.
    pub fn after_persist(self, message_id: i64) -> Self {
        match self {
            ChatError::BrokerUnavailable { reason, .. } => {
                ChatError::BrokerUnavailable { reason, persisted: Some(message_id) }
            }
            other => other,
        }
    }

    /// True when the message is durably stored despite this error.
    pub fn is_persisted(&self) -> bool {
        matches!(self, ChatError::BrokerUnavailable { persisted: Some(_), .. })
    }
}

impl fmt::Display for ChatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatError::UserNotFound(who) => write!(f, "User not found: {}", who),
            ChatError::RoomNotFound(room_id) => write!(f, "Room not found: {}", room_id),
            ChatError::ParticipantNotFound { room_id, email } => {
                write!(f, "Participant not found: {} in room {}", email, room_id)
            }
            ChatError::BrokerUnavailable { reason, persisted: Some(id) } => {
                write!(f, "Broker unavailable (message {} stored, not delivered): {}", id, reason)
            }
            ChatError::BrokerUnavailable { reason, persisted: None } => {
                write!(f, "Broker unavailable: {}", reason)
            }
            ChatError::InvalidMessage(msg) => write!(f, "Invalid message: {}", msg),
            ChatError::Storage(msg) => write!(f, "Storage error: {}", msg),
            ChatError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
        }
    }
}

impl std::error::Error for ChatError {}

impl From<sqlx::Error> for ChatError {
    fn from(err: sqlx::Error) -> Self {
        ChatError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        ChatError::Serialization(err.to_string())
    }
}

impl From<redis::RedisError> for ChatError {
    fn from(err: redis::RedisError) -> Self {
        ChatError::BrokerUnavailable { reason: err.to_string(), persisted: None }
    }
}
