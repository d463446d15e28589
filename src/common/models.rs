// Models shared by the relay, the broker payloads and the gateway frames
use serde::{Serialize, Deserialize};
use chrono::{DateTime, Utc};
use std::fmt;

/// Label rendered in place of a user name for relay-generated notices.
pub const SYSTEM_LABEL: &str = "[notice]";

pub type RoomId = String;
pub type UserId = i64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum RoomType {
    Private,
    Group,
}

impl RoomType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomType::Private => "PRIVATE",
            RoomType::Group => "GROUP",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PRIVATE" => Some(RoomType::Private),
            "GROUP" => Some(RoomType::Group),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    Talk,
    Enter,
    Quit,
    System,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Talk => "TALK",
            MessageType::Enter => "ENTER",
            MessageType::Quit => "QUIT",
            MessageType::System => "SYSTEM",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "TALK" => Some(MessageType::Talk),
            "ENTER" => Some(MessageType::Enter),
            "QUIT" => Some(MessageType::Quit),
            "SYSTEM" => Some(MessageType::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserRef {
    pub id: UserId,
    pub email: String,
    pub username: String,
}

/// Who a persisted message is attributed to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Sender {
    User(UserRef),
    System,
}

impl Sender {
    pub fn label(&self) -> &str {
        match self {
            Sender::User(user) => &user.username,
            Sender::System => SYSTEM_LABEL,
        }
    }

    pub fn user_id(&self) -> Option<UserId> {
        match self {
            Sender::User(user) => Some(user.id),
            Sender::System => None,
        }
    }
}

impl fmt::Display for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Identity of whoever invokes a relay operation. Passed explicitly on every call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    User { email: String },
    System,
}

impl Caller {
    pub fn user(email: impl Into<String>) -> Self {
        Caller::User { email: email.into() }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ParticipantStatus {
    Joined,
    Left,
}

impl ParticipantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipantStatus::Joined => "JOINED",
            ParticipantStatus::Left => "LEFT",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "JOINED" => Some(ParticipantStatus::Joined),
            "LEFT" => Some(ParticipantStatus::Left),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Participant {
    pub id: i64,
    pub user_id: UserId,
    pub room_id: RoomId,
    /// Last time the user left the room; set to the join time on creation.
    pub exit_time: DateTime<Utc>,
    pub status: ParticipantStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatRoom {
    pub room_id: RoomId,
    pub room_type: RoomType,
    pub created_at: DateTime<Utc>,
    pub participants: Vec<Participant>,
}

impl ChatRoom {
    /// Number of participants that have not left the room.
    pub fn roster_size(&self) -> usize {
        self.participants
            .iter()
            .filter(|p| p.status == ParticipantStatus::Joined)
            .count()
    }
}

/// Inbound payload from a client session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessageRequest {
    pub room_id: RoomId,
    pub message_type: MessageType,
    pub body: String,
}

/// A message that passed validation and is about to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    pub room_id: RoomId,
    pub sender: Sender,
    pub message_type: MessageType,
    pub body: String,
}

/// Row handed to the message store, unread snapshot already computed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChatMessage {
    pub room_id: RoomId,
    pub sender: Sender,
    pub message_type: MessageType,
    pub body: String,
    pub unread_count: i64,
}

/// Persisted chat message. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: i64,
    pub room_id: RoomId,
    pub sender: Sender,
    pub message_type: MessageType,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub unread_count: i64,
}

/// What goes over the broker and back to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessageResponse {
    pub id: i64,
    pub room_id: RoomId,
    pub sender: String,
    pub message_type: MessageType,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub unread_count: i64,
    #[serde(default)]
    pub read: bool,
}

impl ChatMessageResponse {
    pub fn mark_read(&mut self) {
        self.read = true;
    }
}

impl From<&ChatMessage> for ChatMessageResponse {
    fn from(message: &ChatMessage) -> Self {
        Self {
            id: message.id,
            room_id: message.room_id.clone(),
            sender: message.sender.label().to_string(),
            message_type: message.message_type,
            body: message.body.clone(),
            created_at: message.created_at,
            unread_count: message.unread_count,
            read: false,
        }
    }
}

/// One page of an offset-paginated query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Page<T> {
    pub content: Vec<T>,
    pub number: u32,
    pub size: u32,
    pub total_elements: u64,
}

impl<T> Page<T> {
    pub fn total_pages(&self) -> u32 {
        if self.size == 0 {
            return 0;
        }
        self.total_elements.div_ceil(self.size as u64) as u32
    }

    pub fn has_next(&self) -> bool {
        self.number + 1 < self.total_pages()
    }

    pub fn map<U, F: FnMut(T) -> U>(self, f: F) -> Page<U> {
        Page {
            content: self.content.into_iter().map(f).collect(),
            number: self.number,
            size: self.size,
            total_elements: self.total_elements,
        }
    }
}
