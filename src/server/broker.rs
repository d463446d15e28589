use crate::common::models::ChatMessageResponse;
use crate::server::error::{ChatError, Result};
use crate::server::hub::SessionHub;
use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use redis::aio::ConnectionManager;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

const ROOM_TOPIC_PREFIX: &str = "chat:room:";

/// Pattern matching every room topic.
pub const ROOM_TOPIC_PATTERN: &str = "chat:room:*";

/// Broker channel carrying one room's messages. A pure function of the room
/// id, so every instance subscribing to a room lands on the same channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic(String);

impl Topic {
    pub fn for_room(room_id: &str) -> Self {
        Topic(format!("{}{}", ROOM_TOPIC_PREFIX, room_id))
    }

    pub fn parse(channel: &str) -> Option<Self> {
        match channel.strip_prefix(ROOM_TOPIC_PREFIX) {
            Some(room_id) if !room_id.is_empty() => Some(Topic(channel.to_string())),
            _ => None,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.0[ROOM_TOPIC_PREFIX.len()..]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fire-and-forget publish. One attempt per call, no delivery receipt.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &Topic, message: &ChatMessageResponse) -> Result<()>;
}

pub struct RedisPublisher {
    redis_manager: Arc<Mutex<ConnectionManager>>,
}

impl RedisPublisher {
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let redis_manager = ConnectionManager::new(client).await?;
        Ok(Self { redis_manager: Arc::new(Mutex::new(redis_manager)) })
    }
}

#[async_trait]
impl Publisher for RedisPublisher {
    async fn publish(&self, topic: &Topic, message: &ChatMessageResponse) -> Result<()> {
        let serialized = serde_json::to_string(message)?;
        let mut conn = self.redis_manager.lock().await;
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(topic.as_str())
            .arg(&serialized)
            .query_async(&mut *conn)
            .await
            .map_err(|e| ChatError::broker_unavailable(e.to_string()))?;
        debug!("[BROKER] Published message {} on {} ({} instances)", message.id, topic, receivers);
        Ok(())
    }
}

/// Single-instance publisher: hands the payload straight to local sessions.
pub struct LocalPublisher {
    hub: SessionHub,
}

impl LocalPublisher {
    pub fn new(hub: SessionHub) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl Publisher for LocalPublisher {
    async fn publish(&self, topic: &Topic, message: &ChatMessageResponse) -> Result<()> {
        let serialized = serde_json::to_string(message)?;
        let delivered = self.hub.deliver(topic.room_id(), &serialized).await;
        debug!("[BROKER] Delivered message {} on {} to {} local sessions", message.id, topic, delivered);
        Ok(())
    }
}

/// Route a payload received on `channel` to the local sessions of its room.
pub async fn forward_to_hub(hub: &SessionHub, channel: &str, payload: &str) -> Option<usize> {
    let Some(topic) = Topic::parse(channel) else {
        warn!("[BROKER] Ignoring message on foreign channel '{}'", channel);
        return None;
    };
    Some(hub.deliver(topic.room_id(), payload).await)
}

/// Pattern-subscribes to all room topics and rebroadcasts to local sessions.
pub struct RedisSubscriber;

impl RedisSubscriber {
    pub fn spawn(redis_url: String, hub: SessionHub) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("[BROKER] Starting Redis pub/sub subscriber...");
            loop {
                if let Err(e) = Self::listen(&redis_url, &hub).await {
                    error!("[BROKER] Subscriber error: {}", e);
                }
                warn!("[BROKER] Redis subscriber disconnected, retrying in 5 seconds...");
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        })
    }

    async fn listen(redis_url: &str, hub: &SessionHub) -> anyhow::Result<()> {
        let client = redis::Client::open(redis_url)?;
        let mut pubsub = client.get_async_connection().await?.into_pubsub();
        pubsub.psubscribe(ROOM_TOPIC_PATTERN).await?;
        info!("[BROKER] Subscribed to {}", ROOM_TOPIC_PATTERN);

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let channel = msg.get_channel_name().to_string();
            let payload: String = match msg.get_payload() {
                Ok(p) => p,
                Err(e) => {
                    warn!("[BROKER] Unreadable payload on '{}': {}", channel, e);
                    continue;
                }
            };
            if let Some(delivered) = forward_to_hub(hub, &channel, &payload).await {
                debug!("[BROKER] '{}' -> {} local sessions", channel, delivered);
            }
        }

        info!("[BROKER] Redis stream ended");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::models::MessageType;

    fn response(room_id: &str) -> ChatMessageResponse {
        ChatMessageResponse {
            id: 1,
            room_id: room_id.to_string(),
            sender: "alice".to_string(),
            message_type: MessageType::Talk,
            body: "hello".to_string(),
            created_at: chrono::Utc::now(),
            unread_count: 0,
            read: false,
        }
    }

    #[test]
    fn topic_is_a_pure_function_of_the_room() {
        assert_eq!(Topic::for_room("R1"), Topic::for_room("R1"));
        assert_ne!(Topic::for_room("R1"), Topic::for_room("R2"));
        assert_eq!(Topic::for_room("R1").as_str(), "chat:room:R1");
        assert_eq!(Topic::for_room("R1").room_id(), "R1");
    }

    #[test]
    fn parse_accepts_only_room_topics() {
        let topic = Topic::parse("chat:room:abc-123").unwrap();
        assert_eq!(topic.room_id(), "abc-123");
        assert_eq!(topic, Topic::for_room("abc-123"));
        assert!(Topic::parse("chat:room:").is_none());
        assert!(Topic::parse("system").is_none());
    }

    #[tokio::test]
    async fn forwards_only_to_the_topics_room() {
        let hub = SessionHub::new(10);
        let (_, mut in_room) = hub.register("r1", 1).await.unwrap();
        let (_, mut elsewhere) = hub.register("r2", 2).await.unwrap();

        assert_eq!(forward_to_hub(&hub, "chat:room:r1", "payload").await, Some(1));
        assert_eq!(forward_to_hub(&hub, "notifications", "payload").await, None);

        assert_eq!(in_room.recv().await.as_deref(), Some("payload"));
        assert!(elsewhere.try_recv().is_err());
    }

    #[tokio::test]
    async fn local_publisher_delivers_json() {
        let hub = SessionHub::new(10);
        let (_, mut rx) = hub.register("r1", 1).await.unwrap();
        let publisher = LocalPublisher::new(hub);

        publisher.publish(&Topic::for_room("r1"), &response("r1")).await.unwrap();
        let frame = rx.recv().await.unwrap();
        let decoded: ChatMessageResponse = serde_json::from_str(&frame).unwrap();
        assert_eq!(decoded.body, "hello");
    }
}
