use crate::common::models::UserId;
use crate::server::broker::Topic;
use crate::server::error::Result;
use async_trait::async_trait;
use log::debug;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Lifetime of a room's shared presence hash without any refresh.
pub const PRESENCE_TTL_SECS: u64 = 90;
/// How often a live session refreshes its room's presence.
pub const PRESENCE_HEARTBEAT: Duration = Duration::from_secs(30);

/// Live view of which participants are connected to a room right now.
/// Counts are approximate: they can change between the read and its use.
#[async_trait]
pub trait PresenceOracle: Send + Sync {
    async fn enter(&self, room_id: &str, user_id: UserId) -> Result<()>;
    async fn leave(&self, room_id: &str, user_id: UserId) -> Result<()>;
    /// Distinct users with at least one live connection in the room.
    async fn active_count(&self, room_id: &str) -> Result<usize>;
    /// Keep the room's presence alive while a session is connected.
    async fn refresh(&self, _room_id: &str) -> Result<()> {
        Ok(())
    }
}

// room_id -> user_id -> open connections
#[derive(Clone, Default)]
pub struct PresenceRegistry {
    inner: Arc<Mutex<HashMap<String, HashMap<UserId, usize>>>>,
}

impl PresenceRegistry {
    pub fn new() -> Self { Self::default() }
}

#[async_trait]
impl PresenceOracle for PresenceRegistry {
    async fn enter(&self, room_id: &str, user_id: UserId) -> Result<()> {
        let mut map = self.inner.lock().await;
        let room = map.entry(room_id.to_string()).or_default();
        *room.entry(user_id).or_default() += 1;
        debug!("[PRESENCE] User {} entered room {} (active={})", user_id, room_id, room.len());
        Ok(())
    }

    async fn leave(&self, room_id: &str, user_id: UserId) -> Result<()> {
        let mut map = self.inner.lock().await;
        if let Some(room) = map.get_mut(room_id) {
            if let Some(count) = room.get_mut(&user_id) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    room.remove(&user_id);
                }
            }
            debug!("[PRESENCE] User {} left room {} (active={})", user_id, room_id, room.len());
            if room.is_empty() {
                map.remove(room_id);
            }
        }
        Ok(())
    }

    async fn active_count(&self, room_id: &str) -> Result<usize> {
        let map = self.inner.lock().await;
        Ok(map.get(room_id).map(|room| room.len()).unwrap_or(0))
    }
}

/// Presence shared by every instance: a Redis hash per room topic mapping
/// user id to open connection count.
pub struct RedisPresence {
    redis_manager: Arc<Mutex<ConnectionManager>>,
}

impl RedisPresence {
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let redis_manager = ConnectionManager::new(client).await?;
        Ok(Self { redis_manager: Arc::new(Mutex::new(redis_manager)) })
    }

    pub fn key(room_id: &str) -> String {
        format!("presence:{}", Topic::for_room(room_id))
    }
}

// KEYS[1] = room hash, ARGV[1] = user id, ARGV[2] = ttl seconds
const ENTER_SCRIPT: &str = r"
local n = redis.call('HINCRBY', KEYS[1], ARGV[1], 1)
redis.call('EXPIRE', KEYS[1], ARGV[2])
return n
";

const LEAVE_SCRIPT: &str = r"
local n = redis.call('HINCRBY', KEYS[1], ARGV[1], -1)
if n <= 0 then
  redis.call('HDEL', KEYS[1], ARGV[1])
end
if redis.call('HLEN', KEYS[1]) > 0 then
  redis.call('EXPIRE', KEYS[1], ARGV[2])
end
return n
";

#[async_trait]
impl PresenceOracle for RedisPresence {
    async fn enter(&self, room_id: &str, user_id: UserId) -> Result<()> {
        let mut conn = self.redis_manager.lock().await;
        let connections: i64 = redis::Script::new(ENTER_SCRIPT)
            .key(Self::key(room_id))
            .arg(user_id)
            .arg(PRESENCE_TTL_SECS)
            .invoke_async(&mut *conn)
            .await?;
        debug!("[PRESENCE] User {} entered room {} ({} connections)", user_id, room_id, connections);
        Ok(())
    }

    async fn leave(&self, room_id: &str, user_id: UserId) -> Result<()> {
        let mut conn = self.redis_manager.lock().await;
        let remaining: i64 = redis::Script::new(LEAVE_SCRIPT)
            .key(Self::key(room_id))
            .arg(user_id)
            .arg(PRESENCE_TTL_SECS)
            .invoke_async(&mut *conn)
            .await?;
        debug!("[PRESENCE] User {} left room {} ({} connections)", user_id, room_id, remaining.max(0));
        Ok(())
    }

    async fn active_count(&self, room_id: &str) -> Result<usize> {
        let mut conn = self.redis_manager.lock().await;
        let count: usize = redis::cmd("HLEN")
            .arg(Self::key(room_id))
            .query_async(&mut *conn)
            .await?;
        Ok(count)
    }

    async fn refresh(&self, room_id: &str) -> Result<()> {
        let mut conn = self.redis_manager.lock().await;
        let _: i64 = redis::cmd("EXPIRE")
            .arg(Self::key(room_id))
            .arg(PRESENCE_TTL_SECS)
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }
}
