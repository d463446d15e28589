use std::env;

/// Fixed history page size.
pub const HISTORY_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub ws_port: u16,
    pub database_url: String,
    pub redis_url: Option<String>, // None -> single instance, in-process fan-out
    pub max_clients: usize,
    pub log_level: String,
    pub max_message_length: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            ws_port: 5001,
            database_url: "sqlite:data/chat_relay.db".to_string(),
            redis_url: None,
            max_clients: 1000,
            log_level: "info".to_string(),
            max_message_length: 2048,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        Self {
            host: env::var("SERVER_HOST").unwrap_or(defaults.host),
            ws_port: env::var("WS_PORT").ok().and_then(|p| p.parse().ok()).unwrap_or(defaults.ws_port),
            database_url: env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            redis_url: env::var("REDIS_URL").ok().filter(|v| !v.trim().is_empty()),
            max_clients: env::var("MAX_CLIENTS").ok().and_then(|v| v.parse().ok()).unwrap_or(defaults.max_clients),
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
            max_message_length: env::var("MAX_MESSAGE_LENGTH").ok().and_then(|v| v.parse().ok()).unwrap_or(defaults.max_message_length),
        }
    }

    pub fn ws_addr(&self) -> String {
        format!("{}:{}", self.host, self.ws_port)
    }
}
