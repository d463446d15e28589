pub mod broker;
pub mod config;
pub mod database;
pub mod error;
pub mod hub;
pub mod messages;
pub mod presence;
pub mod relay;
pub mod rooms;
pub mod users;
pub mod websocket;
