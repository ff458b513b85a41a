//! Reconnecting WebSocket client for election-management real-time updates
//!
//! A [`ConnectionManager`] keeps one authenticated socket to the server's
//! update channel and fans inbound messages out to typed handlers. An
//! [`EventBridge`] turns those messages into [`StoreCommand`]s for the
//! application's state store.

pub mod bridge;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod protocol;

pub use bridge::{CommandSink, EventBridge, StoreCommand};
pub use client::{ConnectionManager, ConnectionState, TokenProvider, WsConnector};
pub use config::ClientConfig;
pub use protocol::{Message, MessageType};
