use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::types::ChatMessage;

pub mod twitch;

/// Interface the bot core needs from a chat transport.
#[async_trait]
pub trait PlatformConnection: Send + Sync {
    /// Connect, authenticate and start receiving messages.
    async fn connect(&mut self) -> Result<()>;

    /// Send a chat line to the given channel.
    async fn send_message(&self, channel: &str, message: &str) -> Result<()>;

    /// Check if the connection is healthy.
    async fn is_connected(&self) -> bool;

    /// Get a receiver for incoming messages. Available after `connect`.
    fn get_message_receiver(&self) -> Option<broadcast::Receiver<ChatMessage>>;

    /// Channels this connection is joined to.
    fn get_channels(&self) -> Vec<String>;

    /// Gracefully disconnect.
    async fn disconnect(&mut self) -> Result<()>;
}
