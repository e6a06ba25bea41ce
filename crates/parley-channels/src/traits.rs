use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parley_common::{ConversationId, InboundMessage, Result};
use serde::{Deserialize, Serialize};

/// Send-only interface for delivering text to a conversation.
///
/// Designed to be wrapped in `Arc` and shared across tasks (approval prompts,
/// run results, tool notifications).
#[async_trait]
pub trait ChannelSender: Send + Sync {
    /// Unique identifier for this channel type.
    fn channel_type(&self) -> &str;

    async fn send_message(&self, conversation: &ConversationId, text: &str) -> Result<()>;
}

/// Lifecycle management for a messaging channel (connect, disconnect, status).
#[async_trait]
pub trait ChannelLifecycle: Send {
    fn display_name(&self) -> &str;

    /// Start the channel; inbound messages go to the callback given at construction.
    async fn connect(&mut self) -> Result<()>;

    async fn disconnect(&mut self) -> Result<()>;

    fn status(&self) -> ChannelStatus;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChannelStatus {
    Disconnected,
    Connected,
    Error(String),
}

/// Callback a channel invokes for every inbound message.
pub type OnMessageFn = Arc<dyn Fn(InboundMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// Callback receiving a merged unit of text for a conversation.
pub type FlushFn = Arc<dyn Fn(ConversationId, String) -> BoxFuture<'static, ()> + Send + Sync>;
