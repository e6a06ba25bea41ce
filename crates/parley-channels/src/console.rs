use std::sync::Arc;

use async_trait::async_trait;
use parley_common::{ConversationId, InboundMessage, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, watch};
use tracing::{info, warn};

use crate::traits::{ChannelLifecycle, ChannelSender, ChannelStatus, OnMessageFn};

/// Local terminal channel: every stdin line is an inbound message of one
/// conversation, replies are printed to stdout.
pub struct ConsoleChannel {
    conversation: ConversationId,
    author_id: String,
    status: ChannelStatus,
    on_message: OnMessageFn,
    shutdown_tx: Option<watch::Sender<bool>>,
}

impl ConsoleChannel {
    pub fn new(conversation: ConversationId, author_id: String, on_message: OnMessageFn) -> Self {
        Self {
            conversation,
            author_id,
            status: ChannelStatus::Disconnected,
            on_message,
            shutdown_tx: None,
        }
    }
}

#[async_trait]
impl ChannelLifecycle for ConsoleChannel {
    fn display_name(&self) -> &str {
        "Console"
    }

    async fn connect(&mut self) -> Result<()> {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        self.shutdown_tx = Some(shutdown_tx);

        let on_message = Arc::clone(&self.on_message);
        let conversation = self.conversation.clone();
        let author_id = self.author_id.clone();

        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            let mut sequence: i64 = 0;
            info!("console channel reading stdin for conversation {}", conversation);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            let text = line.trim_end().to_string();
                            if text.is_empty() {
                                continue;
                            }
                            sequence += 1;
                            let message = InboundMessage::text(
                                conversation.clone(),
                                author_id.clone(),
                                sequence,
                                text,
                            );
                            on_message(message).await;
                        }
                        Ok(None) => {
                            info!("console input closed");
                            break;
                        }
                        Err(e) => {
                            warn!("console read failed: {}", e);
                            break;
                        }
                    }
                }
            }
        });

        self.status = ChannelStatus::Connected;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        self.status = ChannelStatus::Disconnected;
        Ok(())
    }

    fn status(&self) -> ChannelStatus {
        self.status.clone()
    }
}

/// Writes outbound text to stdout, one block per message.
#[derive(Default)]
pub struct ConsoleSender {
    stdout: Mutex<Option<tokio::io::Stdout>>,
}

#[async_trait]
impl ChannelSender for ConsoleSender {
    fn channel_type(&self) -> &str {
        "console"
    }

    async fn send_message(&self, conversation: &ConversationId, text: &str) -> Result<()> {
        let mut guard = self.stdout.lock().await;
        let stdout = guard.get_or_insert_with(tokio::io::stdout);
        let block = format!("[{conversation}] {text}\n");
        stdout.write_all(block.as_bytes()).await?;
        stdout.flush().await?;
        Ok(())
    }
}
