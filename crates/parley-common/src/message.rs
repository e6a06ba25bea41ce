use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::ConversationId;

/// A text message handed to the orchestrator by a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: String,
    pub conversation_id: ConversationId,
    pub author_id: String,
    /// Transport message number, used to detect split pastes.
    pub sequence: i64,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn text(
        conversation_id: ConversationId,
        author_id: impl Into<String>,
        sequence: i64,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id,
            author_id: author_id.into(),
            sequence,
            text: text.into(),
            received_at: Utc::now(),
        }
    }
}
