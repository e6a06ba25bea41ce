use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;
use parley_common::{ConversationId, ConversationTurn, Result};
use tracing::debug;

/// Per-conversation history and option storage.
///
/// Durable backends live outside this crate; the orchestrator only needs
/// these four operations.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get_history(&self, id: &ConversationId) -> Result<Vec<ConversationTurn>>;

    async fn set_history(&self, id: &ConversationId, history: Vec<ConversationTurn>) -> Result<()>;

    async fn get_option(&self, id: &ConversationId, key: &str) -> Result<Option<String>>;

    /// Set an option, or clear it with `None`.
    async fn set_option(&self, id: &ConversationId, key: &str, value: Option<String>)
    -> Result<()>;
}

/// Process-local store; contents are lost on restart.
#[derive(Default)]
pub struct InMemorySessionStore {
    histories: DashMap<ConversationId, Vec<ConversationTurn>>,
    options: DashMap<ConversationId, HashMap<String, String>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get_history(&self, id: &ConversationId) -> Result<Vec<ConversationTurn>> {
        Ok(self
            .histories
            .get(id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }

    async fn set_history(&self, id: &ConversationId, history: Vec<ConversationTurn>) -> Result<()> {
        debug!(conversation = %id, turns = history.len(), "storing history");
        self.histories.insert(id.clone(), history);
        Ok(())
    }

    async fn get_option(&self, id: &ConversationId, key: &str) -> Result<Option<String>> {
        Ok(self
            .options
            .get(id)
            .and_then(|entry| entry.value().get(key).cloned()))
    }

    async fn set_option(
        &self,
        id: &ConversationId,
        key: &str,
        value: Option<String>,
    ) -> Result<()> {
        let mut options = self.options.entry(id.clone()).or_default();
        match value {
            Some(value) => {
                options.insert(key.to_string(), value);
            }
            None => {
                options.remove(key);
            }
        }
        Ok(())
    }
}
