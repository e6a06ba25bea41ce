use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parley_common::ConversationId;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Outcome of an explicit stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    NothingToStop,
}

struct ActiveRun {
    run_id: u64,
    token: CancellationToken,
}

/// Conversation → cancellation token of its active run.
#[derive(Default)]
pub struct CancellationRegistry {
    active: DashMap<ConversationId, ActiveRun>,
    next_run_id: AtomicU64,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh token for a run that is starting. Returns the run id
    /// to pass back to [`remove`](Self::remove).
    pub fn register(&self, id: &ConversationId) -> (u64, CancellationToken) {
        let run_id = self.next_run_id.fetch_add(1, Ordering::SeqCst) + 1;
        let token = CancellationToken::new();
        self.active.insert(
            id.clone(),
            ActiveRun {
                run_id,
                token: token.clone(),
            },
        );
        debug!(conversation = %id, run_id, "registered run");
        (run_id, token)
    }

    /// Drop the token of `run_id`. A newer run's token is left alone.
    pub fn remove(&self, id: &ConversationId, run_id: u64) -> bool {
        self.active
            .remove_if(id, |_, active| active.run_id == run_id)
            .is_some()
    }

    /// Cancel the conversation's active run, if any.
    pub fn stop(&self, id: &ConversationId) -> StopOutcome {
        match self.active.get(id) {
            Some(active) => {
                info!(conversation = %id, run_id = active.run_id, "cancelling active run");
                active.token.cancel();
                StopOutcome::Stopped
            }
            None => StopOutcome::NothingToStop,
        }
    }

    pub fn is_active(&self, id: &ConversationId) -> bool {
        self.active.contains_key(id)
    }
}
