use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parley_common::ConversationId;
use parley_config::QueueMode;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::cancel::{CancellationRegistry, StopOutcome};

/// What the caller should do with an item offered during a run.
#[derive(Debug, PartialEq, Eq)]
pub enum Disposition<T> {
    /// No run is active; process the item normally.
    NotRunning(T),
    /// Held until the active run ends.
    Queued,
    /// Held like `Queued`, and the active run was cancelled.
    Interrupted,
}

struct RunState<T> {
    queued: Vec<T>,
    idle: watch::Sender<bool>,
}

/// Tracks the Idle/Running state of each conversation and what arrived
/// while it was running.
///
/// A conversation is Running exactly while it has an entry in `runs`, so at
/// most one run per conversation can exist at a time.
pub struct RunCoordinator<T> {
    runs: DashMap<ConversationId, RunState<T>>,
    cancellations: Arc<CancellationRegistry>,
}

impl<T> RunCoordinator<T> {
    pub fn new(cancellations: Arc<CancellationRegistry>) -> Self {
        Self {
            runs: DashMap::new(),
            cancellations,
        }
    }

    /// Idle → Running. Returns `false` if a run is already active.
    pub fn start_run(&self, id: &ConversationId) -> bool {
        match self.runs.entry(id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(RunState::new());
                debug!(conversation = %id, "run started");
                true
            }
        }
    }

    /// Start a run for `item`, or queue it behind the active one.
    ///
    /// Returns the item back when the caller now owns a fresh run.
    pub fn start_or_queue(&self, id: &ConversationId, item: T) -> Option<T> {
        match self.runs.entry(id.clone()) {
            Entry::Occupied(mut occupied) => {
                occupied.get_mut().queued.push(item);
                debug!(conversation = %id, "run active, unit queued");
                None
            }
            Entry::Vacant(vacant) => {
                vacant.insert(RunState::new());
                debug!(conversation = %id, "run started");
                Some(item)
            }
        }
    }

    /// Running → Idle. Returns everything queued during the run, oldest first.
    pub fn end_run(&self, id: &ConversationId) -> Vec<T> {
        let Some((_, state)) = self.runs.remove(id) else {
            return Vec::new();
        };
        let _ = state.idle.send(true);
        debug!(conversation = %id, queued = state.queued.len(), "run ended");
        state.queued
    }

    /// Apply `mode` to an item that arrived for `id`.
    pub fn handle_during_run(&self, id: &ConversationId, item: T, mode: QueueMode) -> Disposition<T> {
        let Some(mut state) = self.runs.get_mut(id) else {
            return Disposition::NotRunning(item);
        };

        match mode {
            // Steer cannot reach into a turn already sent to the model; it
            // shares the collect queue.
            QueueMode::Collect | QueueMode::Steer => {
                state.queued.push(item);
                debug!(conversation = %id, mode = %mode, queued = state.queued.len(), "queued during run");
                Disposition::Queued
            }
            // The interrupting item joins the same queue so that everything
            // held during the run comes back out in arrival order.
            QueueMode::Interrupt => {
                state.queued.push(item);
                drop(state);
                if self.cancellations.stop(id) == StopOutcome::NothingToStop {
                    debug!(conversation = %id, "interrupt found no cancellation handle");
                }
                info!(conversation = %id, "interrupting active run");
                Disposition::Interrupted
            }
        }
    }

    pub fn is_running(&self, id: &ConversationId) -> bool {
        self.runs.contains_key(id)
    }

    pub fn queued_len(&self, id: &ConversationId) -> usize {
        self.runs.get(id).map(|s| s.queued.len()).unwrap_or(0)
    }

    /// Resolve once the conversation has no active run.
    pub async fn wait_idle(&self, id: &ConversationId) {
        let mut idle = match self.runs.get(id) {
            Some(state) => state.idle.subscribe(),
            None => return,
        };
        // A dropped sender also means the run is gone.
        let _ = idle.wait_for(|idle| *idle).await;
    }
}

impl<T> RunState<T> {
    fn new() -> Self {
        let (idle, _) = watch::channel(false);
        Self {
            queued: Vec::new(),
            idle,
        }
    }
}
