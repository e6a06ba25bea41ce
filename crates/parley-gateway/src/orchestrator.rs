use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use parley_agents::AgentRuntime;
use parley_channels::{ChannelSender, Debouncer, FlushFn, FragmentReassembler, OnMessageFn};
use parley_common::{ConversationId, ConversationTurn, Error, InboundMessage, Result, TurnRole};
use parley_config::{AppConfig, QueueMode};
use parley_db::SessionStore;
use parley_security::ApprovalGate;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cancel::{CancellationRegistry, StopOutcome};
use crate::commands::{ChatCommand, parse_command};
use crate::coordinator::{Disposition, RunCoordinator};
use crate::rate_limit::RateLimiter;

pub const QUEUE_MODE_OPTION: &str = "queue_mode";
pub const DEBOUNCE_OPTION: &str = "debounce_ms";

/// Work held back while a run is active.
#[derive(Debug)]
enum Pending {
    /// Admitted message that has not reached the fragment stage yet.
    Message(InboundMessage),
    /// Debounced unit that lost the race to start a run.
    Unit(String),
}

/// Owns one instance of every pipeline stage and wires
/// message → rate limit → run coordinator → fragments → debounce → agent → send.
pub struct Orchestrator {
    runtime: AgentRuntime,
    sender: Arc<dyn ChannelSender>,
    store: Arc<dyn SessionStore>,
    gate: Arc<ApprovalGate>,
    rate_limiter: RateLimiter,
    cancellations: Arc<CancellationRegistry>,
    coordinator: RunCoordinator<Pending>,
    /// Serializes admission against the end-of-run drain per conversation.
    intake: DashMap<ConversationId, Arc<Mutex<()>>>,
    fragments: FragmentReassembler,
    debouncer: Debouncer,
    default_queue_mode: QueueMode,
    history_turns: usize,
    this: Weak<Orchestrator>,
}

impl Orchestrator {
    pub fn new(
        config: &AppConfig,
        runtime: AgentRuntime,
        sender: Arc<dyn ChannelSender>,
        store: Arc<dyn SessionStore>,
        gate: Arc<ApprovalGate>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<Orchestrator>| {
            let cancellations = Arc::new(CancellationRegistry::new());
            let fragments_target = this.clone();
            let on_fragments: FlushFn = Arc::new(move |id: ConversationId, unit: String| {
                let target = fragments_target.clone();
                async move {
                    if let Some(orchestrator) = target.upgrade() {
                        orchestrator.debounce_unit(&id, unit).await;
                    }
                }
                .boxed()
            });

            Self {
                runtime,
                sender,
                store,
                gate,
                rate_limiter: RateLimiter::from_config(&config.rate_limit),
                coordinator: RunCoordinator::new(Arc::clone(&cancellations)),
                cancellations,
                intake: DashMap::new(),
                fragments: FragmentReassembler::new(config.fragments.clone(), on_fragments),
                debouncer: Debouncer::new(config.debounce.window()),
                default_queue_mode: config.queue.default_mode,
                history_turns: config.agent.history_turns,
                this: this.clone(),
            }
        })
    }

    /// Callback for a channel's inbound messages.
    pub fn on_message_fn(self: &Arc<Self>) -> OnMessageFn {
        let orchestrator = Arc::clone(self);
        Arc::new(move |message: InboundMessage| {
            let orchestrator = Arc::clone(&orchestrator);
            async move { orchestrator.handle_message(message).await }.boxed()
        })
    }

    /// Entry point for every inbound message.
    pub async fn handle_message(&self, message: InboundMessage) {
        let id = message.conversation_id.clone();

        if let Some(command) = parse_command(&message.text) {
            let reply = self.handle_command(&id, command).await;
            self.deliver(&id, &reply).await;
            return;
        }

        if !self.rate_limiter.allow(&id) {
            let err = Error::RateLimited {
                retry_after: self.rate_limiter.remaining_cooldown(&id),
            };
            info!(conversation = %id, "message rejected: {}", err);
            self.deliver(&id, &format!("Slow down: {err}.")).await;
            return;
        }

        self.admit(message).await;
    }

    /// Run-coordinator stage.
    async fn admit(&self, message: InboundMessage) {
        let id = message.conversation_id.clone();
        let mode = self.queue_mode(&id).await;
        let intake = self.intake(&id);
        let _held = intake.lock().await;
        match self
            .coordinator
            .handle_during_run(&id, Pending::Message(message), mode)
        {
            Disposition::NotRunning(pending) => self.advance(&id, pending).await,
            Disposition::Queued | Disposition::Interrupted => {}
        }
    }

    fn intake(&self, id: &ConversationId) -> Arc<Mutex<()>> {
        Arc::clone(self.intake.entry(id.clone()).or_default().value())
    }

    async fn advance(&self, id: &ConversationId, pending: Pending) {
        match pending {
            Pending::Message(message) => self.reassemble(message).await,
            Pending::Unit(unit) => self.debounce_unit(id, unit).await,
        }
    }

    /// Fragment stage: units ready now go on to the debouncer.
    async fn reassemble(&self, message: InboundMessage) {
        let id = message.conversation_id;
        let ready = self
            .fragments
            .observe(&id, &message.author_id, message.sequence, message.text);
        for unit in ready {
            self.debounce_unit(&id, unit).await;
        }
    }

    async fn debounce_unit(&self, id: &ConversationId, unit: String) {
        let window = self.debounce_window(id).await;
        let target = self.this.clone();
        let on_flush: FlushFn = Arc::new(move |id: ConversationId, unit: String| {
            let target = target.clone();
            async move {
                if let Some(orchestrator) = target.upgrade() {
                    orchestrator.dispatch(id, unit);
                }
            }
            .boxed()
        });
        if !self
            .debouncer
            .debounce_with_window(id, unit, window, on_flush)
            .await
        {
            debug!(conversation = %id, "debouncer stopped, unit dropped");
        }
    }

    /// Start a run for `unit`, or queue it behind the active run.
    fn dispatch(&self, id: ConversationId, unit: String) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let unit = match self.coordinator.start_or_queue(&id, Pending::Unit(unit)) {
            Some(Pending::Unit(unit)) => unit,
            Some(Pending::Message(message)) => message.text,
            None => return,
        };
        let (run_id, token) = self.cancellations.register(&id);
        let guard = RunGuard {
            orchestrator: Arc::clone(&this),
            id: id.clone(),
            run_id,
            finished: false,
        };
        tokio::spawn(this.run_unit(guard, unit, token));
    }

    fn run_unit(
        self: Arc<Self>,
        guard: RunGuard,
        unit: String,
        token: CancellationToken,
    ) -> BoxFuture<'static, ()> {
        async move {
            let id = guard.id.clone();
            let prior = self.prior_session_text(&id).await;
            info!(conversation = %id, chars = unit.len(), "starting run");

            match self.runtime.run(&id, &unit, prior.as_deref(), &token).await {
                Ok(outcome) => {
                    info!(
                        conversation = %id,
                        tools = outcome.tools_used.len(),
                        tokens = outcome.usage.total(),
                        model = outcome.model.as_deref().unwrap_or("-"),
                        "run finished"
                    );
                    self.record_history(&id, &unit, &outcome.final_text).await;
                    self.deliver(&id, &outcome.final_text).await;
                }
                Err(e) if e.is_cancelled() => {
                    info!(conversation = %id, "run cancelled");
                }
                Err(e) => {
                    warn!(conversation = %id, "run failed: {}", e);
                    self.deliver(&id, &format!("Sorry, I couldn't complete that: {e}"))
                        .await;
                }
            }

            // Held work resumes past the coordinator, one item at a time, so
            // it cannot interrupt itself. Newer messages wait on the intake
            // lock until it has all been handed on.
            let intake = self.intake(&id);
            let _held = intake.lock().await;
            for pending in guard.finish() {
                self.advance(&id, pending).await;
            }
        }
        .boxed()
    }

    async fn handle_command(&self, id: &ConversationId, command: ChatCommand) -> String {
        match command {
            ChatCommand::Stop => match self.stop(id) {
                StopOutcome::Stopped => "Stopping the current run.".to_string(),
                StopOutcome::NothingToStop => "Nothing to stop.".to_string(),
            },
            ChatCommand::Queue(None) => format!("Queue mode: {}", self.queue_mode(id).await),
            ChatCommand::Queue(Some(mode)) => match self.set_queue_mode(id, mode).await {
                Ok(()) => format!("Queue mode set to {mode}."),
                Err(e) => format!("Could not change queue mode: {e}"),
            },
            ChatCommand::Debounce(None) => format!(
                "Debounce window: {} ms",
                self.debounce_window(id).await.as_millis()
            ),
            ChatCommand::Debounce(Some(ms)) => {
                match self.set_debounce_window(id, Duration::from_millis(ms)).await {
                    Ok(()) => format!("Debounce window set to {ms} ms."),
                    Err(e) => format!("Could not change debounce window: {e}"),
                }
            }
            ChatCommand::Approve(request_id) => self.decide_in(id, &request_id, true),
            ChatCommand::Deny(request_id) => self.decide_in(id, &request_id, false),
            ChatCommand::Status => self.status(id).await,
            ChatCommand::Invalid(usage) => usage,
        }
    }

    /// Decisions from chat only apply to requests raised in the same conversation.
    fn decide_in(&self, id: &ConversationId, request_id: &str, approved: bool) -> String {
        let owned = self.gate.pending_for(id).iter().any(|r| r == request_id);
        if owned && self.gate.handle_decision(request_id, approved) {
            if approved {
                format!("Approved {request_id}.")
            } else {
                format!("Denied {request_id}.")
            }
        } else {
            format!("No pending approval with id {request_id}.")
        }
    }

    async fn status(&self, id: &ConversationId) -> String {
        let running = if self.coordinator.is_running(id) {
            "running"
        } else {
            "idle"
        };
        let pending = self.gate.pending_for(id);
        let mut lines = vec![
            format!("Run: {running} ({} queued)", self.coordinator.queued_len(id)),
            format!("Queue mode: {}", self.queue_mode(id).await),
            format!(
                "Debounce window: {} ms",
                self.debounce_window(id).await.as_millis()
            ),
            format!("Model: {}", self.runtime.primary_model()),
        ];
        if !pending.is_empty() {
            lines.push(format!("Pending approvals: {}", pending.join(", ")));
        }
        let cooldown = self.rate_limiter.remaining_cooldown(id);
        if !cooldown.is_zero() {
            lines.push(format!("Rate limited for {}s", cooldown.as_secs().max(1)));
        }
        lines.join("\n")
    }

    /// Cancel the conversation's active run.
    pub fn stop(&self, id: &ConversationId) -> StopOutcome {
        self.cancellations.stop(id)
    }

    /// Approve a pending request from any surface.
    pub fn approve(&self, request_id: &str) -> bool {
        self.gate.handle_decision(request_id, true)
    }

    pub fn deny(&self, request_id: &str) -> bool {
        self.gate.handle_decision(request_id, false)
    }

    pub async fn set_queue_mode(&self, id: &ConversationId, mode: QueueMode) -> Result<()> {
        self.store
            .set_option(id, QUEUE_MODE_OPTION, Some(mode.as_str().to_string()))
            .await
    }

    pub async fn set_debounce_window(&self, id: &ConversationId, window: Duration) -> Result<()> {
        self.store
            .set_option(id, DEBOUNCE_OPTION, Some(window.as_millis().to_string()))
            .await
    }

    pub async fn queue_mode(&self, id: &ConversationId) -> QueueMode {
        match self.store.get_option(id, QUEUE_MODE_OPTION).await {
            Ok(Some(raw)) => raw.parse().unwrap_or_else(|e| {
                warn!(conversation = %id, "ignoring stored queue mode: {}", e);
                self.default_queue_mode
            }),
            Ok(None) => self.default_queue_mode,
            Err(e) => {
                warn!(conversation = %id, "failed to read queue mode: {}", e);
                self.default_queue_mode
            }
        }
    }

    pub async fn debounce_window(&self, id: &ConversationId) -> Duration {
        match self.store.get_option(id, DEBOUNCE_OPTION).await {
            Ok(Some(raw)) => raw
                .parse::<u64>()
                .map(Duration::from_millis)
                .unwrap_or_else(|_| {
                    warn!(conversation = %id, "ignoring stored debounce window '{}'", raw);
                    self.debouncer.window()
                }),
            Ok(None) => self.debouncer.window(),
            Err(e) => {
                warn!(conversation = %id, "failed to read debounce window: {}", e);
                self.debouncer.window()
            }
        }
    }

    pub fn is_running(&self, id: &ConversationId) -> bool {
        self.coordinator.is_running(id)
    }

    /// Resolve once the conversation has no active run.
    pub async fn wait_idle(&self, id: &ConversationId) {
        self.coordinator.wait_idle(id).await;
    }

    /// Stop scheduling debounce flushes. Active runs finish normally.
    pub fn shutdown(&self) {
        self.debouncer.stop();
    }

    async fn prior_session_text(&self, id: &ConversationId) -> Option<String> {
        let history = match self.store.get_history(id).await {
            Ok(history) => history,
            Err(e) => {
                warn!(conversation = %id, "failed to load history: {}", e);
                return None;
            }
        };
        render_history(&history)
    }

    async fn record_history(&self, id: &ConversationId, unit: &str, answer: &str) {
        let mut history = match self.store.get_history(id).await {
            Ok(history) => history,
            Err(e) => {
                warn!(conversation = %id, "failed to load history: {}", e);
                Vec::new()
            }
        };
        history.push(ConversationTurn::user(unit));
        history.push(ConversationTurn::assistant(answer));
        if history.len() > self.history_turns {
            history.drain(..history.len() - self.history_turns);
        }
        if let Err(e) = self.store.set_history(id, history).await {
            warn!(conversation = %id, "failed to store history: {}", e);
        }
    }

    /// Delivery failures are logged, never fatal.
    async fn deliver(&self, id: &ConversationId, text: &str) {
        if text.trim().is_empty() {
            debug!(conversation = %id, "nothing to deliver");
            return;
        }
        if let Err(e) = self.sender.send_message(id, text).await {
            warn!(conversation = %id, "failed to deliver message: {}", e);
        }
    }
}

fn render_history(history: &[ConversationTurn]) -> Option<String> {
    let lines: Vec<String> = history
        .iter()
        .filter_map(|turn| match turn.role {
            TurnRole::User => Some(format!("User: {}", turn.content)),
            TurnRole::Assistant => Some(format!("Assistant: {}", turn.content)),
            TurnRole::System | TurnRole::Tool => None,
        })
        .collect();
    (!lines.is_empty()).then(|| lines.join("\n"))
}

/// Returns the conversation to Idle when the run task ends, even by panic.
struct RunGuard {
    orchestrator: Arc<Orchestrator>,
    id: ConversationId,
    run_id: u64,
    finished: bool,
}

impl RunGuard {
    fn release(&self) -> Vec<Pending> {
        self.orchestrator.cancellations.remove(&self.id, self.run_id);
        self.orchestrator.coordinator.end_run(&self.id)
    }

    /// End the run and take what was queued during it.
    fn finish(mut self) -> Vec<Pending> {
        self.finished = true;
        self.release()
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let dropped = self.release();
        warn!(
            conversation = %self.id,
            dropped = dropped.len(),
            "run ended abnormally, queued messages discarded"
        );
    }
}
