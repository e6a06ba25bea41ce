use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parley_channels::ChannelSender;
use parley_common::ConversationId;
use tokio::sync::oneshot;
use tracing::{info, warn};

/// A dangerous command waiting for a human decision.
struct PendingApproval {
    conversation_id: ConversationId,
    command: String,
    slot: oneshot::Sender<bool>,
    created_at: DateTime<Utc>,
}

/// Handle to the outcome of one approval request.
pub struct ApprovalTicket {
    pub request_id: String,
    rx: oneshot::Receiver<bool>,
}

impl ApprovalTicket {
    /// Wait for the decision. A dropped slot counts as denied.
    pub async fn decision(self) -> bool {
        self.rx.await.unwrap_or(false)
    }
}

/// Holds destructive commands until someone approves or denies them.
///
/// Every request resolves exactly once: by [`handle_decision`](Self::handle_decision)
/// or by the timeout, which denies. Anything ambiguous denies.
pub struct ApprovalGate {
    sender: Arc<dyn ChannelSender>,
    timeout: Duration,
    pending: Arc<DashMap<String, PendingApproval>>,
}

impl ApprovalGate {
    pub fn new(sender: Arc<dyn ChannelSender>, timeout: Duration) -> Self {
        Self {
            sender,
            timeout,
            pending: Arc::new(DashMap::new()),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register a pending approval and send the approve/deny prompt.
    pub async fn request_approval(&self, id: &ConversationId, command: &str) -> ApprovalTicket {
        let request_id = uuid::Uuid::new_v4().to_string();
        let (slot, rx) = oneshot::channel();

        self.pending.insert(
            request_id.clone(),
            PendingApproval {
                conversation_id: id.clone(),
                command: command.to_string(),
                slot,
                created_at: Utc::now(),
            },
        );
        self.spawn_expiry(request_id.clone());

        let prompt = format!(
            "Approval required to run:\n`{command}`\n\
             Reply /approve {request_id} or /deny {request_id} (auto-deny in {}s).",
            self.timeout.as_secs()
        );
        if let Err(e) = self.sender.send_message(id, &prompt).await {
            warn!(conversation = %id, "failed to deliver approval prompt, denying: {}", e);
            self.resolve(&request_id, false);
        } else {
            info!(conversation = %id, request_id = %request_id, "approval requested");
        }

        ApprovalTicket { request_id, rx }
    }

    fn spawn_expiry(&self, request_id: String) {
        let pending = Arc::clone(&self.pending);
        let sender = Arc::clone(&self.sender);
        let timeout = self.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some((_, approval)) = pending.remove(&request_id) else {
                return;
            };
            let waited = Utc::now() - approval.created_at;
            warn!(
                conversation = %approval.conversation_id,
                request_id = %request_id,
                "approval timed out after {}s, denying",
                waited.num_seconds()
            );
            let _ = approval.slot.send(false);
            let notice = format!(
                "Approval request {request_id} timed out; `{}` was not run.",
                approval.command
            );
            if let Err(e) = sender
                .send_message(&approval.conversation_id, &notice)
                .await
            {
                warn!("failed to deliver approval timeout notice: {}", e);
            }
        });
    }

    /// Apply a human decision. Returns `false` if the request is unknown or
    /// already resolved.
    pub fn handle_decision(&self, request_id: &str, approved: bool) -> bool {
        let applied = self.resolve(request_id, approved);
        if applied {
            info!(request_id = %request_id, approved, "approval decided");
        }
        applied
    }

    fn resolve(&self, request_id: &str, approved: bool) -> bool {
        match self.pending.remove(request_id) {
            Some((_, approval)) => {
                let _ = approval.slot.send(approved);
                true
            }
            None => false,
        }
    }

    /// Wait on a ticket, bounded by the gate timeout. Timing out denies.
    pub async fn await_decision(&self, ticket: ApprovalTicket) -> bool {
        let bound = self.timeout + Duration::from_secs(1);
        tokio::time::timeout(bound, ticket.decision())
            .await
            .unwrap_or(false)
    }

    /// Pending request ids for a conversation, oldest first.
    pub fn pending_for(&self, id: &ConversationId) -> Vec<String> {
        let mut requests: Vec<(DateTime<Utc>, String)> = self
            .pending
            .iter()
            .filter(|entry| entry.value().conversation_id == *id)
            .map(|entry| (entry.value().created_at, entry.key().clone()))
            .collect();
        requests.sort();
        requests.into_iter().map(|(_, request_id)| request_id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parley_common::{Error, Result};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<(ConversationId, String)>>,
        fail: bool,
    }

    impl RecordingSender {
        fn messages(&self) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|(_, text)| text.clone())
                .collect()
        }
    }

    #[async_trait]
    impl ChannelSender for RecordingSender {
        fn channel_type(&self) -> &str {
            "test"
        }

        async fn send_message(&self, conversation: &ConversationId, text: &str) -> Result<()> {
            if self.fail {
                return Err(Error::Channel("offline".into()));
            }
            self.sent
                .lock()
                .unwrap()
                .push((conversation.clone(), text.to_string()));
            Ok(())
        }
    }

    fn gate(sender: Arc<RecordingSender>) -> ApprovalGate {
        ApprovalGate::new(sender, Duration::from_secs(60))
    }

    #[tokio::test(start_paused = true)]
    async fn approve_resolves_ticket_and_sends_prompt() {
        let sender = Arc::new(RecordingSender::default());
        let gate = gate(Arc::clone(&sender));
        let id = ConversationId::new("c1");

        let ticket = gate.request_approval(&id, "rm -rf /tmp/x").await;
        let request_id = ticket.request_id.clone();
        assert_eq!(gate.pending_for(&id), vec![request_id.clone()]);

        let prompt = &sender.messages()[0];
        assert!(prompt.contains("rm -rf /tmp/x"));
        assert!(prompt.contains(&request_id));

        assert!(gate.handle_decision(&request_id, true));
        assert!(ticket.decision().await);
        assert!(gate.pending_for(&id).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn second_decision_is_a_no_op() {
        let gate = gate(Arc::new(RecordingSender::default()));
        let ticket = gate.request_approval(&"c1".into(), "reboot").await;

        assert!(gate.handle_decision(&ticket.request_id, false));
        assert!(!gate.handle_decision(&ticket.request_id, true));
        assert!(!ticket.decision().await);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_denies_exactly_once_and_notifies() {
        let sender = Arc::new(RecordingSender::default());
        let gate = gate(Arc::clone(&sender));
        let ticket = gate.request_approval(&"c1".into(), "mkfs /dev/sdb").await;
        let request_id = ticket.request_id.clone();

        assert!(!gate.await_decision(ticket).await);
        tokio::time::sleep(Duration::from_secs(5)).await;

        let timeouts = sender
            .messages()
            .iter()
            .filter(|m| m.contains("timed out"))
            .count();
        assert_eq!(timeouts, 1);
        assert!(!gate.handle_decision(&request_id, true), "late approval must not apply");
    }

    #[tokio::test(start_paused = true)]
    async fn undeliverable_prompt_denies_immediately() {
        let sender = Arc::new(RecordingSender {
            fail: true,
            ..Default::default()
        });
        let gate = gate(sender);
        let ticket = gate.request_approval(&"c1".into(), "rm -rf /").await;
        assert!(!ticket.decision().await);
    }

    #[test]
    fn unknown_request_is_not_applied() {
        let gate = gate(Arc::new(RecordingSender::default()));
        assert!(!gate.handle_decision("nope", true));
    }
}
