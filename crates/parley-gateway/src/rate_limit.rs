//! Sliding-window admission control, one window per conversation.

use std::collections::VecDeque;
use std::time::Duration;

use dashmap::DashMap;
use parley_common::ConversationId;
use parley_config::RateLimitConfig;
use tokio::time::Instant;
use tracing::debug;

/// Admits at most `max_requests` per conversation within any trailing `window`.
///
/// Each conversation's history sits in its own map entry, so calls for one
/// conversation are serialized while different conversations proceed in parallel.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    history: DashMap<ConversationId, VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            history: DashMap::new(),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.max_requests, config.window())
    }

    /// Record an admission if the conversation is under its cap.
    pub fn allow(&self, id: &ConversationId) -> bool {
        let now = Instant::now();
        let mut entry = self.history.entry(id.clone()).or_default();
        prune(&mut entry, now, self.window);

        if entry.len() >= self.max_requests {
            debug!(conversation = %id, in_window = entry.len(), "rate limit reached");
            return false;
        }
        entry.push_back(now);
        true
    }

    /// Time until the oldest in-window admission expires; zero when under the cap.
    pub fn remaining_cooldown(&self, id: &ConversationId) -> Duration {
        let now = Instant::now();
        let Some(mut entry) = self.history.get_mut(id) else {
            return Duration::ZERO;
        };
        prune(&mut entry, now, self.window);

        if entry.len() < self.max_requests {
            return Duration::ZERO;
        }
        entry
            .front()
            .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    pub fn reset(&self, id: &ConversationId) {
        self.history.remove(id);
    }
}

fn prune(history: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = history.front() {
        if now.saturating_duration_since(*oldest) >= window {
            history.pop_front();
        } else {
            break;
        }
    }
}
