use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parley_common::{Error, Result};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::providers::{LlmProvider, LlmRequest, LlmResponse};

/// Model name → instant until which the model is skipped.
///
/// Shared by every conversation of one orchestrator instance.
#[derive(Default)]
pub struct CooldownTable {
    until: DashMap<String, Instant>,
}

impl CooldownTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time left on the model's cooldown, if any. Expired entries are dropped.
    pub fn remaining(&self, model: &str) -> Option<Duration> {
        let now = Instant::now();
        let expiry = *self.until.get(model)?;
        if expiry > now {
            return Some(expiry - now);
        }
        self.until.remove_if(model, |_, until| *until <= now);
        None
    }

    pub fn is_cooling(&self, model: &str) -> bool {
        self.remaining(model).is_some()
    }

    pub fn cool_down(&self, model: &str, duration: Duration) {
        self.until.insert(model.to_string(), Instant::now() + duration);
    }
}

/// Wraps a provider and cascades through a model list, cooling down models
/// that fail with a retryable error.
pub struct ModelFailover {
    provider: Arc<dyn LlmProvider>,
    cooldowns: Arc<CooldownTable>,
    cooldown: Duration,
    request_timeout: Duration,
}

impl ModelFailover {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        cooldowns: Arc<CooldownTable>,
        cooldown: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            cooldowns,
            cooldown,
            request_timeout,
        }
    }

    pub fn cooldowns(&self) -> &Arc<CooldownTable> {
        &self.cooldowns
    }

    /// Tool-enabled completion. Returns the response and the model that produced it.
    pub async fn complete_with_failover(
        &self,
        request: &LlmRequest,
        primary: &str,
        fallbacks: &[String],
        cancel: &CancellationToken,
    ) -> Result<(LlmResponse, String)> {
        let provider = Arc::clone(&self.provider);
        self.cascade(primary, fallbacks, cancel, |model| {
            let provider = Arc::clone(&provider);
            let request = request.for_model(&model);
            let cancel = cancel.clone();
            async move { provider.complete_with_tools(&request, &cancel).await }
        })
        .await
    }

    /// Plain completion without tool schema.
    pub async fn complete_plain_with_failover(
        &self,
        request: &LlmRequest,
        primary: &str,
        fallbacks: &[String],
        cancel: &CancellationToken,
    ) -> Result<(String, String)> {
        let provider = Arc::clone(&self.provider);
        self.cascade(primary, fallbacks, cancel, |model| {
            let provider = Arc::clone(&provider);
            let mut request = request.for_model(&model);
            request.tools.clear();
            let cancel = cancel.clone();
            async move { provider.complete(&request, &cancel).await }
        })
        .await
    }

    async fn cascade<T, F, Fut>(
        &self,
        primary: &str,
        fallbacks: &[String],
        cancel: &CancellationToken,
        mut attempt: F,
    ) -> Result<(T, String)>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let chain = model_chain(primary, fallbacks);
        if chain.is_empty() {
            return Err(Error::Agent("no model configured".into()));
        }

        let mut failures = Vec::new();
        for model in chain {
            if let Some(remaining) = self.cooldowns.remaining(&model) {
                debug!(model = %model, "skipping model in cooldown");
                failures.push(format!(
                    "{model}: cooling down ({}s left)",
                    remaining.as_secs().max(1)
                ));
                continue;
            }

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                result = tokio::time::timeout(self.request_timeout, attempt(model.clone())) => result,
            };

            let err = match outcome {
                Ok(Ok(value)) => {
                    if !failures.is_empty() {
                        info!(
                            "using fallback model '{}' after retryable failure(s): {}",
                            model,
                            failures.join("; ")
                        );
                    }
                    return Ok((value, model));
                }
                Ok(Err(Error::Cancelled)) => return Err(Error::Cancelled),
                Ok(Err(err)) => err,
                Err(_) => Error::Timeout(format!(
                    "model '{model}' did not answer within {}s",
                    self.request_timeout.as_secs()
                )),
            };

            if !is_retryable_provider_error(&err) {
                return Err(err);
            }

            warn!(
                "model '{}' failed with retryable error ({}); cooling down for {}s",
                model,
                err,
                self.cooldown.as_secs()
            );
            self.cooldowns.cool_down(&model, self.cooldown);
            failures.push(format!("{model}: {err}"));
        }

        Err(Error::FailoverExhausted(failures.join("; ")))
    }
}

/// `[primary, ...fallbacks]` without blanks or duplicates.
fn model_chain(primary: &str, fallbacks: &[String]) -> Vec<String> {
    let mut chain: Vec<String> = Vec::new();
    for model in std::iter::once(primary).chain(fallbacks.iter().map(String::as_str)) {
        let trimmed = model.trim();
        if trimmed.is_empty() || chain.iter().any(|existing| existing == trimmed) {
            continue;
        }
        chain.push(trimmed.to_string());
    }
    chain
}

/// Rate limits, 5xx, context-length overflows and transport failures are
/// worth trying on another model; everything else is not.
pub fn is_retryable_provider_error(error: &Error) -> bool {
    match error {
        Error::Cancelled => false,
        Error::Timeout(_) => true,
        Error::Provider {
            status: Some(status),
            message,
        } => is_retryable_status(*status) || is_context_length_error(&message.to_ascii_lowercase()),
        Error::Provider {
            status: None,
            message,
        } => is_retryable_message(&message.to_ascii_lowercase()),
        other => is_retryable_message(&other.to_string().to_ascii_lowercase()),
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_context_length_error(message: &str) -> bool {
    [
        "context_length_exceeded",
        "context length",
        "context window",
        "maximum context",
        "prompt is too long",
    ]
    .iter()
    .any(|fragment| message.contains(fragment))
}

fn is_retryable_message(message: &str) -> bool {
    if is_context_length_error(message) {
        return true;
    }

    if let Some(status) = extract_status_code(message) {
        return is_retryable_status(status);
    }

    let retryable_fragments = [
        "timed out",
        "timeout",
        "connection refused",
        "connection reset",
        "connection aborted",
        "temporarily unavailable",
        "dns error",
        "network error",
    ];

    retryable_fragments
        .iter()
        .any(|fragment| message.contains(fragment))
}

fn extract_status_code(message: &str) -> Option<u16> {
    for marker in ["status=", "status:", "status code"] {
        let mut search_start = 0usize;
        while let Some(offset) = message[search_start..].find(marker) {
            let after_marker = search_start + offset + marker.len();
            let digits: String = message[after_marker..]
                .trim_start()
                .chars()
                .take_while(|ch| ch.is_ascii_digit())
                .collect();

            if digits.len() >= 3 {
                if let Ok(status) = digits[..3].parse::<u16>() {
                    return Some(status);
                }
            }

            search_start = after_marker;
        }
    }
    None
}
