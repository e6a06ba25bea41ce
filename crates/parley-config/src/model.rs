use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration. Every section falls back to its defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub rate_limit: RateLimitConfig,
    pub fragments: FragmentConfig,
    pub debounce: DebounceConfig,
    pub queue: QueueConfig,
    pub approval: ApprovalConfig,
    pub failover: FailoverConfig,
    pub agent: AgentConfig,
    pub llm: LlmConfig,
}

/// Sliding-window admission limit per conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_requests: usize,
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 10,
            window_secs: 60,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Thresholds for reassembling a long paste the transport split up.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FragmentConfig {
    pub enabled: bool,
    /// Messages at least this long are treated as a possible split start.
    pub start_threshold_chars: usize,
    pub max_gap_ms: u64,
    pub max_sequence_gap: i64,
    pub max_parts: usize,
    pub max_total_chars: usize,
}

impl Default for FragmentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            start_threshold_chars: 4000,
            max_gap_ms: 1500,
            max_sequence_gap: 1,
            max_parts: 12,
            max_total_chars: 50_000,
        }
    }
}

impl FragmentConfig {
    pub fn max_gap(&self) -> Duration {
        Duration::from_millis(self.max_gap_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebounceConfig {
    pub window_ms: u64,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self { window_ms: 1000 }
    }
}

impl DebounceConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// What to do with a message that arrives while a run is in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueMode {
    #[default]
    Collect,
    Steer,
    Interrupt,
}

impl QueueMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Collect => "collect",
            Self::Steer => "steer",
            Self::Interrupt => "interrupt",
        }
    }
}

impl std::str::FromStr for QueueMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "collect" => Ok(Self::Collect),
            "steer" => Ok(Self::Steer),
            "interrupt" => Ok(Self::Interrupt),
            other => Err(format!(
                "unknown queue mode '{other}'. Use collect, steer or interrupt."
            )),
        }
    }
}

impl std::fmt::Display for QueueMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub default_mode: QueueMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    pub timeout_secs: u64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self { timeout_secs: 60 }
    }
}

impl ApprovalConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    pub primary_model: String,
    pub fallback_models: Vec<String>,
    pub cooldown_secs: u64,
    /// Upper bound on one provider call, independent of cancellation.
    pub request_timeout_secs: u64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            primary_model: "gpt-4o-mini".to_string(),
            fallback_models: Vec::new(),
            cooldown_secs: 60,
            request_timeout_secs: 120,
        }
    }
}

impl FailoverConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub system_prompt: Option<String>,
    pub max_iterations: usize,
    pub max_tokens: Option<u32>,
    pub tool_notifications: bool,
    /// Number of stored turns rendered into the next run's context.
    pub history_turns: usize,
    pub shell_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: None,
            max_iterations: 10,
            max_tokens: Some(4096),
            tool_notifications: true,
            history_turns: 40,
            shell_timeout_secs: 120,
        }
    }
}

/// Connection settings for the bundled OpenAI-compatible provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
}
