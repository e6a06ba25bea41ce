pub mod loader;
pub mod model;

pub use loader::ConfigLoader;
pub use model::{
    AgentConfig, AppConfig, ApprovalConfig, DebounceConfig, FailoverConfig, FragmentConfig,
    LlmConfig, QueueConfig, QueueMode, RateLimitConfig,
};
