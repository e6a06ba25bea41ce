pub mod cancel;
pub mod commands;
pub mod coordinator;
pub mod orchestrator;
pub mod rate_limit;

pub use cancel::{CancellationRegistry, StopOutcome};
pub use commands::{ChatCommand, parse_command};
pub use coordinator::{Disposition, RunCoordinator};
pub use orchestrator::{DEBOUNCE_OPTION, Orchestrator, QUEUE_MODE_OPTION};
pub use rate_limit::RateLimiter;
