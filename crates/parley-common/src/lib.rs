pub mod error;
pub mod message;
pub mod turn;
pub mod types;

pub use error::{Error, Result};
pub use message::InboundMessage;
pub use turn::{ConversationTurn, ToolCall, TurnRole};
pub use types::ConversationId;
