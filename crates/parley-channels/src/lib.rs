pub mod console;
pub mod debounce;
pub mod fragments;
pub mod traits;

pub use console::{ConsoleChannel, ConsoleSender};
pub use debounce::Debouncer;
pub use fragments::FragmentReassembler;
pub use traits::{ChannelLifecycle, ChannelSender, ChannelStatus, FlushFn, OnMessageFn};
