pub mod approval;
pub mod danger;

pub use approval::{ApprovalGate, ApprovalTicket};
pub use danger::is_dangerous;
