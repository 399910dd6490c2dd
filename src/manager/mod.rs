//! Manager: debounced coordination turns over inputs and finished results.

pub mod batch;
pub mod history;
pub mod prompt;
pub mod turn;

pub use batch::{TurnBuffer, TurnDecision, decide};
pub use history::{ChatEntry, ChatHistory, ChatRole};
pub use prompt::{build_prompt, manager_timeout};
pub use turn::ManagerLoop;
