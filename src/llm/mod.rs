//! Provider integration.
//!
//! The orchestrator only needs `Provider::run`. `CommandProvider` bridges to
//! any executable that reads a prompt on stdin and prints a reply, which is
//! how the binary talks to a model CLI.

pub mod command;
pub mod provider;

pub use command::CommandProvider;
pub use provider::{Provider, ProviderRequest, ProviderResponse, run_guarded};
