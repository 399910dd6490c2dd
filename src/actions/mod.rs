//! Manager action protocol: command types and the parser that extracts them.

pub mod command;
pub mod parser;

pub use command::{COMMAND_KINDS, Command};
pub use parser::{ActionParser, JsonActionParser, ParsedOutput};
