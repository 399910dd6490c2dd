//! Turning raw manager output into commands plus the text meant for the user.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::actions::command::{COMMAND_KINDS, Command};
use crate::error::ProtocolError;

/// Result of parsing one manager reply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedOutput {
    pub commands: Vec<Command>,
    /// Reply text with the action blocks removed.
    pub visible_text: String,
    /// Blocks or commands that could not be used. Never fatal.
    pub errors: Vec<ProtocolError>,
}

/// Converts raw provider output into structured commands.
pub trait ActionParser: Send + Sync {
    fn parse(&self, raw: &str) -> ParsedOutput;
}

static ACTION_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```action[ \t]*\r?\n(.*?)```").expect("action block pattern is valid")
});

static BLANK_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("blank line pattern is valid"));

/// Reads fenced ```` ```action ```` blocks, each holding one JSON command or
/// an array of them.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonActionParser;

impl JsonActionParser {
    pub fn new() -> Self {
        Self
    }

    fn decode(value: Value, parsed: &mut ParsedOutput) {
        let kind = match value.get("type").and_then(Value::as_str) {
            Some(kind) => kind.to_string(),
            None => {
                parsed
                    .errors
                    .push(ProtocolError::Malformed("command has no \"type\"".to_string()));
                return;
            }
        };
        if !COMMAND_KINDS.contains(&kind.as_str()) {
            parsed.errors.push(ProtocolError::UnknownCommand(kind));
            return;
        }

        match serde_json::from_value::<Command>(value) {
            Ok(command) => match command.validate() {
                Ok(()) => parsed.commands.push(command),
                Err(e) => parsed.errors.push(e),
            },
            Err(e) => parsed.errors.push(ProtocolError::Invalid {
                command: kind,
                reason: e.to_string(),
            }),
        }
    }
}

impl ActionParser for JsonActionParser {
    fn parse(&self, raw: &str) -> ParsedOutput {
        let mut parsed = ParsedOutput::default();

        for capture in ACTION_BLOCK.captures_iter(raw) {
            let body = capture.get(1).map_or("", |m| m.as_str()).trim();
            if body.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(body) {
                Ok(Value::Array(items)) => {
                    for item in items {
                        Self::decode(item, &mut parsed);
                    }
                }
                Ok(value) => Self::decode(value, &mut parsed),
                Err(e) => parsed.errors.push(ProtocolError::Malformed(e.to_string())),
            }
        }

        let stripped = ACTION_BLOCK.replace_all(raw, "");
        parsed.visible_text = BLANK_RUNS.replace_all(&stripped, "\n\n").trim().to_string();
        parsed
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    #[test]
    fn plain_text_has_no_commands() {
        let parsed = JsonActionParser.parse("Nothing to do right now.");
        assert!(parsed.commands.is_empty());
        assert!(parsed.errors.is_empty());
        assert_eq!(parsed.visible_text, "Nothing to do right now.");
    }

    #[test]
    fn single_and_array_blocks() {
        let id = Uuid::new_v4();
        let raw = format!(
            "On it.\n\n```action\n{{\"type\":\"create_task\",\"prompt\":\"draft the memo\"}}\n```\n\n\n\nAlso:\n```action\n[{{\"type\":\"cancel_task\",\"taskId\":\"{id}\"}}]\n```\nDone."
        );
        let parsed = JsonActionParser.parse(&raw);
        assert_eq!(parsed.commands.len(), 2);
        assert_eq!(parsed.commands[0].kind(), "create_task");
        assert_eq!(parsed.commands[1].kind(), "cancel_task");
        assert_eq!(parsed.visible_text, "On it.\n\nAlso:\n\nDone.");
    }

    #[test]
    fn errors_are_collected_not_fatal() {
        let raw = "```action\n{not json}\n```\n```action\n{\"type\":\"launch_rocket\"}\n```\n```action\n{\"type\":\"create_task\",\"prompt\":\"\"}\n```\n```action\n{\"type\":\"create_task\",\"prompt\":\"ok\"}\n```";
        let parsed = JsonActionParser.parse(raw);
        assert_eq!(parsed.commands.len(), 1);
        assert_eq!(parsed.errors.len(), 3);
        assert!(matches!(parsed.errors[0], ProtocolError::Malformed(_)));
        assert_eq!(
            parsed.errors[1],
            ProtocolError::UnknownCommand("launch_rocket".into())
        );
        assert!(matches!(parsed.errors[2], ProtocolError::Invalid { .. }));
    }

    #[test]
    fn missing_field_is_invalid() {
        let parsed = JsonActionParser.parse("```action\n{\"type\":\"cancel_task\"}\n```");
        assert!(parsed.commands.is_empty());
        assert!(matches!(
            &parsed.errors[0],
            ProtocolError::Invalid { command, .. } if command == "cancel_task"
        ));
    }
}
