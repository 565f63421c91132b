//! Slash commands understood by the REPL.

/// A parsed chat command; never sent to the API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    /// Forget the conversation so far.
    Clear,
    /// Print the connection pool statistics.
    Stats,
    Help,
    Quit,
    /// Unknown command, with a message for the user.
    Invalid(String),
}

/// Parses `input` as a slash command.
///
/// Returns `None` if the input is a regular message.
///
/// ```
/// # use ask::chat::parse_command;
/// assert!(parse_command("/quit").is_some());
/// assert!(parse_command("What is SSE?").is_none());
/// ```
pub fn parse_command(input: &str) -> Option<ChatCommand> {
    let command = input.trim().strip_prefix('/')?;
    let name = command.split_whitespace().next().unwrap_or_default();
    let parsed = match name.to_lowercase().as_str() {
        "clear" => ChatCommand::Clear,
        "stats" => ChatCommand::Stats,
        "help" | "?" => ChatCommand::Help,
        "quit" | "exit" | "q" => ChatCommand::Quit,
        "" => ChatCommand::Invalid("empty command; try /help".to_string()),
        other => ChatCommand::Invalid(format!("unknown command /{other}; try /help")),
    };
    Some(parsed)
}

/// One line per command.
pub fn help_text() -> &'static str {
    "/clear  Forget the conversation so far\n\
     /stats  Show connection pool statistics\n\
     /help   Show this help\n\
     /quit   Exit (also Ctrl-D)"
}
