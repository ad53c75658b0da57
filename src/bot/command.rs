//! Chat text to [`Command`] parsing.
//!
//! Adding a command is a single match arm in [`parse`] plus a reply in
//! [`super::respond`].

use crate::tracker::Target;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `/start` or `/help`.
    Help,
    /// `/list`.
    List,
    /// `/unsubscribe @name` or `/unsubscribe all`.
    Unsubscribe(Target),
    /// `@name` on its own.
    Subscribe(String),
    /// `@name some words`.
    Search { source: String, query: String },
    /// A command whose arguments were wrong; carries the usage line.
    Usage(&'static str),
    /// A slash command we do not know.
    Unknown(String),
}

pub const UNSUBSCRIBE_USAGE: &str = "/unsubscribe @username (or /unsubscribe all)";

/// Parse one incoming message.
///
/// Returns `None` for plain chatter, which the bot ignores.
pub fn parse(text: &str) -> Option<Command> {
    let text = text.trim();

    if let Some(rest) = text.strip_prefix('/') {
        let mut words = rest.split_whitespace();
        let verb = words.next().unwrap_or_default();
        // Group chats address commands as `/list@botname`.
        let verb = verb.split('@').next().unwrap_or_default().to_lowercase();
        let args: Vec<&str> = words.collect();

        return Some(match (verb.as_str(), args.as_slice()) {
            ("start" | "help", _) => Command::Help,
            ("list", _) => Command::List,
            ("unsubscribe", [arg]) if arg.eq_ignore_ascii_case("all") => {
                Command::Unsubscribe(Target::All)
            }
            ("unsubscribe", [arg]) => Command::Unsubscribe(Target::Source(arg.to_string())),
            ("unsubscribe", _) => Command::Usage(UNSUBSCRIBE_USAGE),
            _ => Command::Unknown(format!("/{verb}")),
        });
    }

    if text.starts_with('@') {
        let (source, query) = match text.split_once(char::is_whitespace) {
            Some((source, query)) => (source, query.trim()),
            None => (text, ""),
        };
        return Some(if query.is_empty() {
            Command::Subscribe(source.to_string())
        } else {
            Command::Search {
                source: source.to_string(),
                query: query.to_string(),
            }
        });
    }

    None
}
