//! Command surface shared by prefix messages and slash commands.

/// A parsed bot command. Arguments are trimmed; an empty argument is kept as
/// an empty string so the controller can answer with usage guidance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ask(String),
    Activate(Option<String>),
    Deactivate,
    Sys(String),
    Clear,
    Guide,
    ListMembers,
}

impl Command {
    /// Parse `<prefix><name> [args]`. Returns `None` for text without the
    /// prefix or with an unknown command name.
    pub fn parse(prefix: &str, content: &str) -> Option<Command> {
        let rest = content.trim_start().strip_prefix(prefix)?;
        let (name, arg) = match rest.find(char::is_whitespace) {
            Some(i) => (&rest[..i], rest[i..].trim()),
            None => (rest, ""),
        };
        Self::from_name(name, arg)
    }

    /// Build a command from its name and raw argument text.
    pub fn from_name(name: &str, arg: &str) -> Option<Command> {
        let arg = arg.trim();
        let cmd = match name.to_ascii_lowercase().as_str() {
            "ask" => Command::Ask(arg.to_string()),
            "activate" => Command::Activate(Some(arg.to_string()).filter(|a| !a.is_empty())),
            "deactivate" => Command::Deactivate,
            "sys" => Command::Sys(arg.to_string()),
            "clear" => Command::Clear,
            "guide" | "assist" => Command::Guide,
            "list_members" => Command::ListMembers,
            _ => return None,
        };
        Some(cmd)
    }

    /// Commands that change channel configuration need Manage Channels in guilds.
    pub fn requires_manage(&self) -> bool {
        matches!(self, Command::Activate(_) | Command::Deactivate | Command::Sys(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Ask(_) => "ask",
            Command::Activate(_) => "activate",
            Command::Deactivate => "deactivate",
            Command::Sys(_) => "sys",
            Command::Clear => "clear",
            Command::Guide => "guide",
            Command::ListMembers => "list_members",
        }
    }
}

pub fn help_text(prefix: &str) -> String {
    let p = prefix;
    format!(
        "**Bot Commands:**\n\
         - `{p}activate [optional system prompt]`: Activate the bot in this channel (every message gets an answer)\n\
         - `{p}deactivate`: Deactivate the bot in this channel\n\
         - `{p}sys <new prompt>`: Change the system prompt for this channel\n\
         - `{p}clear`: Clear the conversation history for this channel\n\
         - `{p}ask <question>`: Ask a question in any channel (attach an image to ask about it)\n\
         - `{p}guide` / `{p}assist`: Show this help message\n\
         - `{p}list_members`: List all members in the current server\n\
         Slash versions are available too: `/ask`, `/activate`, `/deactivate`, `/sys`, `/clear`, `/guide`, `/list_members`."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands_with_arguments() {
        assert_eq!(Command::parse(".", ".ask what is rust?"), Some(Command::Ask("what is rust?".into())));
        assert_eq!(Command::parse(".", ".sys   be terse  "), Some(Command::Sys("be terse".into())));
        assert_eq!(Command::parse(".", ".ask\nmultiline\nquestion"), Some(Command::Ask("multiline\nquestion".into())));
    }

    #[test]
    fn missing_argument_is_empty() {
        assert_eq!(Command::parse(".", ".ask"), Some(Command::Ask(String::new())));
        assert_eq!(Command::parse(".", ".activate"), Some(Command::Activate(None)));
        assert_eq!(Command::parse(".", ".activate pirate mode"), Some(Command::Activate(Some("pirate mode".into()))));
    }

    #[test]
    fn aliases_and_case() {
        assert_eq!(Command::parse(".", ".guide"), Some(Command::Guide));
        assert_eq!(Command::parse(".", ".assist"), Some(Command::Guide));
        assert_eq!(Command::parse(".", ".CLEAR"), Some(Command::Clear));
        assert_eq!(Command::parse("!", "!list_members"), Some(Command::ListMembers));
    }

    #[test]
    fn non_commands() {
        assert_eq!(Command::parse(".", "hello there"), None);
        assert_eq!(Command::parse(".", ".unknown thing"), None);
        assert_eq!(Command::parse(".", "..."), None);
        assert_eq!(Command::parse(".", ""), None);
    }

    #[test]
    fn management_commands() {
        assert!(Command::Activate(None).requires_manage());
        assert!(Command::Sys("x".into()).requires_manage());
        assert!(Command::Deactivate.requires_manage());
        assert!(!Command::Ask("x".into()).requires_manage());
        assert!(!Command::Clear.requires_manage());
    }

    #[test]
    fn help_uses_prefix() {
        let help = help_text("!");
        assert!(help.contains("`!ask <question>`"));
        assert!(help.contains("`!assist`"));
    }
}
