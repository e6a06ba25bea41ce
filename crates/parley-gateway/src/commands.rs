//! Administrative chat commands, recognised before admission control.

use parley_config::QueueMode;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    Stop,
    /// `/queue` alone reports the current mode.
    Queue(Option<QueueMode>),
    /// Milliseconds; `/debounce` alone reports the current window.
    Debounce(Option<u64>),
    Approve(String),
    Deny(String),
    Status,
    /// Recognised command with bad arguments; carries the usage hint.
    Invalid(String),
}

/// Parse `text` as a chat command. Returns `None` for ordinary messages.
pub fn parse_command(text: &str) -> Option<ChatCommand> {
    let text = text.trim();
    let rest = text.strip_prefix('/')?;
    let mut words = rest.split_whitespace();
    let name = words.next()?.to_ascii_lowercase();
    let arg = words.next();

    let command = match name.as_str() {
        "stop" => ChatCommand::Stop,
        "status" => ChatCommand::Status,
        "queue" => match arg {
            None => ChatCommand::Queue(None),
            Some(mode) => match mode.parse::<QueueMode>() {
                Ok(mode) => ChatCommand::Queue(Some(mode)),
                Err(e) => ChatCommand::Invalid(e),
            },
        },
        "debounce" => match arg {
            None => ChatCommand::Debounce(None),
            Some("off") => ChatCommand::Debounce(Some(0)),
            Some(ms) => match ms.trim_end_matches("ms").parse::<u64>() {
                Ok(ms) => ChatCommand::Debounce(Some(ms)),
                Err(_) => ChatCommand::Invalid(
                    "Usage: /debounce <milliseconds>, e.g. /debounce 1500".to_string(),
                ),
            },
        },
        "approve" | "deny" => match arg {
            Some(request_id) if name == "approve" => ChatCommand::Approve(request_id.to_string()),
            Some(request_id) => ChatCommand::Deny(request_id.to_string()),
            None => ChatCommand::Invalid(format!("Usage: /{name} <request-id>")),
        },
        _ => return None,
    };
    Some(command)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_not_a_command() {
        assert_eq!(parse_command("hello"), None);
        assert_eq!(parse_command("/unknown thing"), None);
        assert_eq!(parse_command("/"), None);
    }

    #[test]
    fn parses_simple_commands() {
        assert_eq!(parse_command("/stop"), Some(ChatCommand::Stop));
        assert_eq!(parse_command("  /STATUS "), Some(ChatCommand::Status));
    }

    #[test]
    fn parses_queue_mode() {
        assert_eq!(
            parse_command("/queue interrupt"),
            Some(ChatCommand::Queue(Some(QueueMode::Interrupt)))
        );
        assert_eq!(parse_command("/queue"), Some(ChatCommand::Queue(None)));
        assert!(matches!(
            parse_command("/queue sideways"),
            Some(ChatCommand::Invalid(_))
        ));
    }

    #[test]
    fn parses_debounce_window() {
        assert_eq!(
            parse_command("/debounce 2500"),
            Some(ChatCommand::Debounce(Some(2500)))
        );
        assert_eq!(
            parse_command("/debounce 300ms"),
            Some(ChatCommand::Debounce(Some(300)))
        );
        assert_eq!(parse_command("/debounce off"), Some(ChatCommand::Debounce(Some(0))));
        assert!(matches!(
            parse_command("/debounce soon"),
            Some(ChatCommand::Invalid(_))
        ));
    }

    #[test]
    fn parses_approval_decisions() {
        assert_eq!(
            parse_command("/approve abc-123"),
            Some(ChatCommand::Approve("abc-123".into()))
        );
        assert_eq!(
            parse_command("/deny abc-123"),
            Some(ChatCommand::Deny("abc-123".into()))
        );
        assert_eq!(
            parse_command("/approve"),
            Some(ChatCommand::Invalid("Usage: /approve <request-id>".into()))
        );
    }
}
