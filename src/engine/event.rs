//! Inbound event classification.

use crate::channels::EventPayload;

use super::menu::MenuAction;

/// Top-level commands, accepted from every state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Cancel,
    Reset,
    Menu,
    Help,
    Unknown(String),
}

/// A classified inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Command(Command),
    Menu(MenuAction),
    Text(String),
    UnknownButton(String),
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Command(_) => "command",
            Self::Menu(_) => "menu",
            Self::Text(_) => "text",
            Self::UnknownButton(_) => "unknown_button",
        }
    }
}

/// Parses transport payloads into events.
pub struct EventParser;

impl EventParser {
    pub fn parse(payload: &EventPayload) -> Event {
        match payload {
            EventPayload::Button(id) => match id.parse::<MenuAction>() {
                Ok(action) => Event::Menu(action),
                Err(_) => Event::UnknownButton(id.clone()),
            },
            EventPayload::Text(text) => parse_text(text),
        }
    }
}

fn parse_text(text: &str) -> Event {
    let trimmed = text.trim();
    if !trimmed.starts_with('/') {
        return Event::Text(trimmed.to_string());
    }

    // "/start@FableBot extra" -> "/start"
    let word = trimmed.split_whitespace().next().unwrap_or(trimmed);
    let command = word.split('@').next().unwrap_or(word).to_lowercase();

    Event::Command(match command.as_str() {
        "/start" => Command::Start,
        "/cancel" | "/stop" => Command::Cancel,
        "/reset" => Command::Reset,
        "/menu" => Command::Menu,
        "/help" | "/?" => Command::Help,
        _ => Command::Unknown(command),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> Event {
        EventParser::parse(&EventPayload::Text(s.into()))
    }

    #[test]
    fn commands() {
        assert_eq!(text("/start"), Event::Command(Command::Start));
        assert_eq!(text(" /Cancel "), Event::Command(Command::Cancel));
        assert_eq!(text("/reset"), Event::Command(Command::Reset));
        assert_eq!(text("/menu"), Event::Command(Command::Menu));
        assert_eq!(text("/help"), Event::Command(Command::Help));
    }

    #[test]
    fn bot_suffix_is_stripped() {
        assert_eq!(text("/start@FableBot"), Event::Command(Command::Start));
    }

    #[test]
    fn unknown_command_is_kept() {
        assert_eq!(
            text("/weather now"),
            Event::Command(Command::Unknown("/weather".into()))
        );
    }

    #[test]
    fn plain_text_is_trimmed() {
        assert_eq!(text("  Mia  "), Event::Text("Mia".into()));
        assert_eq!(text("no"), Event::Text("no".into()));
    }

    #[test]
    fn buttons() {
        assert_eq!(
            EventParser::parse(&EventPayload::Button("story_random_moral".into())),
            Event::Menu(MenuAction::RandomMoral)
        );
        assert_eq!(
            EventParser::parse(&EventPayload::Button("old_button".into())),
            Event::UnknownButton("old_button".into())
        );
    }
}
