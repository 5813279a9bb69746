//! Terminal front end: line commands in, rendered session updates out.
//!
//! Two renderings are supported. Plain text is meant for a person at the
//! terminal. JSON lines (one object per update) are meant for a wrapping UI
//! process, shaped the way a web front end would consume them.

use std::io::Write;

use serde::Serialize;

use crate::conversation::ReplyState;
use crate::runtime::{Presenter, UserCommand};
use crate::session::Persona;
use crate::state_machine::{SessionState, UiEvent};
use crate::streaming::SideChannelUpdate;

/// Session state as sent to a wrapping UI.
/// Tagged union: { "status": "idle" } or { "status": "recording", "elapsedSecs": 5 }
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum UiState {
    Idle,
    Connecting,
    Ready,
    Recording {
        #[serde(rename = "elapsedSecs")]
        elapsed_secs: u64,
        #[serde(rename = "framesSent")]
        frames_sent: u64,
    },
    Finalizing,
    Disconnected {
        reason: String,
    },
}

impl From<&SessionState> for UiState {
    fn from(state: &SessionState) -> Self {
        match state {
            SessionState::Idle => UiState::Idle,
            SessionState::Connecting { .. } => UiState::Connecting,
            SessionState::Ready { .. } => UiState::Ready,
            SessionState::Recording {
                started_at,
                frames_sent,
                ..
            } => UiState::Recording {
                elapsed_secs: started_at.elapsed().as_secs(),
                frames_sent: *frames_sent,
            },
            SessionState::Finalizing { .. } => UiState::Finalizing,
            SessionState::Disconnected { reason } => UiState::Disconnected {
                reason: reason.clone(),
            },
        }
    }
}

/// One JSON line per presentation update
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
enum JsonLine<'a> {
    StateUpdate { state: UiState },
    Session { id: &'a str },
    Persona { tag: &'a str, name: &'a str },
    Partial { text: &'a str },
    UserTurn { turn: usize, text: &'a str },
    UserTurnRevised { turn: usize, text: &'a str },
    NoSpeech,
    ReplyStarted { turn: usize },
    ReplyUpdated { turn: usize, content: &'a str },
    ReplySealed {
        turn: usize,
        state: ReplyState,
        content: &'a str,
    },
    ReplySaved,
    SpeechStarted,
    SpeechFinished,
    SideChannel { text: String },
    ConfigurationRequired {
        message: &'a str,
        #[serde(rename = "missingKeys")]
        missing_keys: &'a [String],
    },
    HistoryRestored { turns: usize },
    Status { entry: &'a crate::status::StatusEntry },
    Speak { text: &'a str },
}

/// Text line on screen that is not newline-terminated yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenLine {
    None,
    /// Live partial transcript, rewritten in place
    Partial,
    /// Assistant reply for `turn`; `shown` bytes of its content are printed
    Reply { turn: usize, shown: usize },
}

/// Writes session updates to a terminal or any other writer
pub struct ConsolePresenter<W: Write> {
    out: W,
    json: bool,
    open: OpenLine,
}

impl ConsolePresenter<std::io::Stdout> {
    pub fn stdout(json: bool) -> Self {
        Self::new(std::io::stdout(), json)
    }
}

impl<W: Write> ConsolePresenter<W> {
    pub fn new(out: W, json: bool) -> Self {
        Self {
            out,
            json,
            open: OpenLine::None,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn line(&mut self, text: &str) {
        self.close_line();
        let _ = writeln!(self.out, "{}", text);
        let _ = self.out.flush();
    }

    fn close_line(&mut self) {
        if self.open != OpenLine::None {
            let _ = writeln!(self.out);
            self.open = OpenLine::None;
        }
    }

    /// Print the part of a streaming reply not yet on screen
    fn reply_progress(&mut self, turn: usize, content: &str) {
        let tail = match self.open {
            OpenLine::Reply { turn: open, shown } if open == turn => content.get(shown..),
            _ => None,
        };
        match tail {
            Some(tail) => {
                let _ = write!(self.out, "{}", tail);
            }
            None => {
                self.close_line();
                let _ = write!(self.out, "Assistant: {}", content);
            }
        }
        let _ = self.out.flush();
        self.open = OpenLine::Reply {
            turn,
            shown: content.len(),
        };
    }

    fn emit_json(&mut self, line: &JsonLine<'_>) {
        match serde_json::to_string(line) {
            Ok(json) => {
                let _ = writeln!(self.out, "{}", json);
                let _ = self.out.flush();
            }
            Err(e) => log::warn!("Console: failed to serialize update: {}", e),
        }
    }

    fn present_json(&mut self, event: &UiEvent) {
        let line = match event {
            UiEvent::StateChanged(state) => JsonLine::StateUpdate {
                state: UiState::from(state),
            },
            UiEvent::SessionAssigned(id) => JsonLine::Session { id: id.as_str() },
            UiEvent::PersonaConfirmed(persona) => JsonLine::Persona {
                tag: persona.tag(),
                name: persona.display_name(),
            },
            UiEvent::PartialTranscript(text) => JsonLine::Partial { text },
            UiEvent::UserTurn { turn, text } => JsonLine::UserTurn { turn: *turn, text },
            UiEvent::UserTurnRevised { turn, text } => JsonLine::UserTurnRevised { turn: *turn, text },
            UiEvent::NoSpeech => JsonLine::NoSpeech,
            UiEvent::ReplyStarted { turn } => JsonLine::ReplyStarted { turn: *turn },
            UiEvent::ReplyUpdated { turn, content } => JsonLine::ReplyUpdated {
                turn: *turn,
                content,
            },
            UiEvent::ReplySealed {
                turn,
                state,
                content,
            } => JsonLine::ReplySealed {
                turn: *turn,
                state: *state,
                content,
            },
            UiEvent::ReplySaved => JsonLine::ReplySaved,
            UiEvent::SpeechStarted => JsonLine::SpeechStarted,
            UiEvent::SpeechFinished => JsonLine::SpeechFinished,
            UiEvent::SideChannel(update) => JsonLine::SideChannel {
                text: describe_side_channel(update),
            },
            UiEvent::ConfigurationRequired {
                message,
                missing_keys,
            } => JsonLine::ConfigurationRequired {
                message,
                missing_keys,
            },
            UiEvent::HistoryRestored { turns } => JsonLine::HistoryRestored { turns: *turns },
            UiEvent::Status(entry) => JsonLine::Status { entry },
        };
        self.emit_json(&line);
    }

    fn present_text(&mut self, event: &UiEvent) {
        match event {
            UiEvent::StateChanged(state) => self.line(&format!("-- {} --", state.as_str())),
            UiEvent::SessionAssigned(id) => self.line(&format!("Session: {}", id)),
            UiEvent::PersonaConfirmed(persona) => self.line(&format!("Persona: {}", persona)),
            UiEvent::PartialTranscript(text) => {
                if matches!(self.open, OpenLine::Reply { .. }) {
                    self.close_line();
                }
                // Rewrite the live line in place
                let _ = write!(self.out, "\r\x1b[2K... {}", text);
                let _ = self.out.flush();
                self.open = OpenLine::Partial;
            }
            UiEvent::UserTurn { text, .. } => {
                if self.open == OpenLine::Partial {
                    let _ = write!(self.out, "\r\x1b[2K");
                    self.open = OpenLine::None;
                }
                self.line(&format!("You: {}", text));
            }
            UiEvent::UserTurnRevised { text, .. } => self.line(&format!("You (revised): {}", text)),
            UiEvent::NoSpeech => self.line("(no speech detected)"),
            UiEvent::ReplyStarted { turn } => self.reply_progress(*turn, ""),
            UiEvent::ReplyUpdated { turn, content } => self.reply_progress(*turn, content),
            UiEvent::ReplySealed {
                turn,
                state,
                content,
            } => match state {
                ReplyState::Failed => self.line(&format!("Assistant (error): {}", content)),
                ReplyState::Complete | ReplyState::Pending => {
                    self.reply_progress(*turn, content);
                    self.close_line();
                }
                ReplyState::Incomplete => {
                    if matches!(self.open, OpenLine::Reply { turn: open, .. } if open == *turn) {
                        self.reply_progress(*turn, content);
                        self.line("(reply incomplete)");
                    } else {
                        self.line(&format!("Assistant (incomplete): {}", content));
                    }
                }
            },
            UiEvent::ReplySaved => log::debug!("Console: reply saved"),
            UiEvent::SpeechStarted => log::debug!("Console: speech started"),
            UiEvent::SpeechFinished => log::debug!("Console: speech finished"),
            UiEvent::SideChannel(update) => {
                let text = describe_side_channel(update);
                self.line(&text);
            }
            UiEvent::ConfigurationRequired {
                message,
                missing_keys,
            } => {
                self.line(&format!("Configuration required: {}", message));
                for key in missing_keys {
                    self.line(&format!("  missing: {}", key));
                }
            }
            UiEvent::HistoryRestored { turns } => {
                self.line(&format!("Restored {} earlier turns", turns))
            }
            UiEvent::Status(entry) => self.line(&entry.render()),
        }
    }
}

impl<W: Write> Presenter for ConsolePresenter<W> {
    fn present(&mut self, event: &UiEvent) {
        if self.json {
            self.present_json(event);
        } else {
            self.present_text(event);
        }
    }

    fn speak(&mut self, text: &str) {
        if self.json {
            self.emit_json(&JsonLine::Speak { text });
        } else {
            self.line(&format!("(speaking) {}", text));
        }
    }
}

fn describe_side_channel(update: &SideChannelUpdate) -> String {
    match update {
        SideChannelUpdate::WeatherPending { message }
        | SideChannelUpdate::QuotePending { message } => message.clone(),
        SideChannelUpdate::WeatherReport {
            location,
            temperature,
            description,
            report,
        } => {
            let mut text = format!("Weather in {}", location);
            if let Some(t) = temperature {
                text.push_str(&format!(": {:.1}°C", t));
            }
            if !description.is_empty() {
                text.push_str(&format!(", {}", description));
            }
            if !report.is_empty() {
                text.push_str(&format!("\n{}", report));
            }
            text
        }
        SideChannelUpdate::WeatherFailed { message } => format!("Weather error: {}", message),
        SideChannelUpdate::WeatherLocationNeeded { message } => message.clone(),
        SideChannelUpdate::Quote { quote, author } => {
            if author.is_empty() {
                format!("\"{}\"", quote)
            } else {
                format!("\"{}\" by {}", quote, author)
            }
        }
        SideChannelUpdate::QuoteFailed { message } => format!("Quote error: {}", message),
    }
}

pub const HELP: &str = "\
Commands:
  start | stop | toggle     control the voice session
  persona <name>            developer, aizen, luffy, politician
  weather <location>        request a weather report
  listen-weather            treat the next utterance as a location
  quote                     request a quote
  clear-history             delete this session's saved history
  quit";

/// Parse one line of console input. Returns `None` for blank or unknown
/// input.
pub fn parse_command(line: &str) -> Option<UserCommand> {
    let line = line.trim();
    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line, ""),
    };

    let command = match verb.to_ascii_lowercase().as_str() {
        "start" => UserCommand::Start,
        "stop" => UserCommand::Stop,
        "toggle" | "t" => UserCommand::Toggle,
        "persona" if !rest.is_empty() => UserCommand::Persona(Persona::from_tag(rest)),
        "weather" => UserCommand::Weather(rest.to_string()),
        "listen-weather" => UserCommand::ListenForWeather,
        "quote" => UserCommand::Quote,
        "clear-history" => UserCommand::ClearHistory,
        "quit" | "exit" | "q" => UserCommand::Quit,
        _ => return None,
    };
    Some(command)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionId;
    use std::time::Instant;
    use uuid::Uuid;

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse_command("start"), Some(UserCommand::Start));
        assert_eq!(parse_command("  STOP "), Some(UserCommand::Stop));
        assert_eq!(
            parse_command("persona Luffy"),
            Some(UserCommand::Persona(Persona::Luffy))
        );
        assert_eq!(
            parse_command("weather  New York "),
            Some(UserCommand::Weather("New York".to_string()))
        );
        assert_eq!(
            parse_command("weather"),
            Some(UserCommand::Weather(String::new()))
        );
        assert_eq!(parse_command("clear-history"), Some(UserCommand::ClearHistory));
        assert_eq!(parse_command("persona"), None);
        assert_eq!(parse_command(""), None);
        assert_eq!(parse_command("dance"), None);
    }

    #[test]
    fn test_ui_state_serialization() {
        let json = serde_json::to_string(&UiState::from(&SessionState::Idle)).unwrap();
        assert_eq!(json, r#"{"status":"idle"}"#);

        let recording = SessionState::Recording {
            connection_id: Uuid::new_v4(),
            started_at: Instant::now(),
            frames_sent: 3,
        };
        let json = serde_json::to_string(&UiState::from(&recording)).unwrap();
        assert_eq!(json, r#"{"status":"recording","elapsedSecs":0,"framesSent":3}"#);
    }

    #[test]
    fn test_text_rendering() {
        let mut presenter = ConsolePresenter::new(Vec::new(), false);
        presenter.present(&UiEvent::PartialTranscript("hel".to_string()));
        presenter.present(&UiEvent::UserTurn {
            turn: 0,
            text: "hello".to_string(),
        });
        presenter.present(&UiEvent::ReplySealed {
            turn: 0,
            state: ReplyState::Incomplete,
            content: "Hi".to_string(),
        });
        presenter.speak("Keep going. by Anon");

        let out = String::from_utf8(presenter.into_inner()).unwrap();
        assert!(out.contains("You: hello\n"));
        assert!(out.contains("Assistant (incomplete): Hi\n"));
        assert!(out.ends_with("(speaking) Keep going. by Anon\n"));
    }

    #[test]
    fn test_reply_renders_progressively() {
        let mut presenter = ConsolePresenter::new(Vec::new(), false);
        presenter.present(&UiEvent::ReplyStarted { turn: 2 });
        presenter.present(&UiEvent::ReplyUpdated {
            turn: 2,
            content: "Hel".to_string(),
        });
        presenter.present(&UiEvent::ReplyUpdated {
            turn: 2,
            content: "Hello".to_string(),
        });
        let out = String::from_utf8(presenter.into_inner()).unwrap();
        assert_eq!(out, "Assistant: Hello");

        let mut presenter = ConsolePresenter::new(Vec::new(), false);
        presenter.present(&UiEvent::ReplyStarted { turn: 0 });
        presenter.present(&UiEvent::ReplyUpdated {
            turn: 0,
            content: "Hello".to_string(),
        });
        presenter.present(&UiEvent::ReplySealed {
            turn: 0,
            state: ReplyState::Complete,
            content: "Hello there".to_string(),
        });
        presenter.present(&UiEvent::Status(crate::status::StatusEntry::new(
            crate::status::StatusLevel::Info,
            "done",
        )));
        let out = String::from_utf8(presenter.into_inner()).unwrap();
        assert!(out.starts_with("Assistant: Hello there\n"));
        assert_eq!(out.matches("Assistant:").count(), 1);
    }

    #[test]
    fn test_reply_interrupted_by_another_line_resumes_on_new_line() {
        let mut presenter = ConsolePresenter::new(Vec::new(), false);
        presenter.present(&UiEvent::ReplyUpdated {
            turn: 0,
            content: "one".to_string(),
        });
        presenter.present(&UiEvent::UserTurnRevised {
            turn: 0,
            text: "Hi.".to_string(),
        });
        presenter.present(&UiEvent::ReplyUpdated {
            turn: 0,
            content: "one two".to_string(),
        });
        let out = String::from_utf8(presenter.into_inner()).unwrap();
        assert_eq!(out, "Assistant: one\nYou (revised): Hi.\nAssistant: one two");
    }

    #[test]
    fn test_json_rendering() {
        let mut presenter = ConsolePresenter::new(Vec::new(), true);
        presenter.present(&UiEvent::SessionAssigned(SessionId::new("s1").unwrap()));
        presenter.present(&UiEvent::ConfigurationRequired {
            message: "Please provide your API keys".to_string(),
            missing_keys: vec!["MURF_API_KEY".to_string()],
        });
        presenter.present(&UiEvent::UserTurnRevised {
            turn: 0,
            text: "What time is it?".to_string(),
        });

        let out = String::from_utf8(presenter.into_inner()).unwrap();
        let lines: Vec<serde_json::Value> = out
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines[0]["event"], "session");
        assert_eq!(lines[0]["id"], "s1");
        assert_eq!(lines[1]["event"], "configuration-required");
        assert_eq!(lines[1]["missingKeys"][0], "MURF_API_KEY");
        assert_eq!(lines[2]["event"], "user-turn-revised");
        assert_eq!(lines[2]["text"], "What time is it?");
    }

    #[test]
    fn test_describe_weather_report() {
        let text = describe_side_channel(&SideChannelUpdate::WeatherReport {
            location: "Paris".to_string(),
            temperature: Some(21.04),
            description: "clear sky".to_string(),
            report: String::new(),
        });
        assert_eq!(text, "Weather in Paris: 21.0°C, clear sky");
    }
}
