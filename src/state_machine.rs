//! Protocol state machine for a voice agent session
//!
//! All session state changes go through `SessionController::handle()`, which
//! applies one event and returns the effects to execute. The controller never
//! performs I/O; the runtime executes effects and feeds results back in as
//! events.
//!
//! Transport and capture events carry the id of the connection they belong
//! to. Events for any other connection are stale and ignored.

use std::time::Instant;
use uuid::Uuid;

use crate::conversation::{Conversation, ReplyState};
use crate::error::{CaptureError, ClientError, TransportError};
use crate::history::{pair_turns, HistoryMessage};
use crate::session::{Persona, Session, SessionId};
use crate::status::{StatusEntry, StatusLevel, StatusLog};
use crate::streaming::protocol::{ClientMessage, Command, Outbound, ServerMessage};
use crate::streaming::response::{ResponseOutcome, ResponseRenderer};
use crate::streaming::side_channel::{SideChannelUpdate, WeatherIntent, WeatherListener};
use crate::streaming::transcript::{TranscriptOutcome, TranscriptRenderer};

/// Session lifecycle state.
/// This is the authoritative state; UI affordances are derived from it.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Connecting {
        connection_id: Uuid,
    },
    /// Handshake acknowledged, capture requested
    Ready {
        connection_id: Uuid,
    },
    Recording {
        connection_id: Uuid,
        started_at: Instant,
        frames_sent: u64,
    },
    /// Stop sent; waiting for the backend to close the connection
    Finalizing {
        connection_id: Uuid,
    },
    Disconnected {
        reason: String,
    },
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting { .. } => "connecting",
            SessionState::Ready { .. } => "ready",
            SessionState::Recording { .. } => "recording",
            SessionState::Finalizing { .. } => "finalizing",
            SessionState::Disconnected { .. } => "disconnected",
        }
    }

    /// Id of the connection this state owns, if any
    pub fn connection_id(&self) -> Option<Uuid> {
        match self {
            SessionState::Connecting { connection_id }
            | SessionState::Ready { connection_id }
            | SessionState::Recording { connection_id, .. }
            | SessionState::Finalizing { connection_id } => Some(*connection_id),
            SessionState::Idle | SessionState::Disconnected { .. } => None,
        }
    }

    /// Whether a start action is accepted
    pub fn can_start(&self) -> bool {
        matches!(self, SessionState::Idle | SessionState::Disconnected { .. })
    }
}

/// Events that can trigger state transitions.
#[derive(Debug, Clone)]
pub enum Event {
    // User actions
    StartRequested,
    StopRequested,
    PersonaSelected(Persona),
    /// Treat the next committed utterance as a weather location
    ListenForWeather,
    WeatherRequested(String),
    QuoteRequested,

    // Transport events
    TransportOpened {
        connection_id: Uuid,
    },
    TransportFailed {
        connection_id: Uuid,
        error: TransportError,
    },
    TransportClosed {
        connection_id: Uuid,
        reason: Option<String>,
    },
    Inbound {
        connection_id: Uuid,
        message: ServerMessage,
    },
    /// Inbound text that did not decode as a server message
    Malformed {
        connection_id: Uuid,
        error: String,
    },

    // Capture events
    CaptureStarted {
        connection_id: Uuid,
    },
    CaptureFailed {
        connection_id: Uuid,
        error: CaptureError,
    },
    FrameCaptured {
        connection_id: Uuid,
        frame: Vec<i16>,
    },

    // Playback events
    PlaybackFailed(String),
    /// End of stream reached and every scheduled buffer has played
    PlaybackDrained,

    // History
    HistoryLoaded(Vec<HistoryMessage>),
    HistoryCleared,
    HistoryFailed(String),
}

/// Commands for the audio playback scheduler
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackCommand {
    /// New utterance: clear queue and re-arm header stripping
    Reset,
    Chunk { audio_base64: String, is_final: bool },
    /// End of stream with no more audio coming
    Finish,
}

/// Presentation updates. Renderers are free to ignore any of them.
#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    StateChanged(SessionState),
    SessionAssigned(SessionId),
    PersonaConfirmed(Persona),
    /// Replace the live partial line
    PartialTranscript(String),
    /// A user turn was committed; the live partial line is cleared
    UserTurn { turn: usize, text: String },
    /// A committed user turn was re-sent with new text (e.g. formatted)
    UserTurnRevised { turn: usize, text: String },
    NoSpeech,
    ReplyStarted { turn: usize },
    ReplyUpdated { turn: usize, content: String },
    ReplySealed {
        turn: usize,
        state: ReplyState,
        content: String,
    },
    ReplySaved,
    SpeechStarted,
    SpeechFinished,
    SideChannel(SideChannelUpdate),
    /// Blocking prompt: the backend needs configuration before any session
    ConfigurationRequired {
        message: String,
        missing_keys: Vec<String>,
    },
    HistoryRestored { turns: usize },
    Status(StatusEntry),
}

/// Effects to be executed after an event is applied.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Open a connection; any previous one must be torn down first
    Connect { connection_id: Uuid },
    Send(Outbound),
    StartCapture { connection_id: Uuid },
    /// Release the capture device synchronously
    StopCapture,
    /// Flush queued messages and close the connection
    CloseTransport,
    Playback(PlaybackCommand),
    /// Local speech-synthesis fallback for side channels without backend audio
    SpeakLocally { text: String },
    Ui(UiEvent),
}

/// Owns the session object graph and applies events to it.
pub struct SessionController {
    state: SessionState,
    session: Session,
    conversation: Conversation,
    transcript: TranscriptRenderer,
    response: ResponseRenderer,
    weather: WeatherListener,
    status: StatusLog,
    /// Socket is up for the current connection id
    transport_open: bool,
    /// Turn holding the reply currently streaming
    reply_turn: Option<usize>,
    /// Turn of the last committed user utterance
    user_turn: Option<usize>,
    missing_capability: Option<ClientError>,
}

impl SessionController {
    pub fn new(session: Session) -> Self {
        Self {
            state: SessionState::Idle,
            session,
            conversation: Conversation::new(),
            transcript: TranscriptRenderer::new(),
            response: ResponseRenderer::new(),
            weather: WeatherListener::default(),
            status: StatusLog::default(),
            transport_open: false,
            reply_turn: None,
            user_turn: None,
            missing_capability: None,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn transcript(&self) -> &TranscriptRenderer {
        &self.transcript
    }

    pub fn status_log(&self) -> &StatusLog {
        &self.status
    }

    pub fn is_listening_for_weather(&self) -> bool {
        self.weather.is_active()
    }

    /// Set when the backend reported missing keys; cleared by the next start
    pub fn missing_capability(&self) -> Option<&ClientError> {
        self.missing_capability.as_ref()
    }

    /// Apply one event. Returns the effects to execute, in order.
    pub fn handle(&mut self, event: Event) -> Vec<Effect> {
        let mut effects = Vec::new();

        match event {
            Event::StartRequested => self.on_start(&mut effects),
            Event::StopRequested => self.on_stop(&mut effects),
            Event::PersonaSelected(persona) => self.on_persona_selected(persona, &mut effects),
            Event::ListenForWeather => {
                self.weather.activate();
                self.report(
                    StatusLevel::Info,
                    "Listening for a location: say something like \"weather in Paris\"",
                    &mut effects,
                );
            }
            Event::WeatherRequested(location) => {
                self.request_weather(location.trim(), &mut effects)
            }
            Event::QuoteRequested => self.request_quote(&mut effects),

            Event::TransportOpened { connection_id } => {
                if self.is_current(connection_id) {
                    self.transport_open = true;
                    self.report(
                        StatusLevel::Info,
                        "Connected, waiting for the server to get ready...",
                        &mut effects,
                    );
                }
            }
            Event::TransportFailed {
                connection_id,
                error,
            } => {
                if self.is_current(connection_id) {
                    let err = ClientError::from(error);
                    self.report(StatusLevel::Error, err.to_string(), &mut effects);
                    self.end_connection(
                        SessionState::Disconnected {
                            reason: err.to_string(),
                        },
                        &mut effects,
                    );
                }
            }
            Event::TransportClosed {
                connection_id,
                reason,
            } => {
                if self.is_current(connection_id) {
                    self.on_transport_closed(reason, &mut effects);
                }
            }
            Event::Inbound {
                connection_id,
                message,
            } => {
                if self.is_current(connection_id) {
                    self.dispatch(message, &mut effects);
                } else {
                    log::debug!("Ignoring stale {} message", message.kind());
                }
            }
            Event::Malformed {
                connection_id,
                error,
            } => {
                if self.is_current(connection_id) {
                    let err = ClientError::Protocol(error);
                    self.report(StatusLevel::Warning, err.to_string(), &mut effects);
                }
            }

            Event::CaptureStarted { connection_id } => {
                if self.is_current(connection_id) {
                    self.report(
                        StatusLevel::Info,
                        "Microphone open, start speaking",
                        &mut effects,
                    );
                }
            }
            Event::CaptureFailed {
                connection_id,
                error,
            } => {
                if self.is_current(connection_id) {
                    let err = ClientError::CaptureUnavailable(error);
                    self.report(StatusLevel::Error, err.to_string(), &mut effects);
                    self.end_connection(
                        SessionState::Disconnected {
                            reason: err.to_string(),
                        },
                        &mut effects,
                    );
                }
            }
            Event::FrameCaptured {
                connection_id,
                frame,
            } => self.on_frame(connection_id, frame, &mut effects),

            Event::PlaybackFailed(error) => {
                let err = ClientError::Protocol(error);
                self.report(StatusLevel::Warning, err.to_string(), &mut effects);
            }
            Event::PlaybackDrained => effects.push(Effect::Ui(UiEvent::SpeechFinished)),

            Event::HistoryLoaded(messages) => {
                let turns = pair_turns(&messages);
                let count = turns.len();
                for turn in turns {
                    self.conversation.push_restored(turn.user, turn.assistant);
                }
                if count > 0 {
                    effects.push(Effect::Ui(UiEvent::HistoryRestored { turns: count }));
                    self.report(
                        StatusLevel::Info,
                        format!("Restored {} turns from history", count),
                        &mut effects,
                    );
                }
            }
            Event::HistoryCleared => {
                self.report(
                    StatusLevel::Info,
                    "Saved history cleared on the server",
                    &mut effects,
                );
            }
            Event::HistoryFailed(error) => {
                self.report(
                    StatusLevel::Warning,
                    format!("Could not load history: {}", error),
                    &mut effects,
                );
            }
        }

        effects
    }

    fn is_current(&self, connection_id: Uuid) -> bool {
        self.state.connection_id() == Some(connection_id)
    }

    fn set_state(&mut self, next: SessionState, effects: &mut Vec<Effect>) {
        if self.state.as_str() != next.as_str() {
            log::info!("State: {} -> {}", self.state.as_str(), next.as_str());
        }
        self.state = next;
        effects.push(Effect::Ui(UiEvent::StateChanged(self.state.clone())));
    }

    fn report(&mut self, level: StatusLevel, message: impl Into<String>, effects: &mut Vec<Effect>) {
        let entry = self.status.push(level, message);
        effects.push(Effect::Ui(UiEvent::Status(entry)));
    }

    fn send(&mut self, outbound: Outbound, effects: &mut Vec<Effect>) -> bool {
        if self.transport_open && self.state.connection_id().is_some() {
            effects.push(Effect::Send(outbound));
            true
        } else {
            false
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    fn on_start(&mut self, effects: &mut Vec<Effect>) {
        if !self.state.can_start() {
            log::debug!("Start ignored in state {}", self.state.as_str());
            return;
        }
        let connection_id = Uuid::new_v4();
        self.missing_capability = None;
        self.transport_open = false;
        self.transcript.reset();
        self.set_state(SessionState::Connecting { connection_id }, effects);
        effects.push(Effect::Connect { connection_id });
        self.report(StatusLevel::Info, "Connecting to voice agent...", effects);
    }

    fn on_stop(&mut self, effects: &mut Vec<Effect>) {
        match self.state {
            SessionState::Ready { connection_id }
            | SessionState::Recording { connection_id, .. } => {
                effects.push(Effect::StopCapture);
                self.send(Outbound::Command(Command::StopStreaming), effects);
                self.set_state(SessionState::Finalizing { connection_id }, effects);
                self.report(StatusLevel::Info, "Recording stopped", effects);
            }
            SessionState::Connecting { .. } => {
                self.report(StatusLevel::Info, "Connection cancelled", effects);
                self.end_connection(SessionState::Idle, effects);
            }
            SessionState::Finalizing { .. } => {
                // Second stop: stop waiting for the backend
                self.end_connection(SessionState::Idle, effects);
            }
            SessionState::Idle | SessionState::Disconnected { .. } => {
                log::debug!("Stop ignored in state {}", self.state.as_str());
            }
        }
    }

    fn on_transport_closed(&mut self, reason: Option<String>, effects: &mut Vec<Effect>) {
        if matches!(self.state, SessionState::Finalizing { .. }) {
            self.report(StatusLevel::Info, "Session ended", effects);
            self.end_connection(SessionState::Idle, effects);
            return;
        }

        let reason = reason.unwrap_or_else(|| "Connection closed".to_string());
        let err = ClientError::from(TransportError::Closed(reason));
        self.report(StatusLevel::Error, err.to_string(), effects);
        self.end_connection(
            SessionState::Disconnected {
                reason: err.to_string(),
            },
            effects,
        );
    }

    /// Tear down capture and transport and leave any pending reply visibly
    /// incomplete.
    fn end_connection(&mut self, next: SessionState, effects: &mut Vec<Effect>) {
        effects.push(Effect::StopCapture);
        effects.push(Effect::CloseTransport);
        self.transport_open = false;
        self.transcript.reset();
        self.weather.deactivate();

        if self.conversation.abandon_pending() {
            if let Some(turn) = self.reply_turn.take() {
                if let Some(event) = self.sealed_event(turn) {
                    effects.push(Effect::Ui(event));
                }
            }
            self.report(
                StatusLevel::Warning,
                "Assistant reply left incomplete",
                effects,
            );
        }
        self.set_state(next, effects);
    }

    fn on_frame(&mut self, connection_id: Uuid, frame: Vec<i16>, effects: &mut Vec<Effect>) {
        match &mut self.state {
            SessionState::Ready { connection_id: id } if *id == connection_id => {
                let next = SessionState::Recording {
                    connection_id,
                    started_at: Instant::now(),
                    frames_sent: 1,
                };
                effects.push(Effect::Send(Outbound::Audio(frame)));
                self.set_state(next, effects);
            }
            SessionState::Recording {
                connection_id: id,
                frames_sent,
                ..
            } if *id == connection_id => {
                *frames_sent += 1;
                effects.push(Effect::Send(Outbound::Audio(frame)));
            }
            _ => log::debug!("Dropping frame in state {}", self.state.as_str()),
        }
    }

    // ------------------------------------------------------------------
    // User side channels
    // ------------------------------------------------------------------

    fn on_persona_selected(&mut self, persona: Persona, effects: &mut Vec<Effect>) {
        let sent = self.send(
            Outbound::Control(ClientMessage::persona_update(persona.tag())),
            effects,
        );
        let message = if sent {
            format!("Persona change requested: {}", persona.display_name())
        } else {
            format!(
                "Persona {} will be used for the next session",
                persona.display_name()
            )
        };
        self.session.request_persona(persona);
        self.report(StatusLevel::Info, message, effects);
    }

    fn request_weather(&mut self, location: &str, effects: &mut Vec<Effect>) {
        if location.is_empty() {
            self.report(
                StatusLevel::Warning,
                "Please provide a location for the weather request",
                effects,
            );
            return;
        }
        if self.send(
            Outbound::Control(ClientMessage::get_weather(location)),
            effects,
        ) {
            self.report(
                StatusLevel::Info,
                format!("Requesting weather for {}", location),
                effects,
            );
        } else {
            self.report(
                StatusLevel::Warning,
                "Not connected: start a session to request the weather",
                effects,
            );
        }
    }

    fn request_quote(&mut self, effects: &mut Vec<Effect>) {
        if self.send(Outbound::Control(ClientMessage::GetQuote), effects) {
            self.report(StatusLevel::Info, "Requesting a quote", effects);
        } else {
            self.report(
                StatusLevel::Warning,
                "Not connected: start a session to request a quote",
                effects,
            );
        }
    }

    // ------------------------------------------------------------------
    // Inbound dispatch
    // ------------------------------------------------------------------

    fn dispatch(&mut self, message: ServerMessage, effects: &mut Vec<Effect>) {
        match message {
            ServerMessage::ApiKeysRequired {
                message,
                missing_keys,
            } => {
                let err = ClientError::MissingCapability {
                    message: message.clone(),
                    missing_keys: missing_keys.clone(),
                };
                self.report(StatusLevel::Error, err.to_string(), effects);
                effects.push(Effect::Ui(UiEvent::ConfigurationRequired {
                    message,
                    missing_keys,
                }));
                self.end_connection(
                    SessionState::Disconnected {
                        reason: err.to_string(),
                    },
                    effects,
                );
                self.missing_capability = Some(err);
            }
            ServerMessage::AudioStreamReady {
                session_id,
                transcription_enabled,
                message,
            } => self.on_ready(session_id, transcription_enabled, message, effects),
            ServerMessage::ChunkAck {
                chunk_number,
                total_bytes,
            } => {
                log::debug!(
                    "Server acknowledged chunk {:?} ({:?} bytes total)",
                    chunk_number,
                    total_bytes
                );
            }
            ServerMessage::CommandResponse { message, .. }
            | ServerMessage::TranscriptionReady { message }
            | ServerMessage::TranscriptionSessionStarted { message }
            | ServerMessage::TranscriptionSessionTerminated { message }
            | ServerMessage::TranscriptionStopped { message } => {
                if !message.is_empty() {
                    self.report(StatusLevel::Info, message, effects);
                }
            }

            // Transcript
            ServerMessage::PartialTranscript { text } => {
                if let TranscriptOutcome::Partial(text) = self.transcript.on_partial(&text) {
                    effects.push(Effect::Ui(UiEvent::PartialTranscript(text)));
                }
            }
            ServerMessage::FinalTranscript {
                text,
                turn_order,
                turn_is_formatted,
            } => {
                log::debug!(
                    "Final transcript for turn {:?} (formatted: {})",
                    turn_order,
                    turn_is_formatted
                );
                let outcome = self.transcript.on_final(&text, turn_order);
                self.on_transcript_outcome(outcome, effects);
            }
            ServerMessage::TurnEnd {
                final_transcript,
                turn_order,
                ..
            } => {
                let outcome = self.transcript.on_turn_end(&final_transcript, turn_order);
                self.on_transcript_outcome(outcome, effects);
            }
            ServerMessage::TranscriptionComplete { text } => {
                if !text.is_empty() {
                    self.report(
                        StatusLevel::Info,
                        format!("Transcription complete: {}", text),
                        effects,
                    );
                }
            }
            ServerMessage::StreamingComplete { message, .. } => {
                self.report(StatusLevel::Info, message, effects);
            }
            ServerMessage::TranscriptionError { message } => {
                let err = ClientError::UpstreamGeneration(message);
                self.report(StatusLevel::Error, err.to_string(), effects);
            }

            // Assistant generation
            ServerMessage::LlmStreamingStart { user_message, .. } => {
                let user_text = if user_message.trim().is_empty() {
                    self.conversation
                        .last()
                        .map(|t| t.user_text.clone())
                        .unwrap_or_default()
                } else {
                    user_message.trim().to_string()
                };
                let sealed_before = self.reply_turn;
                if let ResponseOutcome::Started { turn } =
                    self.response.start(&mut self.conversation, &user_text)
                {
                    if let Some(prev) = sealed_before.filter(|&p| p != turn) {
                        if let Some(event) = self.sealed_event(prev) {
                            effects.push(Effect::Ui(event));
                        }
                    }
                    self.reply_turn = Some(turn);
                    effects.push(Effect::Ui(UiEvent::ReplyStarted { turn }));
                }
            }
            ServerMessage::LlmStreamingChunk { chunk, .. } => {
                if let (ResponseOutcome::Updated(content), Some(turn)) = (
                    self.response.chunk(&mut self.conversation, &chunk),
                    self.reply_turn,
                ) {
                    effects.push(Effect::Ui(UiEvent::ReplyUpdated { turn, content }));
                }
            }
            ServerMessage::LlmStreamingComplete {
                complete_response, ..
            } => {
                if let ResponseOutcome::Completed(content) = self
                    .response
                    .complete(&mut self.conversation, &complete_response)
                {
                    if let Some(turn) = self.reply_turn.take() {
                        effects.push(Effect::Ui(UiEvent::ReplySealed {
                            turn,
                            state: ReplyState::Complete,
                            content,
                        }));
                    }
                }
            }
            ServerMessage::LlmStreamingError { message } => {
                if let ResponseOutcome::Failed(content) =
                    self.response.error(&mut self.conversation, &message)
                {
                    if let Some(turn) = self.reply_turn.take() {
                        effects.push(Effect::Ui(UiEvent::ReplySealed {
                            turn,
                            state: ReplyState::Failed,
                            content,
                        }));
                    }
                }
                let err = ClientError::UpstreamGeneration(message);
                self.report(StatusLevel::Error, err.to_string(), effects);
            }

            // Speech audio
            ServerMessage::TtsStreamingStart { .. } => {
                effects.push(Effect::Playback(PlaybackCommand::Reset));
                effects.push(Effect::Ui(UiEvent::SpeechStarted));
            }
            ServerMessage::TtsAudioChunk {
                audio_base64,
                is_final,
                ..
            } => {
                effects.push(Effect::Playback(PlaybackCommand::Chunk {
                    audio_base64,
                    is_final,
                }));
            }
            ServerMessage::TtsStatus { data } => log::debug!("TTS status: {}", data),
            ServerMessage::TtsStreamingError { message } => {
                effects.push(Effect::Playback(PlaybackCommand::Finish));
                let err = ClientError::UpstreamGeneration(message);
                self.report(StatusLevel::Error, err.to_string(), effects);
            }

            ServerMessage::ResponseSaved { .. } => {
                if self.conversation.mark_last_saved() {
                    effects.push(Effect::Ui(UiEvent::ReplySaved));
                }
            }
            ServerMessage::PersonaUpdated { persona, .. } => {
                let persona = Persona::from_tag(&persona);
                self.session.confirm_persona(persona.clone());
                self.report(
                    StatusLevel::Info,
                    format!("Persona is now {}", persona.display_name()),
                    effects,
                );
                effects.push(Effect::Ui(UiEvent::PersonaConfirmed(persona)));
            }

            // Side channels
            ServerMessage::WeatherRequestStart { message, .. }
            | ServerMessage::WeatherLocationDetected { message, .. } => {
                self.side_channel(SideChannelUpdate::WeatherPending { message }, effects);
            }
            ServerMessage::WeatherResponse {
                success,
                location,
                temperature,
                description,
                weather_report,
                message,
            } => {
                let update = if success {
                    SideChannelUpdate::WeatherReport {
                        location,
                        temperature,
                        description,
                        report: weather_report,
                    }
                } else {
                    SideChannelUpdate::WeatherFailed { message }
                };
                self.side_channel(update, effects);
            }
            ServerMessage::WeatherError { message } => {
                self.side_channel(SideChannelUpdate::WeatherFailed { message }, effects);
            }
            ServerMessage::WeatherLocationNeeded { message } => {
                self.weather.activate();
                self.side_channel(SideChannelUpdate::WeatherLocationNeeded { message }, effects);
            }
            ServerMessage::QuoteRequestStart { message } => {
                self.side_channel(SideChannelUpdate::QuotePending { message }, effects);
            }
            ServerMessage::QuoteResponse {
                success,
                quote,
                author,
                message,
            } => {
                let update = if success {
                    SideChannelUpdate::Quote { quote, author }
                } else {
                    SideChannelUpdate::QuoteFailed { message }
                };
                self.side_channel(update, effects);
            }

            ServerMessage::AudioStreamComplete { message } => {
                if !message.is_empty() {
                    self.report(StatusLevel::Info, message, effects);
                }
                if matches!(self.state, SessionState::Finalizing { .. }) {
                    effects.push(Effect::CloseTransport);
                }
            }
            ServerMessage::Unknown => log::debug!("Ignoring unknown message type"),
        }
    }

    fn on_ready(
        &mut self,
        session_id: Option<String>,
        transcription_enabled: bool,
        message: String,
        effects: &mut Vec<Effect>,
    ) {
        let SessionState::Connecting { connection_id } = self.state else {
            log::debug!("audio_stream_ready in state {}", self.state.as_str());
            return;
        };

        if let Some(id) = session_id.and_then(SessionId::new) {
            if &id != self.session.id() {
                self.session.reassign_id(id.clone());
                effects.push(Effect::Ui(UiEvent::SessionAssigned(id)));
            }
        }

        // The handshake carried the requested persona
        let requested = self.session.requested_persona().clone();
        if &requested != self.session.persona() {
            self.session.confirm_persona(requested.clone());
            effects.push(Effect::Ui(UiEvent::PersonaConfirmed(requested)));
        }

        // Socket is evidently up even if the open notification was missed
        self.transport_open = true;
        self.set_state(SessionState::Ready { connection_id }, effects);
        if !message.is_empty() {
            self.report(StatusLevel::Info, message, effects);
        }
        if !transcription_enabled {
            self.report(
                StatusLevel::Warning,
                "Server transcription is disabled; audio will be recorded only",
                effects,
            );
        }

        self.send(Outbound::Command(Command::StartStreaming), effects);
        effects.push(Effect::StartCapture { connection_id });
    }

    fn on_transcript_outcome(&mut self, outcome: TranscriptOutcome, effects: &mut Vec<Effect>) {
        match outcome {
            TranscriptOutcome::Committed(text) => {
                let turn = self.conversation.commit_user(text.clone());
                self.user_turn = Some(turn);
                effects.push(Effect::Ui(UiEvent::UserTurn {
                    turn,
                    text: text.clone(),
                }));

                match self.weather.offer(&text) {
                    WeatherIntent::NotListening => {}
                    WeatherIntent::Request(location) => {
                        self.report(
                            StatusLevel::Info,
                            format!("Weather location detected: {}", location),
                            effects,
                        );
                        self.request_weather(&location, effects);
                    }
                    WeatherIntent::NeedLocation => {
                        self.report(
                            StatusLevel::Warning,
                            "No location heard; please say a city name",
                            effects,
                        );
                    }
                }
            }
            TranscriptOutcome::NoSpeech => {
                effects.push(Effect::Ui(UiEvent::NoSpeech));
                self.report(StatusLevel::Info, "No speech detected", effects);
            }
            TranscriptOutcome::Revised(text) => {
                if let Some(turn) = self.user_turn {
                    if self.conversation.revise_user(turn, text.clone()) {
                        effects.push(Effect::Ui(UiEvent::UserTurnRevised { turn, text }));
                    }
                }
            }
            TranscriptOutcome::AlreadyCommitted => {
                log::debug!("Turn boundary for an already committed utterance");
            }
            TranscriptOutcome::Partial(text) => {
                effects.push(Effect::Ui(UiEvent::PartialTranscript(text)));
            }
        }
    }

    fn side_channel(&mut self, update: SideChannelUpdate, effects: &mut Vec<Effect>) {
        if let Some(text) = update.speech_text() {
            effects.push(Effect::SpeakLocally { text });
        }
        effects.push(Effect::Ui(UiEvent::SideChannel(update)));
    }

    fn sealed_event(&self, turn: usize) -> Option<UiEvent> {
        let reply = self.conversation.turns().get(turn)?.reply.as_ref()?;
        if !reply.state.is_sealed() {
            return None;
        }
        Some(UiEvent::ReplySealed {
            turn,
            state: reply.state,
            content: reply.content.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> SessionController {
        SessionController::new(Session::new(
            SessionId::new("sid-1").unwrap(),
            Persona::Developer,
        ))
    }

    /// Drive a controller to `Ready` and return the connection id
    fn ready(c: &mut SessionController) -> Uuid {
        let effects = c.handle(Event::StartRequested);
        let connection_id = effects
            .iter()
            .find_map(|e| match e {
                Effect::Connect { connection_id } => Some(*connection_id),
                _ => None,
            })
            .unwrap();
        c.handle(Event::TransportOpened { connection_id });
        c.handle(inbound(
            connection_id,
            r#"{"type":"audio_stream_ready","session_id":"sid-1","transcription_enabled":true}"#,
        ));
        connection_id
    }

    fn inbound(connection_id: Uuid, json: &str) -> Event {
        Event::Inbound {
            connection_id,
            message: ServerMessage::parse(json).unwrap(),
        }
    }

    fn sends(effects: &[Effect]) -> Vec<&Outbound> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Send(o) => Some(o),
                _ => None,
            })
            .collect()
    }

    fn ui(effects: &[Effect]) -> Vec<&UiEvent> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Ui(u) => Some(u),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn idle_start_transitions_to_connecting() {
        let mut c = controller();
        let effects = c.handle(Event::StartRequested);

        assert!(matches!(c.state(), SessionState::Connecting { .. }));
        assert!(effects.iter().any(|e| matches!(e, Effect::Connect { .. })));
        assert!(!effects.iter().any(|e| matches!(e, Effect::StartCapture { .. })));
    }

    #[test]
    fn ready_message_starts_capture_and_first_frame_records() {
        let mut c = controller();
        let effects = c.handle(Event::StartRequested);
        let Some(Effect::Connect { connection_id }) = effects
            .iter()
            .find(|e| matches!(e, Effect::Connect { .. }))
            .cloned()
        else {
            panic!("Expected Connect effect");
        };
        c.handle(Event::TransportOpened { connection_id });

        let effects = c.handle(inbound(
            connection_id,
            r#"{"type":"audio_stream_ready","session_id":"sid-1","transcription_enabled":true}"#,
        ));
        assert!(matches!(c.state(), SessionState::Ready { .. }));
        assert!(effects.contains(&Effect::StartCapture { connection_id }));
        assert_eq!(
            sends(&effects),
            vec![&Outbound::Command(Command::StartStreaming)]
        );

        let effects = c.handle(Event::FrameCaptured {
            connection_id,
            frame: vec![1, 2, 3],
        });
        assert!(matches!(c.state(), SessionState::Recording { .. }));
        assert_eq!(sends(&effects), vec![&Outbound::Audio(vec![1, 2, 3])]);
    }

    #[test]
    fn ready_may_reassign_session_id() {
        let mut c = controller();
        let effects = c.handle(Event::StartRequested);
        let connection_id = effects
            .iter()
            .find_map(|e| match e {
                Effect::Connect { connection_id } => Some(*connection_id),
                _ => None,
            })
            .unwrap();

        let effects = c.handle(inbound(
            connection_id,
            r#"{"type":"audio_stream_ready","session_id":"server-sid","transcription_enabled":true}"#,
        ));
        assert_eq!(c.session().id().as_str(), "server-sid");
        assert!(ui(&effects)
            .iter()
            .any(|u| matches!(u, UiEvent::SessionAssigned(id) if id.as_str() == "server-sid")));
    }

    #[test]
    fn stale_connection_events_are_ignored() {
        let mut c = controller();
        let id = ready(&mut c);

        let effects = c.handle(Event::TransportClosed {
            connection_id: Uuid::new_v4(),
            reason: None,
        });
        assert!(effects.is_empty());
        assert_eq!(c.state(), &SessionState::Ready { connection_id: id });
    }

    #[test]
    fn stop_sends_command_after_frames_and_finalizes() {
        let mut c = controller();
        let id = ready(&mut c);
        c.handle(Event::FrameCaptured {
            connection_id: id,
            frame: vec![0; 4],
        });

        let effects = c.handle(Event::StopRequested);
        assert_eq!(effects[0], Effect::StopCapture);
        assert_eq!(
            sends(&effects),
            vec![&Outbound::Command(Command::StopStreaming)]
        );
        assert!(matches!(c.state(), SessionState::Finalizing { .. }));

        // Late frames are not forwarded once stopped
        let effects = c.handle(Event::FrameCaptured {
            connection_id: id,
            frame: vec![0; 4],
        });
        assert!(sends(&effects).is_empty());

        let effects = c.handle(inbound(id, r#"{"type":"audio_stream_complete"}"#));
        assert!(effects.contains(&Effect::CloseTransport));

        c.handle(Event::TransportClosed {
            connection_id: id,
            reason: None,
        });
        assert_eq!(c.state(), &SessionState::Idle);
    }

    #[test]
    fn unexpected_close_disconnects_and_marks_reply_incomplete() {
        let mut c = controller();
        let id = ready(&mut c);
        c.handle(inbound(id, r#"{"type":"final_transcript","text":"hello"}"#));
        c.handle(inbound(
            id,
            r#"{"type":"llm_streaming_start","user_message":"hello"}"#,
        ));
        c.handle(inbound(id, r#"{"type":"llm_streaming_chunk","chunk":"Hi"}"#));

        let effects = c.handle(Event::TransportClosed {
            connection_id: id,
            reason: Some("going away".to_string()),
        });

        assert!(matches!(c.state(), SessionState::Disconnected { .. }));
        assert!(effects.contains(&Effect::StopCapture));
        assert!(ui(&effects).iter().any(|u| matches!(
            u,
            UiEvent::ReplySealed {
                state: ReplyState::Incomplete,
                ..
            }
        )));
        let reply = c.conversation().turns()[0].reply.as_ref().unwrap();
        assert_eq!(reply.state, ReplyState::Incomplete);
        assert_eq!(reply.content, "Hi");
    }

    #[test]
    fn api_keys_required_hard_stops() {
        let mut c = controller();
        let effects = c.handle(Event::StartRequested);
        let connection_id = effects
            .iter()
            .find_map(|e| match e {
                Effect::Connect { connection_id } => Some(*connection_id),
                _ => None,
            })
            .unwrap();

        let effects = c.handle(inbound(
            connection_id,
            r#"{"type":"api_keys_required","message":"Please provide your API keys","missing_keys":["MURF_API_KEY"]}"#,
        ));

        assert!(matches!(c.state(), SessionState::Disconnected { .. }));
        assert!(!effects.iter().any(|e| matches!(e, Effect::StartCapture { .. })));
        assert!(effects.contains(&Effect::CloseTransport));
        assert!(ui(&effects).iter().any(|u| matches!(
            u,
            UiEvent::ConfigurationRequired { missing_keys, .. } if missing_keys == &vec!["MURF_API_KEY".to_string()]
        )));
        assert!(matches!(
            c.missing_capability(),
            Some(ClientError::MissingCapability { .. })
        ));

        // The server's close that follows is stale and changes nothing
        let effects = c.handle(Event::TransportClosed {
            connection_id,
            reason: Some("API keys required".to_string()),
        });
        assert!(effects.is_empty());
    }

    #[test]
    fn final_then_turn_end_commits_one_turn() {
        let mut c = controller();
        let id = ready(&mut c);
        c.handle(inbound(id, r#"{"type":"partial_transcript","text":"what"}"#));
        c.handle(inbound(
            id,
            r#"{"type":"partial_transcript","text":"what time"}"#,
        ));
        c.handle(inbound(
            id,
            r#"{"type":"final_transcript","text":"What time is it?"}"#,
        ));
        c.handle(inbound(
            id,
            r#"{"type":"turn_end","final_transcript":"What time is it?"}"#,
        ));

        assert_eq!(c.conversation().len(), 1);
        assert_eq!(c.conversation().turns()[0].user_text, "What time is it?");
    }

    #[test]
    fn formatted_turn_revises_and_reply_pairs_with_it() {
        let mut c = controller();
        let id = ready(&mut c);
        c.handle(inbound(id, r#"{"type":"partial_transcript","text":"what time"}"#));
        c.handle(inbound(
            id,
            r#"{"type":"final_transcript","text":"what time is it","turn_order":0,"turn_is_formatted":false}"#,
        ));
        c.handle(inbound(
            id,
            r#"{"type":"turn_end","final_transcript":"what time is it","turn_order":0,"turn_is_formatted":false}"#,
        ));
        let effects = c.handle(inbound(
            id,
            r#"{"type":"final_transcript","text":"What time is it?","turn_order":0,"turn_is_formatted":true}"#,
        ));
        assert_eq!(
            ui(&effects),
            vec![&UiEvent::UserTurnRevised {
                turn: 0,
                text: "What time is it?".to_string(),
            }]
        );
        c.handle(inbound(
            id,
            r#"{"type":"turn_end","final_transcript":"What time is it?","turn_order":0,"turn_is_formatted":true}"#,
        ));

        let effects = c.handle(inbound(
            id,
            r#"{"type":"llm_streaming_start","user_message":"what time is it"}"#,
        ));
        assert!(ui(&effects).contains(&&UiEvent::ReplyStarted { turn: 0 }));
        c.handle(inbound(id, r#"{"type":"llm_streaming_chunk","chunk":"Noon."}"#));
        c.handle(inbound(
            id,
            r#"{"type":"llm_streaming_complete","complete_response":"Noon."}"#,
        ));

        let turns = c.conversation().turns();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].user_text, "What time is it?");
        assert_eq!(turns[0].reply.as_ref().unwrap().content, "Noon.");
    }

    #[test]
    fn llm_error_without_reply_only_reports() {
        let mut c = controller();
        let id = ready(&mut c);
        let effects = c.handle(inbound(
            id,
            r#"{"type":"llm_streaming_error","message":"boom"}"#,
        ));
        assert!(!ui(&effects)
            .iter()
            .any(|u| matches!(u, UiEvent::ReplySealed { .. })));
        assert!(c.conversation().is_empty());
    }

    #[test]
    fn empty_turn_end_reports_no_speech() {
        let mut c = controller();
        let id = ready(&mut c);
        for _ in 0..2 {
            let effects = c.handle(inbound(id, r#"{"type":"turn_end","final_transcript":""}"#));
            assert!(ui(&effects).contains(&&UiEvent::NoSpeech));
        }
        assert!(c.conversation().is_empty());
    }

    #[test]
    fn llm_stream_builds_and_seals_reply() {
        let mut c = controller();
        let id = ready(&mut c);
        c.handle(inbound(id, r#"{"type":"final_transcript","text":"hi"}"#));
        let effects = c.handle(inbound(
            id,
            r#"{"type":"llm_streaming_start","user_message":"hi"}"#,
        ));
        assert!(ui(&effects).contains(&&UiEvent::ReplyStarted { turn: 0 }));

        for chunk in ["Hel", "lo ", "there"] {
            c.handle(inbound(
                id,
                &format!(r#"{{"type":"llm_streaming_chunk","chunk":"{}"}}"#, chunk),
            ));
        }
        let effects = c.handle(inbound(
            id,
            r#"{"type":"llm_streaming_complete","complete_response":"Hello there"}"#,
        ));
        assert!(ui(&effects).contains(&&UiEvent::ReplySealed {
            turn: 0,
            state: ReplyState::Complete,
            content: "Hello there".to_string(),
        }));

        let effects = c.handle(inbound(id, r#"{"type":"response_saved"}"#));
        assert!(ui(&effects).contains(&&UiEvent::ReplySaved));
        assert!(c.conversation().turns()[0].reply.as_ref().unwrap().saved);
        assert_eq!(c.conversation().len(), 1);
    }

    #[test]
    fn llm_error_seals_reply_failed() {
        let mut c = controller();
        let id = ready(&mut c);
        c.handle(inbound(id, r#"{"type":"final_transcript","text":"hi"}"#));
        c.handle(inbound(id, r#"{"type":"llm_streaming_start","user_message":"hi"}"#));
        c.handle(inbound(id, r#"{"type":"llm_streaming_chunk","chunk":"par"}"#));
        c.handle(inbound(
            id,
            r#"{"type":"llm_streaming_error","message":"Error generating LLM response: boom"}"#,
        ));

        let turn = &c.conversation().turns()[0];
        assert!(!turn.is_pending());
        let reply = turn.reply.as_ref().unwrap();
        assert_eq!(reply.state, ReplyState::Failed);
        assert_eq!(reply.content, "Error generating LLM response: boom");
        assert!(matches!(c.state(), SessionState::Ready { .. }));
    }

    #[test]
    fn weather_listening_extracts_location_and_requests() {
        let mut c = controller();
        let id = ready(&mut c);
        c.handle(Event::ListenForWeather);
        assert!(c.is_listening_for_weather());

        let effects = c.handle(inbound(
            id,
            r#"{"type":"final_transcript","text":"weather in Paris"}"#,
        ));
        assert!(sends(&effects).contains(&&Outbound::Control(ClientMessage::get_weather("Paris"))));
        assert!(!c.is_listening_for_weather());
    }

    #[test]
    fn side_channel_without_connection_is_reported() {
        let mut c = controller();
        let effects = c.handle(Event::QuoteRequested);
        assert!(sends(&effects).is_empty());
        assert_eq!(
            c.status_log().last().unwrap().level,
            StatusLevel::Warning
        );
    }

    #[test]
    fn quote_response_speaks_locally() {
        let mut c = controller();
        let id = ready(&mut c);
        let effects = c.handle(Event::QuoteRequested);
        assert_eq!(
            sends(&effects),
            vec![&Outbound::Control(ClientMessage::GetQuote)]
        );

        let effects = c.handle(inbound(
            id,
            r#"{"type":"quote_response","success":true,"quote":"Keep going.","author":"Anon"}"#,
        ));
        assert!(effects.contains(&Effect::SpeakLocally {
            text: "Keep going. by Anon".to_string()
        }));
    }

    #[test]
    fn persona_is_confirmed_only_by_backend() {
        let mut c = controller();
        let id = ready(&mut c);

        let effects = c.handle(Event::PersonaSelected(Persona::Luffy));
        assert_eq!(
            sends(&effects),
            vec![&Outbound::Control(ClientMessage::persona_update("luffy"))]
        );
        assert_eq!(c.session().persona(), &Persona::Developer);

        c.handle(inbound(
            id,
            r#"{"type":"persona_updated","persona":"luffy","message":"Persona updated to luffy"}"#,
        ));
        assert_eq!(c.session().persona(), &Persona::Luffy);
    }

    #[test]
    fn tts_messages_drive_playback() {
        let mut c = controller();
        let id = ready(&mut c);
        let effects = c.handle(inbound(id, r#"{"type":"tts_streaming_start"}"#));
        assert!(effects.contains(&Effect::Playback(PlaybackCommand::Reset)));

        let effects = c.handle(inbound(
            id,
            r#"{"type":"tts_audio_chunk","audio_base64":"AAA=","is_final":true}"#,
        ));
        assert_eq!(
            effects,
            vec![Effect::Playback(PlaybackCommand::Chunk {
                audio_base64: "AAA=".to_string(),
                is_final: true
            })]
        );

        let effects = c.handle(Event::PlaybackDrained);
        assert_eq!(effects, vec![Effect::Ui(UiEvent::SpeechFinished)]);
    }

    #[test]
    fn unknown_tags_are_ignored() {
        let mut c = controller();
        let id = ready(&mut c);
        let effects = c.handle(inbound(id, r#"{"type":"brand_new_feature","x":1}"#));
        assert!(effects.is_empty());
        assert!(matches!(c.state(), SessionState::Ready { .. }));
    }

    #[test]
    fn capture_failure_ends_session() {
        let mut c = controller();
        let id = ready(&mut c);
        let effects = c.handle(Event::CaptureFailed {
            connection_id: id,
            error: CaptureError::NoInputDevice,
        });
        assert!(matches!(c.state(), SessionState::Disconnected { .. }));
        assert!(effects.contains(&Effect::CloseTransport));
    }

    #[test]
    fn history_seeds_saved_turns() {
        let mut c = controller();
        let msg = |role: &str, content: &str| HistoryMessage {
            role: role.to_string(),
            content: content.to_string(),
            timestamp: None,
        };
        let effects = c.handle(Event::HistoryLoaded(vec![
            msg("user", "earlier"),
            msg("assistant", "answer"),
        ]));
        assert!(ui(&effects).contains(&&UiEvent::HistoryRestored { turns: 1 }));
        let reply = c.conversation().turns()[0].reply.as_ref().unwrap();
        assert!(reply.saved);
    }
}
