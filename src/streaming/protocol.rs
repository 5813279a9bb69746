//! Voice agent wire protocol
//!
//! One WebSocket carries everything for a session:
//!
//! 1. Connect to `/ws/audio-stream?session_id=<sid>`
//! 2. Send `session_id` (mandatory handshake: id + persona)
//! 3. Receive `audio_stream_ready`
//! 4. Stream raw PCM16 LE frames as binary messages
//! 5. Receive transcript, LLM, TTS and side-channel events as tagged JSON
//! 6. Send the plain-text `stop_streaming` command
//!
//! Inbound decoding happens once at the boundary: downstream code only ever
//! sees `ServerMessage` variants. Unknown tags decode to `Unknown`.

use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::Message;

// ============================================================================
// Client Messages (sent TO the backend)
// ============================================================================

/// JSON control messages sent to the backend
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Session establishment, always the first message after connect
    #[serde(rename = "session_id")]
    SessionId { session_id: String, persona: String },

    /// Persona changed locally; generation only changes once acknowledged
    #[serde(rename = "persona_update")]
    PersonaUpdate { persona: String },

    /// Side-channel weather lookup
    #[serde(rename = "get_weather")]
    GetWeather { location: String },

    /// Side-channel motivational quote
    #[serde(rename = "get_quote")]
    GetQuote,
}

impl ClientMessage {
    pub fn session(session_id: &str, persona: &str) -> Self {
        Self::SessionId {
            session_id: session_id.to_string(),
            persona: persona.to_string(),
        }
    }

    pub fn persona_update(persona: &str) -> Self {
        Self::PersonaUpdate {
            persona: persona.to_string(),
        }
    }

    pub fn get_weather(location: &str) -> Self {
        Self::GetWeather {
            location: location.to_string(),
        }
    }
}

/// Plain-string commands (not JSON)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    StartStreaming,
    StopStreaming,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::StartStreaming => "start_streaming",
            Command::StopStreaming => "stop_streaming",
        }
    }
}

/// Everything that goes out over the single ordered channel
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Control(ClientMessage),
    Command(Command),
    /// One capture frame of PCM16 samples
    Audio(Vec<i16>),
}

impl Outbound {
    /// Encode for the WebSocket
    pub fn into_message(self) -> Result<Message, serde_json::Error> {
        Ok(match self {
            Outbound::Control(msg) => Message::Text(serde_json::to_string(&msg)?),
            Outbound::Command(cmd) => Message::Text(cmd.as_str().to_string()),
            Outbound::Audio(samples) => Message::Binary(pcm16_to_le_bytes(&samples)),
        })
    }

    pub fn is_audio(&self) -> bool {
        matches!(self, Outbound::Audio(_))
    }
}

/// Raw little-endian PCM16, no framing or length prefix
pub fn pcm16_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|&s| s.to_le_bytes()).collect()
}

// ============================================================================
// Server Messages (received FROM the backend)
// ============================================================================

/// Messages received from the backend
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Backend lacks required keys; the session must not proceed
    #[serde(rename = "api_keys_required")]
    ApiKeysRequired {
        #[serde(default)]
        message: String,
        #[serde(default)]
        missing_keys: Vec<String>,
    },

    /// Handshake acknowledged; backend may reassign the session id
    #[serde(rename = "audio_stream_ready")]
    AudioStreamReady {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        transcription_enabled: bool,
        #[serde(default)]
        message: String,
    },

    /// Periodic acknowledgment of received audio
    #[serde(rename = "chunk_ack", alias = "audio_chunk_received")]
    ChunkAck {
        #[serde(default)]
        chunk_number: Option<u64>,
        #[serde(default)]
        total_bytes: Option<u64>,
    },

    #[serde(rename = "command_response")]
    CommandResponse {
        #[serde(default)]
        message: String,
        #[serde(default)]
        status: Option<String>,
    },

    #[serde(rename = "transcription_ready")]
    TranscriptionReady {
        #[serde(default)]
        message: String,
    },

    #[serde(rename = "transcription_session_started")]
    TranscriptionSessionStarted {
        #[serde(default)]
        message: String,
    },

    #[serde(rename = "transcription_session_terminated")]
    TranscriptionSessionTerminated {
        #[serde(default)]
        message: String,
    },

    /// Full-text snapshot of the utterance so far (overwrites, never appends)
    #[serde(rename = "partial_transcript")]
    PartialTranscript {
        #[serde(default)]
        text: String,
    },

    #[serde(rename = "final_transcript")]
    FinalTranscript {
        #[serde(default)]
        text: String,
        /// Same value on the unformatted and formatted events of one turn
        #[serde(default)]
        turn_order: Option<u64>,
        #[serde(default)]
        turn_is_formatted: bool,
    },

    /// User stopped talking; empty text means no speech detected
    #[serde(rename = "turn_end")]
    TurnEnd {
        #[serde(default)]
        final_transcript: String,
        #[serde(default)]
        turn_order: Option<u64>,
        #[serde(default)]
        turn_is_formatted: bool,
    },

    #[serde(rename = "transcription_complete")]
    TranscriptionComplete {
        #[serde(default)]
        text: String,
    },

    #[serde(rename = "streaming_complete")]
    StreamingComplete {
        #[serde(default)]
        message: String,
        #[serde(default)]
        transcription: String,
    },

    #[serde(rename = "transcription_error")]
    TranscriptionError {
        #[serde(default)]
        message: String,
    },

    #[serde(rename = "transcription_stopped")]
    TranscriptionStopped {
        #[serde(default)]
        message: String,
    },

    #[serde(rename = "llm_streaming_start")]
    LlmStreamingStart {
        #[serde(default)]
        message: String,
        #[serde(default)]
        user_message: String,
    },

    /// Delta of assistant text (appends, never overwrites)
    #[serde(rename = "llm_streaming_chunk")]
    LlmStreamingChunk {
        #[serde(default)]
        chunk: String,
        #[serde(default)]
        accumulated_length: Option<usize>,
    },

    #[serde(rename = "llm_streaming_complete")]
    LlmStreamingComplete {
        #[serde(default)]
        message: String,
        #[serde(default)]
        complete_response: String,
    },

    #[serde(rename = "llm_streaming_error")]
    LlmStreamingError {
        #[serde(default)]
        message: String,
    },

    #[serde(rename = "tts_streaming_start")]
    TtsStreamingStart {
        #[serde(default)]
        message: String,
    },

    /// Base64 PCM16 LE; only the first chunk after `tts_streaming_start`
    /// carries a WAV header
    #[serde(rename = "tts_audio_chunk")]
    TtsAudioChunk {
        audio_base64: String,
        #[serde(default)]
        chunk_size: Option<usize>,
        #[serde(default)]
        is_final: bool,
    },

    #[serde(rename = "tts_status")]
    TtsStatus {
        #[serde(default)]
        data: serde_json::Value,
    },

    #[serde(rename = "tts_streaming_error")]
    TtsStreamingError {
        #[serde(default)]
        message: String,
    },

    /// Assistant reply persisted by the backend
    #[serde(rename = "response_saved")]
    ResponseSaved {
        #[serde(default)]
        message: String,
    },

    #[serde(rename = "persona_updated")]
    PersonaUpdated {
        #[serde(default)]
        message: String,
        persona: String,
    },

    #[serde(rename = "weather_request_start")]
    WeatherRequestStart {
        #[serde(default)]
        message: String,
        #[serde(default)]
        location: Option<String>,
    },

    #[serde(rename = "weather_location_detected")]
    WeatherLocationDetected {
        #[serde(default)]
        message: String,
        #[serde(default)]
        location: Option<String>,
    },

    #[serde(rename = "weather_response")]
    WeatherResponse {
        #[serde(default)]
        success: bool,
        #[serde(default)]
        location: String,
        #[serde(default)]
        temperature: Option<f64>,
        #[serde(default)]
        description: String,
        #[serde(default)]
        weather_report: String,
        #[serde(default)]
        message: String,
    },

    #[serde(rename = "weather_error")]
    WeatherError {
        #[serde(default)]
        message: String,
    },

    #[serde(rename = "weather_location_needed")]
    WeatherLocationNeeded {
        #[serde(default)]
        message: String,
    },

    #[serde(rename = "quote_request_start")]
    QuoteRequestStart {
        #[serde(default)]
        message: String,
    },

    #[serde(rename = "quote_response")]
    QuoteResponse {
        #[serde(default)]
        success: bool,
        #[serde(default)]
        quote: String,
        #[serde(default)]
        author: String,
        #[serde(default)]
        message: String,
    },

    #[serde(rename = "audio_stream_complete")]
    AudioStreamComplete {
        #[serde(default)]
        message: String,
    },

    /// Catch-all for message types we don't handle
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    /// Decode one inbound text frame
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Short tag for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::ApiKeysRequired { .. } => "api_keys_required",
            ServerMessage::AudioStreamReady { .. } => "audio_stream_ready",
            ServerMessage::ChunkAck { .. } => "chunk_ack",
            ServerMessage::CommandResponse { .. } => "command_response",
            ServerMessage::TranscriptionReady { .. } => "transcription_ready",
            ServerMessage::TranscriptionSessionStarted { .. } => "transcription_session_started",
            ServerMessage::TranscriptionSessionTerminated { .. } => {
                "transcription_session_terminated"
            }
            ServerMessage::PartialTranscript { .. } => "partial_transcript",
            ServerMessage::FinalTranscript { .. } => "final_transcript",
            ServerMessage::TurnEnd { .. } => "turn_end",
            ServerMessage::TranscriptionComplete { .. } => "transcription_complete",
            ServerMessage::StreamingComplete { .. } => "streaming_complete",
            ServerMessage::TranscriptionError { .. } => "transcription_error",
            ServerMessage::TranscriptionStopped { .. } => "transcription_stopped",
            ServerMessage::LlmStreamingStart { .. } => "llm_streaming_start",
            ServerMessage::LlmStreamingChunk { .. } => "llm_streaming_chunk",
            ServerMessage::LlmStreamingComplete { .. } => "llm_streaming_complete",
            ServerMessage::LlmStreamingError { .. } => "llm_streaming_error",
            ServerMessage::TtsStreamingStart { .. } => "tts_streaming_start",
            ServerMessage::TtsAudioChunk { .. } => "tts_audio_chunk",
            ServerMessage::TtsStatus { .. } => "tts_status",
            ServerMessage::TtsStreamingError { .. } => "tts_streaming_error",
            ServerMessage::ResponseSaved { .. } => "response_saved",
            ServerMessage::PersonaUpdated { .. } => "persona_updated",
            ServerMessage::WeatherRequestStart { .. } => "weather_request_start",
            ServerMessage::WeatherLocationDetected { .. } => "weather_location_detected",
            ServerMessage::WeatherResponse { .. } => "weather_response",
            ServerMessage::WeatherError { .. } => "weather_error",
            ServerMessage::WeatherLocationNeeded { .. } => "weather_location_needed",
            ServerMessage::QuoteRequestStart { .. } => "quote_request_start",
            ServerMessage::QuoteResponse { .. } => "quote_response",
            ServerMessage::AudioStreamComplete { .. } => "audio_stream_complete",
            ServerMessage::Unknown => "unknown",
        }
    }
}
