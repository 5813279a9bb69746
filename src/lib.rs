//! Voice agent client
//!
//! Streams microphone audio to a voice agent backend over one WebSocket and
//! renders what comes back: live transcripts, the assistant's streamed reply
//! and its synthesized speech, played gaplessly.
//!
//! `SessionController` holds all session state and never does I/O;
//! `Runtime` executes its effects against real devices and the network.

pub mod audio;
pub mod console;
pub mod conversation;
pub mod error;
pub mod history;
pub mod playback;
pub mod runtime;
pub mod session;
pub mod settings;
pub mod state_machine;
pub mod status;
pub mod streaming;

pub use conversation::{AssistantReply, Conversation, ReplyState, Turn};
pub use error::{CaptureError, ClientError, PlaybackError, TransportError};
pub use runtime::{
    AudioDevices, CaptureHandle, Presenter, Runtime, RuntimeOptions, SystemDevices, UserCommand,
};
pub use session::{Persona, Session, SessionId};
pub use settings::ClientSettings;
pub use state_machine::{Effect, Event, SessionController, SessionState, UiEvent};
pub use status::{StatusEntry, StatusLevel};
