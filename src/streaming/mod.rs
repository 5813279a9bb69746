//! Real-time streaming with the voice agent backend
//!
//! A session uses one WebSocket for everything: PCM frames and control
//! messages go out over a single ordered channel, tagged JSON events come
//! back and are decoded at the boundary.
//!
//! # Architecture
//!
//! ```text
//! MicCapture ──frames──▶ Connection (writer task) ──▶ backend
//!                                                        │
//! backend ──▶ Connection (reader task) ──TransportEvent──┘
//!                     │
//!                     ▼
//!            SessionController
//!   ├─ TranscriptRenderer  (partial / final / turn_end)
//!   ├─ ResponseRenderer    (llm_streaming_*)
//!   ├─ PlaybackScheduler   (tts_*)
//!   └─ side channels       (weather / quote)
//! ```
//!
//! Nothing here reconnects on its own. A dropped connection ends the session
//! and the next start opens a fresh one.

pub mod protocol;
pub mod response;
pub mod side_channel;
pub mod transcript;
pub mod transport;

pub use protocol::{ClientMessage, Command, Outbound, ServerMessage};
pub use response::{ResponseOutcome, ResponseRenderer};
pub use side_channel::{extract_location, SideChannelUpdate, WeatherIntent, WeatherListener};
pub use transcript::{TranscriptOutcome, TranscriptRenderer};
pub use transport::{Connection, TransportEvent};
