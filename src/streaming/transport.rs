//! Voice agent WebSocket transport
//!
//! One duplex connection per session. Control messages and PCM frames share
//! a single ordered outbound channel drained by a writer task, so a command
//! queued after the last audio frame is always sent after it.
//!
//! # Connection Flow
//!
//! 1. `connect()` - Establish WebSocket and queue the `session_id` handshake
//! 2. `send()` - Queue control messages, commands or audio (non-blocking)
//! 3. `take_events()` - Receive decoded server messages and lifecycle events
//! 4. `close()` - Flush queued messages and close
//!
//! There is no retry or reconnect here; every connection attempt comes from
//! the caller.

use std::sync::Once;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async_with_config, tungstenite::Message};

use super::protocol::{ClientMessage, Outbound, ServerMessage};
use crate::error::TransportError;
use crate::session::Session;

/// Timeout for the WebSocket handshake itself
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Time allowed for queued messages to flush on close
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Inbound event buffer
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// What the transport reports upward
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Decoded server message
    Message(ServerMessage),
    /// Text frame that was not a valid server message
    Malformed(String),
    /// Connection closed, with the close reason if one was given
    Closed(Option<String>),
    /// Socket failure; the connection is gone
    Error(String),
}

static CRYPTO_PROVIDER: Once = Once::new();

fn install_crypto_provider() {
    CRYPTO_PROVIDER.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            log::debug!("Transport: rustls crypto provider already installed");
        }
    });
}

/// Handle to a live connection
pub struct Connection {
    outbound_tx: Option<mpsc::UnboundedSender<Outbound>>,
    events_rx: Option<mpsc::Receiver<TransportEvent>>,
    writer_task: Option<JoinHandle<()>>,
    reader_task: JoinHandle<()>,
    frames_sent: u64,
}

impl Connection {
    /// Connect to `server_url` for `session` and queue the mandatory
    /// `session_id` handshake as the first outbound message.
    pub async fn connect(server_url: &str, session: &Session) -> Result<Self, TransportError> {
        install_crypto_provider();

        let url = session
            .connect_url(server_url)
            .ok_or_else(|| TransportError::InvalidUrl(server_url.to_string()))?;

        log::info!("Transport: connecting to {}", url);

        let (ws_stream, _response) = timeout(
            CONNECTION_TIMEOUT,
            connect_async_with_config(url.as_str(), None, true),
        )
        .await
        .map_err(|_| TransportError::ConnectionFailed("Connection timeout".to_string()))?
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        log::info!("Transport: connected (session {})", session.id());

        let (mut write, mut read) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let writer_events = events_tx.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(outbound) = outbound_rx.recv().await {
                let message = match outbound.into_message() {
                    Ok(message) => message,
                    Err(e) => {
                        log::warn!("Transport: failed to encode message: {}", e);
                        continue;
                    }
                };
                if let Err(e) = write.send(message).await {
                    log::warn!("Transport: send failed: {}", e);
                    let _ = writer_events
                        .send(TransportEvent::Error(
                            TransportError::SendFailed(e.to_string()).to_string(),
                        ))
                        .await;
                    return;
                }
            }
            // Sender dropped: everything queued has been written
            if let Err(e) = write.close().await {
                log::debug!("Transport: error closing WebSocket: {}", e);
            }
            log::debug!("Transport: writer task exiting");
        });

        let reader_task = tokio::spawn(async move {
            let terminal = loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let event = match ServerMessage::parse(&text) {
                            Ok(msg) => TransportEvent::Message(msg),
                            Err(e) => {
                                log::warn!("Transport: failed to parse message: {}", e);
                                TransportEvent::Malformed(e.to_string())
                            }
                        };
                        if events_tx.send(event).await.is_err() {
                            log::debug!("Transport: event receiver dropped");
                            return;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty());
                        log::info!("Transport: closed by server ({:?})", reason);
                        break TransportEvent::Closed(reason);
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        log::debug!("Transport: ignoring {} byte binary frame", bytes.len());
                    }
                    Some(Ok(_)) => {} // ping/pong
                    Some(Err(e)) => {
                        log::warn!("Transport: WebSocket error: {}", e);
                        break TransportEvent::Error(e.to_string());
                    }
                    None => break TransportEvent::Closed(None),
                }
            };
            let _ = events_tx.send(terminal).await;
            log::debug!("Transport: reader task exiting");
        });

        let mut connection = Self {
            outbound_tx: Some(outbound_tx),
            events_rx: Some(events_rx),
            writer_task: Some(writer_task),
            reader_task,
            frames_sent: 0,
        };

        connection.send(Outbound::Control(ClientMessage::session(
            session.id().as_str(),
            session.requested_persona().tag(),
        )))?;

        Ok(connection)
    }

    /// Queue a message. Messages are written in the order they are queued.
    pub fn send(&mut self, outbound: Outbound) -> Result<(), TransportError> {
        let tx = self.outbound_tx.as_ref().ok_or(TransportError::NotConnected)?;

        let is_audio = outbound.is_audio();
        tx.send(outbound)
            .map_err(|_| TransportError::Closed("writer stopped".to_string()))?;

        if is_audio {
            self.frames_sent += 1;
            if self.frames_sent % 50 == 0 {
                log::debug!("Transport: {} audio frames queued", self.frames_sent);
            }
        }
        Ok(())
    }

    /// Take ownership of the inbound event receiver.
    ///
    /// Returns `None` if already taken.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.events_rx.take()
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    /// Flush everything already queued, then close the socket.
    pub async fn close(mut self) {
        log::info!("Transport: closing ({} audio frames sent)", self.frames_sent);

        // Dropping the sender lets the writer drain and send a close frame
        self.outbound_tx = None;
        if let Some(mut writer) = self.writer_task.take() {
            if timeout(CLOSE_FLUSH_TIMEOUT, &mut writer).await.is_err() {
                log::warn!("Transport: flush on close timed out");
                writer.abort();
            }
        }
        self.reader_task.abort();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(writer) = self.writer_task.take() {
            writer.abort();
        }
        self.reader_task.abort();
    }
}
