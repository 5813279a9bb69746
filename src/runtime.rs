//! Session runtime
//!
//! A single-threaded loop that owns the connection, the capture device, the
//! playback scheduler and the output clock. Every input (user command,
//! transport event, captured frame, playback tick) becomes an `Event` for the
//! `SessionController`; the effects it returns are executed here.
//!
//! The loop must run on a current-thread runtime: CPAL streams are not `Send`.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::audio::{CaptureConfig, CaptureRecorder, FrameReceiver, MicCapture};
use crate::error::{CaptureError, TransportError};
use crate::history;
use crate::playback::{open_output, AudioSink, PlaybackScheduler, SchedulePass, SchedulerConfig};
use crate::session::Persona;
use crate::state_machine::{Effect, Event, PlaybackCommand, SessionController, UiEvent};
use crate::streaming::transport::{Connection, TransportEvent};

/// How often held buffers and playback completion are checked
const PLAYBACK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Actions from whatever front end drives the session
#[derive(Debug, Clone, PartialEq)]
pub enum UserCommand {
    Start,
    Stop,
    /// Start when idle, stop otherwise
    Toggle,
    Persona(Persona),
    ListenForWeather,
    Weather(String),
    Quote,
    ClearHistory,
    Quit,
}

/// UI seam. Receives every presentation update in order.
pub trait Presenter {
    fn present(&mut self, event: &UiEvent);

    /// Local speech synthesis for side-channel results the backend does not
    /// voice. The default only logs the text.
    fn speak(&mut self, text: &str) {
        log::info!("Speak: {}", text);
    }
}

/// A running capture that can be released
pub trait CaptureHandle {
    fn stop(self: Box<Self>);
}

impl CaptureHandle for MicCapture {
    fn stop(self: Box<Self>) {
        MicCapture::stop(*self);
    }
}

/// Opens audio devices for the session
pub trait AudioDevices {
    fn open_capture(
        &mut self,
        config: &CaptureConfig,
    ) -> Result<(Box<dyn CaptureHandle>, FrameReceiver), CaptureError>;

    fn open_output(&mut self, sample_rate: u32) -> Box<dyn AudioSink>;
}

/// Default input and output devices through CPAL
#[derive(Debug, Default)]
pub struct SystemDevices;

impl AudioDevices for SystemDevices {
    fn open_capture(
        &mut self,
        config: &CaptureConfig,
    ) -> Result<(Box<dyn CaptureHandle>, FrameReceiver), CaptureError> {
        let (capture, frames) = MicCapture::start(config)?;
        Ok((Box::new(capture), frames))
    }

    fn open_output(&mut self, sample_rate: u32) -> Box<dyn AudioSink> {
        open_output(sample_rate)
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub server_url: String,
    /// REST base for history; `None` skips history entirely
    pub http_base_url: Option<String>,
    pub load_history: bool,
    pub capture: CaptureConfig,
    pub scheduler: SchedulerConfig,
    pub record_path: Option<PathBuf>,
}

type PendingConnect = (Uuid, JoinHandle<Result<Connection, TransportError>>);

pub struct Runtime<P: Presenter, D: AudioDevices> {
    options: RuntimeOptions,
    controller: SessionController,
    presenter: P,
    devices: D,

    connection: Option<(Uuid, Connection)>,
    pending_connect: Option<PendingConnect>,
    events: Option<(Uuid, mpsc::Receiver<TransportEvent>)>,

    capture: Option<Box<dyn CaptureHandle>>,
    frames: Option<(Uuid, FrameReceiver)>,
    recorder: Option<CaptureRecorder>,

    scheduler: PlaybackScheduler,
    output: Option<Box<dyn AudioSink>>,
}

impl<P: Presenter, D: AudioDevices> Runtime<P, D> {
    pub fn new(
        options: RuntimeOptions,
        controller: SessionController,
        presenter: P,
        devices: D,
    ) -> Self {
        let scheduler = PlaybackScheduler::new(options.scheduler.clone());
        Self {
            options,
            controller,
            presenter,
            devices,
            connection: None,
            pending_connect: None,
            events: None,
            capture: None,
            frames: None,
            recorder: None,
            scheduler,
            output: None,
        }
    }

    /// Run until `Quit` or the command channel closes. Returns the
    /// controller so the caller can inspect the final conversation.
    pub async fn run(mut self, mut commands: mpsc::Receiver<UserCommand>) -> SessionController {
        log::info!(
            "Runtime: session {} ({})",
            self.controller.session().id(),
            self.controller.session().persona().display_name()
        );
        self.present_initial_state();

        if self.options.load_history {
            self.load_history().await;
        }

        let mut tick = tokio::time::interval(PLAYBACK_POLL_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    None | Some(UserCommand::Quit) => break,
                    Some(command) => self.on_command(command).await,
                },
                (connection_id, result) = wait_connect(&mut self.pending_connect) => {
                    self.pending_connect = None;
                    self.on_connected(connection_id, result).await;
                }
                (connection_id, event) = recv_tagged(&mut self.events) => match event {
                    Some(event) => self.on_transport_event(connection_id, event).await,
                    None => self.events = None,
                },
                (connection_id, frame) = recv_tagged(&mut self.frames) => match frame {
                    Some(frame) => self.on_frame(connection_id, frame).await,
                    None => self.frames = None,
                },
                _ = tick.tick() => self.poll_playback().await,
            }
        }

        log::info!("Runtime: shutting down");
        self.shutdown().await;
        self.controller
    }

    fn present_initial_state(&mut self) {
        let state = self.controller.state().clone();
        self.presenter.present(&UiEvent::StateChanged(state));
        let persona = self.controller.session().persona().clone();
        self.presenter.present(&UiEvent::PersonaConfirmed(persona));
    }

    async fn load_history(&mut self) {
        let Some(base) = self.options.http_base_url.clone() else {
            return;
        };
        let session_id = self.controller.session().id().clone();
        let event = match history::fetch_history(&base, &session_id).await {
            Ok(messages) => Event::HistoryLoaded(messages),
            Err(e) => Event::HistoryFailed(e.to_string()),
        };
        self.dispatch(event).await;
    }

    async fn on_command(&mut self, command: UserCommand) {
        log::debug!("Runtime: command {:?}", command);
        let event = match command {
            UserCommand::Start => Event::StartRequested,
            UserCommand::Stop => Event::StopRequested,
            UserCommand::Toggle => {
                if self.controller.state().can_start() {
                    Event::StartRequested
                } else {
                    Event::StopRequested
                }
            }
            UserCommand::Persona(persona) => Event::PersonaSelected(persona),
            UserCommand::ListenForWeather => Event::ListenForWeather,
            UserCommand::Weather(location) => Event::WeatherRequested(location),
            UserCommand::Quote => Event::QuoteRequested,
            UserCommand::ClearHistory => self.clear_history().await,
            UserCommand::Quit => return,
        };
        self.dispatch(event).await;
    }

    async fn clear_history(&mut self) -> Event {
        let Some(base) = self.options.http_base_url.clone() else {
            return Event::HistoryFailed("no HTTP endpoint configured".to_string());
        };
        let session_id = self.controller.session().id().clone();
        match history::clear_history(&base, &session_id).await {
            Ok(()) => Event::HistoryCleared,
            Err(e) => Event::HistoryFailed(e.to_string()),
        }
    }

    async fn on_connected(
        &mut self,
        connection_id: Uuid,
        result: Result<Connection, TransportError>,
    ) {
        if self.controller.state().connection_id() != Some(connection_id) {
            log::debug!("Runtime: discarding stale connection {}", connection_id);
            if let Ok(connection) = result {
                connection.close().await;
            }
            return;
        }

        match result {
            Ok(mut connection) => {
                if let Some(events) = connection.take_events() {
                    self.events = Some((connection_id, events));
                }
                self.connection = Some((connection_id, connection));
                self.dispatch(Event::TransportOpened { connection_id }).await;
            }
            Err(error) => {
                self.dispatch(Event::TransportFailed {
                    connection_id,
                    error,
                })
                .await;
            }
        }
    }

    async fn on_transport_event(&mut self, connection_id: Uuid, event: TransportEvent) {
        let event = match event {
            TransportEvent::Message(message) => Event::Inbound {
                connection_id,
                message,
            },
            TransportEvent::Malformed(error) => Event::Malformed {
                connection_id,
                error,
            },
            TransportEvent::Closed(reason) => Event::TransportClosed {
                connection_id,
                reason,
            },
            TransportEvent::Error(error) => Event::TransportFailed {
                connection_id,
                error: TransportError::Socket(error),
            },
        };
        self.dispatch(event).await;
    }

    async fn on_frame(&mut self, connection_id: Uuid, frame: Vec<i16>) {
        if let Some(recorder) = self.recorder.as_mut() {
            if let Err(e) = recorder.write_frame(&frame) {
                log::warn!("Runtime: capture recording stopped: {}", e);
                self.recorder = None;
            }
        }
        self.dispatch(Event::FrameCaptured {
            connection_id,
            frame,
        })
        .await;
    }

    async fn poll_playback(&mut self) {
        let Some(output) = self.output.as_ref() else {
            return;
        };
        if self.scheduler.queued() == 0 && !self.scheduler.awaiting_end() {
            return;
        }
        let pass = self.scheduler.poll(output.now());
        if let Some(event) = self.apply_pass(pass) {
            self.dispatch(event).await;
        }
    }

    /// Apply an event and execute its effects, including any follow-up
    /// events the effects produce.
    async fn dispatch(&mut self, event: Event) {
        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            for effect in self.controller.handle(event) {
                if let Some(follow_up) = self.execute(effect).await {
                    queue.push_back(follow_up);
                }
            }
        }
    }

    async fn execute(&mut self, effect: Effect) -> Option<Event> {
        match effect {
            Effect::Connect { connection_id } => {
                // At most one live connection per session
                self.close_transport().await;
                let session = self.controller.session().clone();
                let server_url = self.options.server_url.clone();
                let handle =
                    tokio::spawn(async move { Connection::connect(&server_url, &session).await });
                self.pending_connect = Some((connection_id, handle));
                None
            }
            Effect::Send(outbound) => {
                let Some((connection_id, connection)) = self.connection.as_mut() else {
                    log::warn!("Runtime: no live connection, dropping outbound message");
                    return None;
                };
                match connection.send(outbound) {
                    Ok(()) => None,
                    Err(error) => Some(Event::TransportFailed {
                        connection_id: *connection_id,
                        error,
                    }),
                }
            }
            Effect::StartCapture { connection_id } => {
                self.stop_capture();
                match self.devices.open_capture(&self.options.capture) {
                    Ok((capture, frames)) => {
                        self.capture = Some(capture);
                        self.frames = Some((connection_id, frames));
                        self.open_recorder();
                        Some(Event::CaptureStarted { connection_id })
                    }
                    Err(error) => Some(Event::CaptureFailed {
                        connection_id,
                        error,
                    }),
                }
            }
            Effect::StopCapture => {
                self.stop_capture();
                None
            }
            Effect::CloseTransport => self.close_transport().await.map(|connection_id| {
                Event::TransportClosed {
                    connection_id,
                    reason: None,
                }
            }),
            Effect::Playback(command) => self.playback(command),
            Effect::SpeakLocally { text } => {
                self.presenter.speak(&text);
                None
            }
            Effect::Ui(event) => {
                self.presenter.present(&event);
                None
            }
        }
    }

    fn playback(&mut self, command: PlaybackCommand) -> Option<Event> {
        let sample_rate = self.options.scheduler.sample_rate;
        let devices = &mut self.devices;
        let output = self
            .output
            .get_or_insert_with(|| devices.open_output(sample_rate));
        let now = output.now();

        match command {
            PlaybackCommand::Reset => {
                self.scheduler.reset(now);
                None
            }
            PlaybackCommand::Chunk {
                audio_base64,
                is_final,
            } => match self.scheduler.push_chunk(&audio_base64, is_final, now) {
                Ok(pass) => self.apply_pass(pass),
                Err(e) => {
                    if is_final {
                        self.scheduler.finish();
                    }
                    Some(Event::PlaybackFailed(e.to_string()))
                }
            },
            PlaybackCommand::Finish => {
                self.scheduler.finish();
                let pass = self.scheduler.poll(now);
                self.apply_pass(pass)
            }
        }
    }

    fn apply_pass(&mut self, pass: SchedulePass) -> Option<Event> {
        if let Some(output) = self.output.as_mut() {
            for buffer in pass.scheduled {
                output.schedule(buffer);
            }
        }
        pass.finished.then_some(Event::PlaybackDrained)
    }

    fn open_recorder(&mut self) {
        let Some(path) = self.options.record_path.as_ref() else {
            return;
        };
        match CaptureRecorder::create(path, self.options.capture.sample_rate) {
            Ok(recorder) => self.recorder = Some(recorder),
            Err(e) => log::warn!("Runtime: {}", e),
        }
    }

    fn stop_capture(&mut self) {
        if let Some(capture) = self.capture.take() {
            capture.stop();
        }
        self.frames = None;
        if let Some(recorder) = self.recorder.take() {
            if let Err(e) = recorder.finalize() {
                log::warn!("Runtime: {}", e);
            }
        }
    }

    /// Close the live connection, if any, and abandon a pending connect.
    /// Returns the id of the connection that was closed.
    async fn close_transport(&mut self) -> Option<Uuid> {
        if let Some((connection_id, handle)) = self.pending_connect.take() {
            log::debug!("Runtime: abandoning connect {}", connection_id);
            handle.abort();
        }
        self.events = None;
        let (connection_id, connection) = self.connection.take()?;
        connection.close().await;
        Some(connection_id)
    }

    async fn shutdown(&mut self) {
        self.stop_capture();
        self.close_transport().await;
    }
}

async fn wait_connect(
    pending: &mut Option<PendingConnect>,
) -> (Uuid, Result<Connection, TransportError>) {
    match pending {
        Some((connection_id, handle)) => {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(TransportError::ConnectionFailed(e.to_string())),
            };
            (*connection_id, result)
        }
        None => std::future::pending().await,
    }
}

async fn recv_tagged<T>(slot: &mut Option<(Uuid, mpsc::Receiver<T>)>) -> (Uuid, Option<T>) {
    match slot {
        Some((connection_id, rx)) => (*connection_id, rx.recv().await),
        None => std::future::pending().await,
    }
}
