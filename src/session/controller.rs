//! The session actor.
//!
//! One tokio task owns every session resource. Commands from the handle,
//! server events, decode results and playback notifications all arrive on
//! channels and are applied one at a time through the state machine, so no
//! session state is shared or locked.
//!
//! Each session gets a generation number. Every asynchronous completion is
//! tagged with the generation that started it; a completion whose generation
//! no longer matches the live session is stale and only has its resources
//! released.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::state::{Action, SessionEvent, SessionStateMachine, Status};
use crate::audio::{
    AudioBackend, AudioFrame, AudioOutput, CaptureDevice, ChunkTicket, PlaybackEvent,
    PlaybackScheduler,
};
use crate::codec::decode_inbound;
use crate::config::{INPUT_SAMPLE_RATE, LiveConfig, OUTPUT_SAMPLE_RATE};
use crate::error::{Result, VoiceError};
use crate::live::{LiveConnection, LiveSender, LiveSetup, ServerEvent, VoiceService};
use crate::pipeline::CapturePipeline;

/// What the UI reads: status, error text, and the live session's id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub status: Status,
    pub error: Option<String>,
    pub session_id: Option<Uuid>,
}

impl StatusSnapshot {
    /// Display text, including the error message when failed.
    pub fn label(&self) -> String {
        match (self.status, &self.error) {
            (Status::Error, Some(message)) => format!("Error: {message}"),
            (status, _) => status.label().to_owned(),
        }
    }
}

enum Command {
    Open,
    Close,
    Shutdown(oneshot::Sender<()>),
}

/// Handle to a running session actor.
///
/// Dropping the handle closes any open session.
pub struct SessionController {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<StatusSnapshot>,
}

impl SessionController {
    /// Spawn the actor. Must be called from within a tokio runtime.
    pub fn spawn(
        config: LiveConfig,
        audio: Arc<dyn AudioBackend>,
        voice: Arc<dyn VoiceService>,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(StatusSnapshot::default());
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let actor = SessionActor {
            config,
            audio,
            voice,
            machine: SessionStateMachine::new(),
            status_tx,
            internal_tx,
            next_generation: 0,
            session: None,
            closing: Vec::new(),
        };
        tokio::spawn(actor.run(command_rx, internal_rx));

        Self { commands, status }
    }

    /// Start a session. Ignored unless the status is `Idle`.
    pub fn open(&self) {
        self.send(Command::Open);
    }

    /// Close the session and release every resource. Always accepted.
    pub fn close(&self) {
        self.send(Command::Close);
    }

    pub fn status(&self) -> Status {
        self.status.borrow().status
    }

    pub fn error_message(&self) -> Option<String> {
        self.status.borrow().error.clone()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.status.borrow().clone()
    }

    /// Watch status changes.
    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.clone()
    }

    /// Close the session, wait for the connection to shut down, and stop
    /// the actor.
    pub async fn shutdown(self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("session actor already stopped");
        }
    }
}

/// Completions reported back to the actor, tagged with their generation.
enum Internal {
    MicrophoneReady(Result<Box<dyn CaptureDevice>>),
    OutputReady(Result<(Box<dyn AudioOutput>, mpsc::UnboundedReceiver<PlaybackEvent>)>),
    Connected(Result<LiveConnection>),
    Server(ServerEvent),
    Decoded(ChunkTicket, Result<AudioFrame>),
    Playback(PlaybackEvent),
}

type Tagged = (u64, Internal);

/// Resources of one session. Every field is optional until acquired.
struct Session {
    generation: u64,
    id: Uuid,
    microphone: Option<Box<dyn CaptureDevice>>,
    capture: CapturePipeline,
    scheduler: Option<PlaybackScheduler>,
    connection: Option<LiveConnection>,
    sender: Option<LiveSender>,
    forwarders: Vec<JoinHandle<()>>,
}

struct SessionActor {
    config: LiveConfig,
    audio: Arc<dyn AudioBackend>,
    voice: Arc<dyn VoiceService>,
    machine: SessionStateMachine,
    status_tx: watch::Sender<StatusSnapshot>,
    internal_tx: mpsc::UnboundedSender<Tagged>,
    next_generation: u64,
    session: Option<Session>,
    /// Connection close tasks still running.
    closing: Vec<JoinHandle<()>>,
}

impl SessionActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Tagged>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Open) => self.dispatch(SessionEvent::OpenRequested),
                    Some(Command::Close) => self.dispatch(SessionEvent::CloseRequested),
                    Some(Command::Shutdown(ack)) => {
                        self.stop().await;
                        let _ = ack.send(());
                        return;
                    }
                    None => {
                        self.stop().await;
                        return;
                    }
                },
                Some((generation, completion)) = internal.recv() => {
                    self.complete(generation, completion);
                }
            }
        }
    }

    async fn stop(&mut self) {
        self.dispatch(SessionEvent::CloseRequested);
        for task in self.closing.drain(..) {
            let _ = task.await;
        }
        debug!("session actor stopped");
    }

    /// Run an event and every follow-up event its actions produce.
    fn dispatch(&mut self, event: SessionEvent) {
        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            debug!(event = event.name(), status = %self.machine.status(), "session event");
            for action in self.machine.handle(event) {
                if let Some(follow_up) = self.perform(action) {
                    queue.push_back(follow_up);
                }
            }
        }
        self.publish();
    }

    fn publish(&self) {
        let snapshot = StatusSnapshot {
            status: self.machine.status(),
            error: self.machine.error().map(str::to_owned),
            session_id: self.session.as_ref().map(|s| s.id),
        };
        self.status_tx.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
    }

    fn perform(&mut self, action: Action) -> Option<SessionEvent> {
        let result = match action {
            Action::Connect => {
                self.begin_session();
                Ok(())
            }
            Action::StartCapture => self.start_capture(),
            Action::SchedulePlayback(payload) => self.schedule_playback(payload),
            Action::InterruptPlayback => {
                if let Some(scheduler) = self.session.as_mut().and_then(|s| s.scheduler.as_mut()) {
                    scheduler.interrupt();
                }
                Ok(())
            }
            Action::RecordError(message) => {
                error!("voice session failed: {message}");
                Ok(())
            }
            Action::Teardown => {
                self.teardown();
                Ok(())
            }
        };
        result.err().map(|e| SessionEvent::Failed(e.to_string()))
    }

    fn begin_session(&mut self) {
        self.next_generation += 1;
        let generation = self.next_generation;
        let session = Session {
            generation,
            id: Uuid::new_v4(),
            microphone: None,
            capture: CapturePipeline::new(
                self.config.audio.frame_size,
                self.config.audio.capture_queue_depth,
            ),
            scheduler: None,
            connection: None,
            sender: None,
            forwarders: Vec::new(),
        };
        info!(session = %session.id, generation, "opening voice session");
        self.session = Some(session);

        let audio = Arc::clone(&self.audio);
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = audio.acquire_microphone(INPUT_SAMPLE_RATE).await;
            let _ = tx.send((generation, Internal::MicrophoneReady(result)));
        });
    }

    /// The live session, if `generation` still names it.
    fn current(&mut self, generation: u64) -> Option<&mut Session> {
        self.session
            .as_mut()
            .filter(|session| session.generation == generation)
    }

    fn complete(&mut self, generation: u64, completion: Internal) {
        if self.current(generation).is_none() {
            release_stale(generation, completion, &mut self.closing);
            return;
        }
        let event = match completion {
            Internal::MicrophoneReady(Ok(device)) => {
                self.on_microphone(generation, device);
                None
            }
            Internal::MicrophoneReady(Err(e)) => Some(SessionEvent::Failed(e.to_string())),
            Internal::OutputReady(Ok((output, events))) => {
                self.on_output(generation, output, events);
                None
            }
            Internal::OutputReady(Err(e)) => Some(SessionEvent::Failed(e.to_string())),
            Internal::Connected(Ok(connection)) => {
                self.on_connected(generation, connection);
                None
            }
            Internal::Connected(Err(e)) => Some(SessionEvent::Failed(e.to_string())),
            Internal::Server(event) => {
                self.on_server_event(event);
                None
            }
            Internal::Decoded(ticket, Ok(frame)) => self.on_decoded(generation, ticket, frame),
            Internal::Decoded(_, Err(e)) => Some(SessionEvent::Failed(e.to_string())),
            Internal::Playback(PlaybackEvent::Finished(id)) => {
                let drained = self
                    .current(generation)
                    .and_then(|s| s.scheduler.as_mut())
                    .is_some_and(|scheduler| scheduler.on_finished(id));
                drained.then_some(SessionEvent::PlaybackDrained)
            }
        };
        if let Some(event) = event {
            self.dispatch(event);
        }
    }

    /// Microphone granted: open the output clock off the actor task.
    fn on_microphone(&mut self, generation: u64, device: Box<dyn CaptureDevice>) {
        info!(sample_rate = device.sample_rate(), "microphone acquired");
        let audio = Arc::clone(&self.audio);
        let tx = self.internal_tx.clone();
        let Some(session) = self.current(generation) else {
            return;
        };
        session.microphone = Some(device);

        tokio::spawn(async move {
            let (playback_tx, playback_rx) = mpsc::unbounded_channel();
            let result = audio
                .open_output(OUTPUT_SAMPLE_RATE, playback_tx)
                .await
                .map(|output| (output, playback_rx));
            let _ = tx.send((generation, Internal::OutputReady(result)));
        });
    }

    /// Output clock open: start the scheduler, then connect.
    fn on_output(
        &mut self,
        generation: u64,
        output: Box<dyn AudioOutput>,
        events: mpsc::UnboundedReceiver<PlaybackEvent>,
    ) {
        let forwarder = forward(events, generation, self.internal_tx.clone(), Internal::Playback);
        let Some(session) = self.current(generation) else {
            return;
        };
        session.scheduler = Some(PlaybackScheduler::new(output));
        session.forwarders.push(forwarder);

        let voice = Arc::clone(&self.voice);
        let setup = LiveSetup::from_config(&self.config.service);
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = voice.connect(&setup).await;
            let _ = tx.send((generation, Internal::Connected(result)));
        });
    }

    fn on_connected(&mut self, generation: u64, mut connection: LiveConnection) {
        let events = connection.take_events();
        let tx = self.internal_tx.clone();
        let Some(session) = self.current(generation) else {
            return;
        };
        if let Some(events) = events {
            session
                .forwarders
                .push(forward(events, generation, tx, Internal::Server));
        }
        session.sender = Some(connection.sender());
        session.connection = Some(connection);
        debug!("voice service connected; waiting for setup acknowledgement");
    }

    fn on_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Opened => {
                info!("voice session open");
                self.dispatch(SessionEvent::ConnectionOpened);
            }
            ServerEvent::Message {
                audio,
                interrupted,
                turn_complete,
            } => {
                if let Some(payload) = audio {
                    self.dispatch(SessionEvent::AudioChunk(payload));
                }
                if interrupted {
                    info!("service signalled interruption");
                    self.dispatch(SessionEvent::Interrupted);
                }
                if turn_complete {
                    debug!("model turn complete");
                }
            }
            ServerEvent::Error(message) => {
                self.dispatch(SessionEvent::Failed(VoiceError::Service(message).to_string()));
            }
            ServerEvent::Closed { reason } => {
                info!(reason = reason.as_deref().unwrap_or(""), "voice service closed the session");
                self.dispatch(SessionEvent::RemoteClosed);
            }
        }
    }

    fn start_capture(&mut self) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let (Some(device), Some(sender)) = (session.microphone.as_mut(), session.sender.clone())
        else {
            return Err(VoiceError::Audio(
                "session opened without a microphone or connection".into(),
            ));
        };
        session.capture.start(&mut **device, sender)
    }

    /// Reserve a slot in arrival order and decode off the actor task.
    fn schedule_playback(&mut self, payload: String) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let Some(scheduler) = session.scheduler.as_mut() else {
            return Err(VoiceError::Audio("audio output not open".into()));
        };
        let ticket = scheduler.reserve();
        let generation = session.generation;
        let tx = self.internal_tx.clone();
        debug!(bytes = payload.len(), "decoding inbound chunk");
        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || {
                decode_inbound(&payload, OUTPUT_SAMPLE_RATE, 1)
            })
            .await
            .unwrap_or_else(|e| Err(VoiceError::Decode(format!("decode task failed: {e}"))));
            let _ = tx.send((generation, Internal::Decoded(ticket, result)));
        });
        Ok(())
    }

    fn on_decoded(
        &mut self,
        generation: u64,
        ticket: ChunkTicket,
        frame: AudioFrame,
    ) -> Option<SessionEvent> {
        let scheduler = self.current(generation)?.scheduler.as_mut()?;
        match scheduler.submit(ticket, frame) {
            // An empty last chunk schedules nothing and nothing will finish.
            Ok(_) if scheduler.is_drained() => Some(SessionEvent::PlaybackDrained),
            Ok(_) => None,
            Err(e) => Some(SessionEvent::Failed(e.to_string())),
        }
    }

    /// Release every resource of the live session, in order. Missing
    /// resources are skipped.
    fn teardown(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        for forwarder in session.forwarders.drain(..) {
            forwarder.abort();
        }
        session.sender = None;
        if let Some(connection) = session.connection.take() {
            self.closing.retain(|task| !task.is_finished());
            self.closing.push(tokio::spawn(connection.close()));
        }
        if let Some(device) = session.microphone.as_mut() {
            device.stop_tracks();
        }
        session.capture.stop();
        if let Some(mut device) = session.microphone.take() {
            device.close();
        }
        if let Some(mut scheduler) = session.scheduler.take() {
            scheduler.shutdown();
        }
        info!(session = %session.id, "voice session released");
    }
}

/// Drop what a stale completion carries, closing it where needed.
fn release_stale(generation: u64, completion: Internal, closing: &mut Vec<JoinHandle<()>>) {
    match completion {
        Internal::MicrophoneReady(Ok(mut device)) => {
            debug!(generation, "releasing microphone granted after close");
            device.stop_tracks();
            device.close();
        }
        Internal::OutputReady(Ok((mut output, _events))) => {
            debug!(generation, "closing audio output opened after close");
            output.close();
        }
        Internal::Connected(Ok(connection)) => {
            debug!(generation, "closing connection opened after close");
            closing.push(tokio::spawn(connection.close()));
        }
        Internal::Decoded(..) => debug!(generation, "dropping stale decoded chunk"),
        Internal::MicrophoneReady(Err(e))
        | Internal::OutputReady(Err(e))
        | Internal::Connected(Err(e)) => {
            warn!(generation, "stale session failure: {e}");
        }
        Internal::Server(_) | Internal::Playback(_) => {}
    }
}

/// Pump a channel into the actor, tagging each item with `generation`.
fn forward<T: Send + 'static>(
    mut rx: mpsc::UnboundedReceiver<T>,
    generation: u64,
    tx: mpsc::UnboundedSender<Tagged>,
    wrap: fn(T) -> Internal,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            if tx.send((generation, wrap(item))).is_err() {
                break;
            }
        }
    })
}
