//! Session lifecycle as a pure transition table.
//!
//! [`SessionStateMachine::handle`] maps one inbound event to the side effects
//! the controller must run. It never touches devices or the network, so every
//! transition can be tested directly.

use std::fmt;

/// Lifecycle status of the voice session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    #[default]
    Idle,
    Connecting,
    Listening,
    Speaking,
    Error,
}

impl Status {
    /// Short human label. See
    /// [`StatusSnapshot::label`](crate::session::StatusSnapshot::label) for the
    /// error text.
    pub fn label(self) -> &'static str {
        match self {
            Self::Idle => "Ready",
            Self::Connecting => "Connecting...",
            Self::Listening => "Listening...",
            Self::Speaking => "Speaking...",
            Self::Error => "Error",
        }
    }

    /// A session exists and holds resources.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Listening | Self::Speaking)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    OpenRequested,
    /// The service accepted the session setup.
    ConnectionOpened,
    /// A base64 PCM16 chunk arrived from the service.
    AudioChunk(String),
    /// The last active playback unit finished.
    PlaybackDrained,
    /// The service signalled barge-in.
    Interrupted,
    /// A fatal failure: permission, connection, service or decode.
    Failed(String),
    /// The service closed the connection.
    RemoteClosed,
    CloseRequested,
}

impl SessionEvent {
    /// Variant name, for logs. Omits the audio payload.
    pub fn name(&self) -> &'static str {
        match self {
            Self::OpenRequested => "open_requested",
            Self::ConnectionOpened => "connection_opened",
            Self::AudioChunk(_) => "audio_chunk",
            Self::PlaybackDrained => "playback_drained",
            Self::Interrupted => "interrupted",
            Self::Failed(_) => "failed",
            Self::RemoteClosed => "remote_closed",
            Self::CloseRequested => "close_requested",
        }
    }
}

/// Side effects the controller runs, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Connect,
    StartCapture,
    SchedulePlayback(String),
    InterruptPlayback,
    RecordError(String),
    Teardown,
}

const REMOTE_CLOSED_MESSAGE: &str = "voice session closed by the service";

/// Current status plus the message of the last failure.
#[derive(Debug, Clone, Default)]
pub struct SessionStateMachine {
    status: Status,
    error: Option<String>,
}

impl SessionStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// Message of the failure that put the session in [`Status::Error`].
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Apply one event and return the actions to run.
    ///
    /// Events that do not apply to the current status return no actions and
    /// leave the status unchanged.
    pub fn handle(&mut self, event: SessionEvent) -> Vec<Action> {
        use Status::*;

        match (self.status, event) {
            (Idle, SessionEvent::OpenRequested) => {
                self.status = Connecting;
                vec![Action::Connect]
            }
            (_, SessionEvent::OpenRequested) => Vec::new(),

            (Connecting, SessionEvent::ConnectionOpened) => {
                self.status = Listening;
                vec![Action::StartCapture]
            }

            (Listening | Speaking, SessionEvent::AudioChunk(payload)) => {
                self.status = Speaking;
                vec![Action::SchedulePlayback(payload)]
            }

            (Speaking, SessionEvent::PlaybackDrained) => {
                self.status = Listening;
                Vec::new()
            }

            (Listening | Speaking, SessionEvent::Interrupted) => {
                self.status = Listening;
                vec![Action::InterruptPlayback]
            }
            // Nothing can be playing, but a reset is always safe.
            (Idle | Connecting | Error, SessionEvent::Interrupted) => {
                vec![Action::InterruptPlayback]
            }

            (status, SessionEvent::Failed(message)) if status.is_active() => {
                self.fail(message)
            }
            (status, SessionEvent::RemoteClosed) if status.is_active() => {
                self.fail(REMOTE_CLOSED_MESSAGE.to_owned())
            }

            (Idle, SessionEvent::CloseRequested) => Vec::new(),
            (_, SessionEvent::CloseRequested) => {
                self.status = Idle;
                self.error = None;
                vec![Action::Teardown]
            }

            _ => Vec::new(),
        }
    }

    fn fail(&mut self, message: String) -> Vec<Action> {
        self.status = Status::Error;
        self.error = Some(message.clone());
        vec![Action::RecordError(message), Action::Teardown]
    }
}
