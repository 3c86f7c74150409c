//! The remote voice service: a bidirectional streaming session.
//!
//! [`VoiceService`] is the only seam between the session engine and the
//! network. A connection is a pair of channels: outbound [`MediaChunk`]s go
//! through a cloneable [`LiveSender`], and [`ServerEvent`]s arrive on a
//! receiver in the order the service delivered them.

pub mod gemini;
pub mod messages;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::ServiceConfig;
use crate::error::{Result, VoiceError};

pub use gemini::GeminiLiveService;
pub use messages::MediaChunk;

/// How long [`LiveConnection::close`] waits for the transport to finish.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(3);

/// Outbound commands a transport may buffer before audio is dropped.
/// 32 frames of 4096 samples is about eight seconds of microphone audio.
pub const OUTBOUND_QUEUE_DEPTH: usize = 32;

/// Fixed per-session configuration sent when the session opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveSetup {
    /// Model identifier.
    pub model: String,
    /// Prebuilt synthesized voice name.
    pub voice: String,
}

impl LiveSetup {
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            model: config.model.clone(),
            voice: config.voice.clone(),
        }
    }
}

/// Events delivered by the remote service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// The session is ready to receive audio.
    Opened,
    /// Content from the model.
    Message {
        /// Base64 PCM16 mono 24kHz audio, if the message carried any.
        audio: Option<String>,
        /// The user barged in; queued playback must be cut.
        interrupted: bool,
        /// The model finished its turn.
        turn_complete: bool,
    },
    /// The service reported a failure. The session is unusable.
    Error(String),
    /// The connection closed.
    Closed { reason: Option<String> },
}

/// Commands consumed by a transport's write side.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundCommand {
    Audio(MediaChunk),
    Close,
}

/// Cloneable handle for sending audio into an open connection.
#[derive(Debug, Clone)]
pub struct LiveSender {
    tx: mpsc::Sender<OutboundCommand>,
}

impl LiveSender {
    pub fn new(tx: mpsc::Sender<OutboundCommand>) -> Self {
        Self { tx }
    }

    /// Queue one audio chunk for transmission. Never waits: a full queue
    /// drops the chunk.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Channel`] if the queue is full or the
    /// connection is gone.
    pub fn send_audio(&self, chunk: MediaChunk) -> Result<()> {
        self.tx
            .try_send(OutboundCommand::Audio(chunk))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    VoiceError::Channel("outbound audio queue full".into())
                }
                mpsc::error::TrySendError::Closed(_) => {
                    VoiceError::Channel("voice connection closed".into())
                }
            })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// An open session with the voice service.
pub struct LiveConnection {
    sender: LiveSender,
    events: Option<mpsc::UnboundedReceiver<ServerEvent>>,
    task: Option<JoinHandle<()>>,
}

impl LiveConnection {
    /// Assemble a connection from its channels.
    ///
    /// `task` is the transport's background task, awaited on close.
    pub fn new(
        outbound: mpsc::Sender<OutboundCommand>,
        events: mpsc::UnboundedReceiver<ServerEvent>,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            sender: LiveSender::new(outbound),
            events: Some(events),
            task,
        }
    }

    pub fn sender(&self) -> LiveSender {
        self.sender.clone()
    }

    /// Take the inbound event stream. Returns `None` after the first call.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ServerEvent>> {
        self.events.take()
    }

    /// Ask the transport to close and wait briefly for it to finish.
    ///
    /// A transport that has not finished within the timeout is aborted.
    pub async fn close(mut self) {
        let tx = self.sender.tx.clone();
        let task = self.task.take();
        let abort = task.as_ref().map(JoinHandle::abort_handle);
        let finished = tokio::time::timeout(CLOSE_TIMEOUT, async move {
            // Queued audio ahead of the close is still delivered.
            if tx.send(OutboundCommand::Close).await.is_err() {
                debug!("voice connection already closed");
            }
            match task {
                Some(task) => task.await.map_err(|e| e.to_string()),
                None => Ok(()),
            }
        })
        .await;
        match finished {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("voice transport task failed: {e}"),
            Err(_) => {
                warn!("voice transport did not close within {CLOSE_TIMEOUT:?}");
                if let Some(abort) = abort {
                    abort.abort();
                }
            }
        }
    }
}

/// A remote service that can open live voice sessions.
#[async_trait]
pub trait VoiceService: Send + Sync {
    /// Open a session. `ServerEvent::Opened` arrives on the event stream
    /// once the service accepted the setup.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Connection`] if the transport cannot be
    /// established.
    async fn connect(&self, setup: &LiveSetup) -> Result<LiveConnection>;
}
