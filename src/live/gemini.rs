//! WebSocket client for the Gemini Live API.
//!
//! [`GeminiLiveService`] opens a `BidiGenerateContent` stream, sends the
//! setup message, and spawns a background task that translates server
//! frames into [`ServerEvent`]s while a writer task drains outbound audio.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::messages::{RealtimeInputMessage, ServerMessage, SetupMessage};
use super::{
    LiveConnection, LiveSetup, OUTBOUND_QUEUE_DEPTH, OutboundCommand, ServerEvent, VoiceService,
};
use crate::config::ServiceConfig;
use crate::error::{Result, VoiceError};

/// [`VoiceService`] backed by the Gemini Live WebSocket endpoint.
#[derive(Debug, Clone)]
pub struct GeminiLiveService {
    config: ServiceConfig,
}

impl GeminiLiveService {
    pub fn new(config: ServiceConfig) -> Self {
        Self { config }
    }

    fn endpoint_url(&self) -> Result<url::Url> {
        let key = self.config.api_key()?;
        url::Url::parse_with_params(&self.config.endpoint, &[("key", key)])
            .map_err(|e| VoiceError::Config(format!("invalid service endpoint: {e}")))
    }
}

#[async_trait]
impl VoiceService for GeminiLiveService {
    async fn connect(&self, setup: &LiveSetup) -> Result<LiveConnection> {
        let url = self.endpoint_url()?;
        let timeout = Duration::from_secs(self.config.connect_timeout_secs.max(1));

        let (ws_stream, _) =
            tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url.as_str()))
                .await
                .map_err(|_| VoiceError::Connection(format!("connect timed out after {timeout:?}")))?
                .map_err(|e| VoiceError::Connection(format!("connect: {e}")))?;

        let (mut write, read) = ws_stream.split();

        let json = serde_json::to_string(&SetupMessage::audio_only(setup))
            .map_err(|e| VoiceError::Protocol(format!("serialize setup: {e}")))?;
        write
            .send(Message::Text(json))
            .await
            .map_err(|e| VoiceError::Connection(format!("send setup: {e}")))?;
        info!(model = %setup.model, voice = %setup.voice, "voice session setup sent");

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_transport(write, read, outbound_rx, events_tx, timeout));

        Ok(LiveConnection::new(outbound_tx, events_rx, Some(task)))
    }
}

/// Why the writer task stopped.
#[derive(Debug)]
enum WriterExit {
    /// The session asked to close; a close frame was sent.
    Closed,
    /// The session dropped every sender.
    Dropped,
    /// Stopped by the reader.
    Stopped,
    Failed(String),
}

/// Pump the socket until either side closes.
///
/// Writes run on their own task so a slow socket never delays inbound
/// events.
async fn run_transport<W, R>(
    write: W,
    mut read: R,
    outbound_rx: mpsc::Receiver<OutboundCommand>,
    events_tx: mpsc::UnboundedSender<ServerEvent>,
    setup_timeout: Duration,
) where
    W: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin
        + Send
        + 'static,
    R: futures_util::Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    let emit = |event: ServerEvent| {
        // If the receiver is dropped the session is gone; nothing to report to.
        let _ = events_tx.send(event);
    };

    let stop = CancellationToken::new();
    let mut writer = tokio::spawn(write_outbound(write, outbound_rx, stop.clone()));

    let setup_deadline = tokio::time::sleep(setup_timeout);
    tokio::pin!(setup_deadline);
    let mut opened = false;

    loop {
        tokio::select! {
            // Inbound from server.
            msg = read.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("ignoring non-UTF-8 binary frame: {e}");
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        stop.cancel();
                        emit(close_event(frame));
                        return;
                    }
                    None => {
                        stop.cancel();
                        emit(ServerEvent::Closed { reason: None });
                        return;
                    }
                    Some(Err(e)) => {
                        stop.cancel();
                        emit(ServerEvent::Error(format!("read error: {e}")));
                        return;
                    }
                    Some(Ok(_)) => continue, // Ping/Pong frames handled by tungstenite.
                };
                match ServerMessage::parse(&text) {
                    Ok(message) => {
                        if let Some(ref go_away) = message.go_away {
                            warn!(time_left = ?go_away.time_left, "service will disconnect soon");
                        }
                        for event in message.into_events() {
                            if event == ServerEvent::Opened {
                                opened = true;
                            }
                            emit(event);
                        }
                    }
                    Err(e) => debug!("ignoring unparseable server message: {e}"),
                }
            }
            exit = &mut writer => {
                match exit {
                    Ok(WriterExit::Failed(e)) => emit(ServerEvent::Error(format!("send error: {e}"))),
                    Ok(_) => emit(ServerEvent::Closed { reason: Some("closed by client".into()) }),
                    Err(e) => emit(ServerEvent::Error(format!("writer task failed: {e}"))),
                }
                return;
            }
            () = &mut setup_deadline, if !opened => {
                emit(ServerEvent::Error(format!(
                    "session setup not acknowledged within {setup_timeout:?}"
                )));
                stop.cancel();
                let _ = writer.await;
                return;
            }
        }
    }
}

/// Serialize queued audio onto the socket until closed or stopped.
async fn write_outbound<W>(
    mut write: W,
    mut outbound_rx: mpsc::Receiver<OutboundCommand>,
    stop: CancellationToken,
) -> WriterExit
where
    W: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let exit = loop {
        let cmd = tokio::select! {
            biased;
            () = stop.cancelled() => break WriterExit::Stopped,
            cmd = outbound_rx.recv() => cmd,
        };
        match cmd {
            Some(OutboundCommand::Audio(chunk)) => {
                let json = match serde_json::to_string(&RealtimeInputMessage::single(chunk)) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("failed to serialize audio chunk: {e}");
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(json)).await {
                    return WriterExit::Failed(e.to_string());
                }
            }
            Some(OutboundCommand::Close) => break WriterExit::Closed,
            None => break WriterExit::Dropped,
        }
    };
    if let Err(e) = write.send(Message::Close(None)).await {
        debug!("close frame not delivered: {e}");
    }
    exit
}

/// Normal closes are `Closed`; anything else carries the server's reason as an error.
fn close_event(frame: Option<CloseFrame<'static>>) -> ServerEvent {
    match frame {
        None => ServerEvent::Closed { reason: None },
        Some(frame) => {
            let reason = frame.reason.to_string();
            match frame.code {
                CloseCode::Normal | CloseCode::Away => ServerEvent::Closed {
                    reason: (!reason.is_empty()).then_some(reason),
                },
                code => ServerEvent::Error(if reason.is_empty() {
                    format!("connection closed with code {code}")
                } else {
                    reason
                }),
            }
        }
    }
}
