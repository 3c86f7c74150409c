//! Wire messages of the Gemini Live `BidiGenerateContent` protocol.
//!
//! Only the fields this client reads or writes are modelled; unknown fields
//! in server messages are ignored.

use serde::{Deserialize, Serialize};

use super::{LiveSetup, ServerEvent};
use crate::config::INPUT_MIME_TYPE;
use crate::error::{Result, VoiceError};

// ---------------------------------------------------------------------------
// Client → server
// ---------------------------------------------------------------------------

/// Outbound audio envelope: base64 PCM plus its MIME tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaChunk {
    pub mime_type: String,
    pub data: String,
}

impl MediaChunk {
    /// Wrap base64 PCM16 mono 16kHz microphone audio.
    pub fn pcm16(data: String) -> Self {
        Self {
            mime_type: INPUT_MIME_TYPE.to_owned(),
            data,
        }
    }
}

/// First message on a new connection.
#[derive(Debug, Clone, Serialize)]
pub struct SetupMessage {
    pub setup: Setup,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<Modality>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Modality {
    Audio,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

impl SetupMessage {
    /// Audio-only responses in the configured voice.
    pub fn audio_only(setup: &LiveSetup) -> Self {
        Self {
            setup: Setup {
                model: setup.model.clone(),
                generation_config: GenerationConfig {
                    response_modalities: vec![Modality::Audio],
                    speech_config: SpeechConfig {
                        voice_config: VoiceConfig {
                            prebuilt_voice_config: PrebuiltVoiceConfig {
                                voice_name: setup.voice.clone(),
                            },
                        },
                    },
                },
            },
        }
    }
}

/// Streaming microphone input.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInputMessage {
    pub realtime_input: RealtimeInput,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<MediaChunk>,
}

impl RealtimeInputMessage {
    pub fn single(chunk: MediaChunk) -> Self {
        Self {
            realtime_input: RealtimeInput {
                media_chunks: vec![chunk],
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Server → client
// ---------------------------------------------------------------------------

/// Any message the server may send. Exactly one field is normally present.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub go_away: Option<GoAway>,
    #[serde(default)]
    pub error: Option<ServerError>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<Content>,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub turn_complete: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Content {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default)]
    pub inline_data: Option<InlineData>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub data: String,
}

/// Notice that the server will disconnect soon.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerError {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: String,
}

impl ServerMessage {
    /// Parse one JSON frame.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Protocol`] if the frame is not valid JSON.
    pub fn parse(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| VoiceError::Protocol(format!("bad server message: {e}")))
    }

    /// Map to the events this client acts on. Messages with nothing of
    /// interest (tool calls, usage metadata) yield no events.
    pub fn into_events(self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        if self.setup_complete.is_some() {
            events.push(ServerEvent::Opened);
        }
        if let Some(content) = self.server_content {
            let audio = content
                .model_turn
                .and_then(|turn| {
                    turn.parts
                        .into_iter()
                        .filter_map(|p| p.inline_data)
                        .find(|d| d.mime_type.is_empty() || d.mime_type.starts_with("audio/"))
                })
                .map(|d| d.data)
                .filter(|data| !data.is_empty());
            if audio.is_some() || content.interrupted || content.turn_complete {
                events.push(ServerEvent::Message {
                    audio,
                    interrupted: content.interrupted,
                    turn_complete: content.turn_complete,
                });
            }
        }
        if let Some(error) = self.error {
            let message = if error.message.is_empty() {
                format!("service error {}", error.code.unwrap_or_default())
            } else {
                error.message
            };
            events.push(ServerEvent::Error(message));
        }
        events
    }
}
