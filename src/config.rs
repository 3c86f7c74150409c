//! Configuration types for the live voice engine.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Sample rate of microphone audio sent to the service, in Hz.
///
/// Part of the wire contract (`audio/pcm;rate=16000`), not configurable.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of synthesized audio received from the service, in Hz.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// MIME tag attached to every outbound audio chunk.
pub const INPUT_MIME_TYPE: &str = "audio/pcm;rate=16000";

/// Top-level configuration for a live voice session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    /// Audio capture/playback settings.
    pub audio: AudioConfig,
    /// Remote voice service settings.
    pub service: ServiceConfig,
}

/// Audio I/O configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Input device name (None = system default).
    pub input_device: Option<String>,
    /// Output device name (None = system default).
    pub output_device: Option<String>,
    /// Samples per outbound frame (4096 at 16kHz is 256ms).
    pub frame_size: usize,
    /// Depth of the queue between the microphone thread and the framer.
    ///
    /// When full, raw microphone buffers are dropped rather than blocking
    /// the audio thread.
    pub capture_queue_depth: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_device: None,
            output_device: None,
            frame_size: 4096,
            capture_queue_depth: 64,
        }
    }
}

/// Remote voice service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// WebSocket endpoint of the bidirectional streaming API.
    pub endpoint: String,
    /// Model identifier sent in the session setup.
    pub model: String,
    /// Prebuilt synthesized voice name.
    pub voice: String,
    /// Environment variables consulted, in order, for the API key.
    pub api_key_env: Vec<String>,
    /// Timeout for the WebSocket handshake and session setup, in seconds.
    pub connect_timeout_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_owned(),
            model: "models/gemini-2.5-flash-native-audio-preview-09-2025".to_owned(),
            voice: "Zephyr".to_owned(),
            api_key_env: vec!["GEMINI_API_KEY".to_owned(), "API_KEY".to_owned()],
            connect_timeout_secs: 15,
        }
    }
}

impl ServiceConfig {
    /// Resolve the API key from the first non-empty configured variable.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Config`](crate::error::VoiceError::Config) if
    /// none of the variables is set.
    pub fn api_key(&self) -> crate::error::Result<String> {
        self.api_key_env
            .iter()
            .filter_map(|name| std::env::var(name).ok())
            .find(|value| !value.trim().is_empty())
            .ok_or_else(|| {
                crate::error::VoiceError::Config(format!(
                    "no API key found (set one of: {})",
                    self.api_key_env.join(", ")
                ))
            })
    }
}

impl LiveConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| crate::error::VoiceError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::VoiceError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values that would stall the capture pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Config`](crate::error::VoiceError::Config) naming the bad field.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.audio.frame_size == 0 {
            return Err(crate::error::VoiceError::Config(
                "audio.frame_size must be greater than zero".into(),
            ));
        }
        if self.audio.capture_queue_depth == 0 {
            return Err(crate::error::VoiceError::Config(
                "audio.capture_queue_depth must be greater than zero".into(),
            ));
        }
        if self.service.model.trim().is_empty() {
            return Err(crate::error::VoiceError::Config(
                "service.model must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// Returns the default config file path: `~/.config/rohana-live/config.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config).join("rohana-live").join("config.toml")
        } else if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home)
                .join(".config")
                .join("rohana-live")
                .join("config.toml")
        } else {
            PathBuf::from("/tmp/rohana-live-config/config.toml")
        }
    }
}
