//! Rohana Live: real-time voice conversation with a hosted speech model.
//!
//! Microphone audio is framed, encoded as PCM16 and streamed to the remote
//! service; synthesized audio streams back and is scheduled for gapless
//! playback:
//!
//! Microphone → Capture Pipeline → Voice Service → Playback Scheduler → Speaker
//!
//! # Architecture
//!
//! - **Codec** ([`codec`]): f32 ⇄ PCM16LE with base64 transport
//! - **Audio** ([`audio`]): the input and output clocks via `cpal`, and the
//!   playback scheduler
//! - **Capture** ([`pipeline`]): fixed-size framing and fire-and-forget send
//! - **Voice service** ([`live`]): the streaming session seam and its
//!   Gemini Live WebSocket client
//! - **Session** ([`session`]): lifecycle state machine and the actor that
//!   owns every session resource

pub mod audio;
pub mod codec;
pub mod config;
pub mod error;
pub mod live;
pub mod pipeline;
pub mod session;

pub use config::LiveConfig;
pub use error::{Result, VoiceError};
pub use live::{GeminiLiveService, VoiceService};
pub use session::{SessionController, Status, StatusSnapshot};
