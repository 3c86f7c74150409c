//! Audio devices, frames, and playback scheduling.
//!
//! The session engine talks to hardware only through the traits in
//! [`backend`]; [`capture`] and [`playback`] implement them with `cpal`.

pub mod backend;
pub mod capture;
pub mod frame;
pub mod playback;
pub mod scheduler;

pub use backend::{AudioBackend, AudioOutput, CaptureDevice, CpalBackend, PlaybackEvent, UnitId};
pub use frame::AudioFrame;
pub use scheduler::{ChunkTicket, PlaybackScheduler, PlaybackUnit};
