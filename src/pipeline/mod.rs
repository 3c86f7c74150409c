//! Outbound audio path: microphone framing and transmission.

pub mod capture;

pub use capture::{CapturePipeline, Framer};
