//! Audio device abstractions: the input clock, the output clock, and the
//! factory that opens both.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::capture::CpalCapture;
use super::frame::AudioFrame;
use super::playback::CpalPlayback;
use crate::config::AudioConfig;
use crate::error::{Result, VoiceError};

/// Identifier of a scheduled playback unit, unique within one output.
pub type UnitId = u64;

/// Notifications from an output device back to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// The unit played to its natural end.
    ///
    /// Not sent for units removed with [`AudioOutput::stop`].
    Finished(UnitId),
}

/// A playback clock that can start frames at absolute times.
pub trait AudioOutput: Send {
    /// Output sample rate in Hz.
    fn sample_rate(&self) -> u32;

    /// Current playback position of the device, in seconds since it opened.
    fn current_time(&self) -> f64;

    /// Schedule `frame` to begin at `at` seconds on this clock.
    ///
    /// # Errors
    ///
    /// Returns an error if the output has been closed or the device failed.
    fn start(&mut self, id: UnitId, frame: &AudioFrame, at: f64) -> Result<()>;

    /// Stop a unit immediately. Unknown ids are ignored.
    fn stop(&mut self, id: UnitId);

    /// Release the device. Idempotent.
    fn close(&mut self);
}

/// Microphone tracks feeding an input clock at a fixed sample rate.
pub trait CaptureDevice: Send {
    /// Rate of the samples delivered to the sink, in Hz.
    fn sample_rate(&self) -> u32;

    /// Begin delivering mono f32 buffers to `sink`.
    ///
    /// The device must never block on `sink`; a full queue drops the buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the input stream cannot be built or started.
    fn start(&mut self, sink: mpsc::Sender<Vec<f32>>) -> Result<()>;

    /// Stop the microphone tracks. Idempotent.
    fn stop_tracks(&mut self);

    /// Release the input clock. Idempotent.
    fn close(&mut self);
}

/// Opens the microphone and the speaker for a session.
#[async_trait]
pub trait AudioBackend: Send + Sync {
    /// Acquire the microphone, resampled to `sample_rate`.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Permission`](crate::error::VoiceError::Permission)
    /// when access is denied or no input device exists.
    async fn acquire_microphone(&self, sample_rate: u32) -> Result<Box<dyn CaptureDevice>>;

    /// Open an output clock at `sample_rate`, reporting unit completion on `events`.
    ///
    /// # Errors
    ///
    /// Returns an error if no output device is available.
    async fn open_output(
        &self,
        sample_rate: u32,
        events: mpsc::UnboundedSender<PlaybackEvent>,
    ) -> Result<Box<dyn AudioOutput>>;
}

/// [`AudioBackend`] backed by the system's default `cpal` host.
#[derive(Debug, Clone, Default)]
pub struct CpalBackend {
    config: AudioConfig,
}

impl CpalBackend {
    pub fn new(config: AudioConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl AudioBackend for CpalBackend {
    async fn acquire_microphone(&self, sample_rate: u32) -> Result<Box<dyn CaptureDevice>> {
        let config = self.config.clone();
        // Device enumeration can block on some hosts.
        let capture = tokio::task::spawn_blocking(move || CpalCapture::new(&config, sample_rate))
            .await
            .map_err(|e| VoiceError::Audio(format!("device probe panicked: {e}")))??;
        Ok(Box::new(capture))
    }

    async fn open_output(
        &self,
        sample_rate: u32,
        events: mpsc::UnboundedSender<PlaybackEvent>,
    ) -> Result<Box<dyn AudioOutput>> {
        let config = self.config.clone();
        // Waits for the stream thread to report that the device started.
        let playback =
            tokio::task::spawn_blocking(move || CpalPlayback::new(&config, sample_rate, events))
                .await
                .map_err(|e| VoiceError::Audio(format!("output open panicked: {e}")))??;
        Ok(Box::new(playback))
    }
}
