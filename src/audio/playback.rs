//! Audio playback to system speakers via cpal.
//!
//! A single long-lived output stream mixes every scheduled unit. The stream
//! callback advances a frame counter, which doubles as the output clock.

use crate::config::AudioConfig;
use crate::error::{Result, VoiceError};
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::backend::{AudioOutput, PlaybackEvent, UnitId};
use super::frame::AudioFrame;

/// Audio playback to system speakers via cpal.
pub struct CpalPlayback {
    sample_rate: u32,
    mixer: Arc<Mutex<Mixer>>,
    stream: Option<StreamThread>,
}

struct StreamThread {
    stop_tx: std_mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

impl CpalPlayback {
    /// Open the configured (or default) output device at `sample_rate`.
    ///
    /// # Errors
    ///
    /// Returns an error if no output device is available or the stream
    /// cannot be started.
    pub fn new(
        config: &AudioConfig,
        sample_rate: u32,
        events: mpsc::UnboundedSender<PlaybackEvent>,
    ) -> Result<Self> {
        let host = cpal::default_host();

        let device = if let Some(ref name) = config.output_device {
            host.output_devices()
                .map_err(|e| VoiceError::Audio(format!("cannot enumerate devices: {e}")))?
                .find(|d| {
                    d.description()
                        .ok()
                        .map(|desc| desc.name() == name)
                        .unwrap_or(false)
                })
                .ok_or_else(|| VoiceError::Audio(format!("output device '{name}' not found")))?
        } else {
            host.default_output_device()
                .ok_or_else(|| VoiceError::Audio("no default output device".into()))?
        };

        let device_name = device
            .description()
            .map(|d| d.name().to_owned())
            .unwrap_or_else(|_| "<unknown>".into());
        info!("using output device: {device_name}");

        let stream_config = StreamConfig {
            channels: 1,
            sample_rate,
            buffer_size: cpal::BufferSize::Default,
        };

        let mixer = Arc::new(Mutex::new(Mixer::new(events)));
        let stream = spawn_stream(device, stream_config, Arc::clone(&mixer))?;

        Ok(Self {
            sample_rate,
            mixer,
            stream: Some(stream),
        })
    }

    /// List available output devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_output_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .output_devices()
            .map_err(|e| VoiceError::Audio(format!("cannot enumerate devices: {e}")))?;

        let mut names = Vec::new();
        for device in devices {
            if let Ok(desc) = device.description() {
                names.push(desc.name().to_owned());
            }
        }
        Ok(names)
    }

    fn mixer(&self) -> MutexGuard<'_, Mixer> {
        match self.mixer.lock() {
            Ok(m) => m,
            Err(p) => p.into_inner(),
        }
    }
}

impl AudioOutput for CpalPlayback {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn current_time(&self) -> f64 {
        self.mixer().frames_played as f64 / f64::from(self.sample_rate)
    }

    fn start(&mut self, id: UnitId, frame: &AudioFrame, at: f64) -> Result<()> {
        if self.stream.is_none() {
            return Err(VoiceError::Audio("output already closed".into()));
        }
        if frame.sample_rate() != self.sample_rate {
            warn!(
                frame_rate = frame.sample_rate(),
                output_rate = self.sample_rate,
                "frame rate differs from output rate; playing at output rate"
            );
        }
        let start_frame = (at.max(0.0) * f64::from(self.sample_rate)).round() as u64;
        self.mixer().voices.push(Voice {
            id,
            start_frame,
            samples: frame.shared_samples(),
            channels: frame.channels() as usize,
            position: 0,
        });
        Ok(())
    }

    fn stop(&mut self, id: UnitId) {
        self.mixer().voices.retain(|v| v.id != id);
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.stop_tx.send(());
            if stream.thread.join().is_err() {
                warn!("playback thread panicked during shutdown");
            }
            self.mixer().voices.clear();
            info!("audio output closed");
        }
    }
}

impl Drop for CpalPlayback {
    fn drop(&mut self) {
        self.close();
    }
}

/// Start the output stream on its own thread and wait until it is playing.
fn spawn_stream(
    device: cpal::Device,
    stream_config: StreamConfig,
    mixer: Arc<Mutex<Mixer>>,
) -> Result<StreamThread> {
    let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<()>>(1);
    let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

    let thread = std::thread::Builder::new()
        .name("rohana-speaker".into())
        .spawn(move || {
            let built = device.build_output_stream(
                &stream_config,
                move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                    let mut mixer = match mixer.lock() {
                        Ok(m) => m,
                        Err(p) => p.into_inner(),
                    };
                    mixer.render(data);
                },
                move |err| {
                    error!("audio output stream error: {err}");
                },
                None,
            );

            let stream = match built {
                Ok(s) => s,
                Err(e) => {
                    let _ = ready_tx.send(Err(VoiceError::Audio(format!(
                        "failed to build output stream: {e}"
                    ))));
                    return;
                }
            };
            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(VoiceError::Audio(format!(
                    "failed to start output stream: {e}"
                ))));
                return;
            }
            let _ = ready_tx.send(Ok(()));

            let _ = stop_rx.recv();
            drop(stream);
        })
        .map_err(|e| VoiceError::Audio(format!("failed to spawn playback thread: {e}")))?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(StreamThread { stop_tx, thread }),
        Ok(Err(e)) => {
            let _ = thread.join();
            Err(e)
        }
        Err(_) => {
            let _ = thread.join();
            Err(VoiceError::Audio("playback thread exited during startup".into()))
        }
    }
}

/// One scheduled unit inside the mixer.
struct Voice {
    id: UnitId,
    start_frame: u64,
    samples: Arc<[f32]>,
    channels: usize,
    /// Next sample frame to play.
    position: usize,
}

impl Voice {
    fn frame_count(&self) -> usize {
        self.samples.len() / self.channels.max(1)
    }
}

/// Shared state between the output callback and the session.
struct Mixer {
    /// Frames rendered since the stream started; the output clock.
    frames_played: u64,
    voices: Vec<Voice>,
    events: mpsc::UnboundedSender<PlaybackEvent>,
}

impl Mixer {
    fn new(events: mpsc::UnboundedSender<PlaybackEvent>) -> Self {
        Self {
            frames_played: 0,
            voices: Vec::new(),
            events,
        }
    }

    /// Fill a mono output buffer and report units that ran out.
    fn render(&mut self, out: &mut [f32]) {
        for slot in out.iter_mut() {
            let now = self.frames_played;
            let mut mixed = 0.0f32;
            for voice in &mut self.voices {
                if now < voice.start_frame || voice.position >= voice.frame_count() {
                    continue;
                }
                // Downmix to mono by taking the first channel.
                mixed += voice.samples[voice.position * voice.channels];
                voice.position += 1;
            }
            *slot = mixed.clamp(-1.0, 1.0);
            self.frames_played += 1;
        }

        let events = &self.events;
        self.voices.retain(|voice| {
            let done = voice.position >= voice.frame_count();
            if done {
                let _ = events.send(PlaybackEvent::Finished(voice.id));
            }
            !done
        });
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    fn voice(id: UnitId, start_frame: u64, samples: Vec<f32>) -> Voice {
        Voice {
            id,
            start_frame,
            samples: samples.into(),
            channels: 1,
            position: 0,
        }
    }

    #[test]
    fn mixer_plays_units_back_to_back() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut mixer = Mixer::new(tx);
        mixer.voices.push(voice(1, 0, vec![0.1, 0.1]));
        mixer.voices.push(voice(2, 2, vec![0.2, 0.2]));

        let mut out = [0.0f32; 4];
        mixer.render(&mut out);

        assert_eq!(out, [0.1, 0.1, 0.2, 0.2]);
        assert_eq!(mixer.frames_played, 4);
        assert_eq!(rx.try_recv().unwrap(), PlaybackEvent::Finished(1));
        assert_eq!(rx.try_recv().unwrap(), PlaybackEvent::Finished(2));
        assert!(mixer.voices.is_empty());
    }

    #[test]
    fn mixer_emits_silence_before_start() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut mixer = Mixer::new(tx);
        mixer.voices.push(voice(7, 3, vec![0.5]));

        let mut out = [1.0f32; 2];
        mixer.render(&mut out);
        assert_eq!(out, [0.0, 0.0]);
        assert!(rx.try_recv().is_err());
        assert_eq!(mixer.voices.len(), 1);
    }

    #[test]
    fn mixer_clamps_overlapping_units() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut mixer = Mixer::new(tx);
        mixer.voices.push(voice(1, 0, vec![0.8]));
        mixer.voices.push(voice(2, 0, vec![0.8]));

        let mut out = [0.0f32; 1];
        mixer.render(&mut out);
        assert_eq!(out, [1.0]);
    }
}
