//! Microphone audio capture using cpal.
//!
//! Captures audio at the device's native sample rate and downsamples
//! to the 16kHz mono wire rate.

use crate::config::AudioConfig;
use crate::error::{Result, VoiceError};
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::backend::CaptureDevice;

/// Audio capture from system microphone via cpal.
///
/// The cpal stream lives on a dedicated thread for as long as the tracks are
/// running; this handle only holds the device and the stop signal.
pub struct CpalCapture {
    device: Option<cpal::Device>,
    stream_config: StreamConfig,
    /// The target sample rate delivered to the sink (e.g., 16kHz).
    target_sample_rate: u32,
    tracks: Option<Tracks>,
}

/// A running input stream thread.
struct Tracks {
    stop_tx: std_mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

impl CpalCapture {
    /// Open the configured (or default) input device.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Permission`] if no input device is available or
    /// the device refuses to report a configuration.
    pub fn new(config: &AudioConfig, target_sample_rate: u32) -> Result<Self> {
        let host = cpal::default_host();

        let device = if let Some(ref name) = config.input_device {
            host.input_devices()
                .map_err(|e| VoiceError::Permission(format!("cannot enumerate devices: {e}")))?
                .find(|d| {
                    d.description()
                        .ok()
                        .map(|desc| desc.name() == name)
                        .unwrap_or(false)
                })
                .ok_or_else(|| VoiceError::Permission(format!("input device '{name}' not found")))?
        } else {
            host.default_input_device()
                .ok_or_else(|| VoiceError::Permission("no default input device".into()))?
        };

        let device_name = device
            .description()
            .map(|d| d.name().to_owned())
            .unwrap_or_else(|_| "<unknown>".into());
        info!("using input device: {device_name}");

        let default_config = device
            .default_input_config()
            .map_err(|e| VoiceError::Permission(format!("no default input config: {e}")))?;

        let stream_config = StreamConfig {
            channels: default_config.channels(),
            sample_rate: default_config.sample_rate(),
            buffer_size: cpal::BufferSize::Default,
        };

        info!(
            "native input config: {}Hz, {} channels",
            stream_config.sample_rate, stream_config.channels
        );

        Ok(Self {
            device: Some(device),
            stream_config,
            target_sample_rate,
            tracks: None,
        })
    }

    /// List available input devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_input_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| VoiceError::Audio(format!("cannot enumerate devices: {e}")))?;

        let mut names = Vec::new();
        for device in devices {
            if let Ok(desc) = device.description() {
                names.push(desc.name().to_owned());
            }
        }
        Ok(names)
    }
}

impl CaptureDevice for CpalCapture {
    fn sample_rate(&self) -> u32 {
        self.target_sample_rate
    }

    fn start(&mut self, sink: mpsc::Sender<Vec<f32>>) -> Result<()> {
        if self.tracks.is_some() {
            return Ok(());
        }
        let device = self
            .device
            .clone()
            .ok_or_else(|| VoiceError::Audio("input device already closed".into()))?;
        let stream_config = self.stream_config.clone();
        let target_rate = self.target_sample_rate;

        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<()>>(1);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("rohana-mic".into())
            .spawn(move || {
                let native_rate = stream_config.sample_rate;
                let native_channels = stream_config.channels;

                let built = device.build_input_stream(
                    &stream_config,
                    move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                        let mono = if native_channels > 1 {
                            to_mono(data, native_channels)
                        } else {
                            data.to_vec()
                        };
                        let samples = if native_rate != target_rate {
                            downsample(&mono, native_rate, target_rate)
                        } else {
                            mono
                        };
                        // Use try_send to avoid blocking the audio thread
                        if sink.try_send(samples).is_err() {
                            debug!("capture queue full, dropping buffer");
                        }
                    },
                    move |err| {
                        error!("audio input stream error: {err}");
                    },
                    None,
                );

                let stream = match built {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = ready_tx.send(Err(VoiceError::Audio(format!(
                            "failed to build input stream: {e}"
                        ))));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(VoiceError::Audio(format!(
                        "failed to start input stream: {e}"
                    ))));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                info!(
                    "audio capture started: native {}Hz -> target {}Hz",
                    native_rate, target_rate
                );

                // Hold the stream alive until stopped or the handle is dropped.
                let _ = stop_rx.recv();
                drop(stream);
                info!("audio capture stopped");
            })
            .map_err(|e| VoiceError::Audio(format!("failed to spawn capture thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.tracks = Some(Tracks { stop_tx, thread });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(VoiceError::Audio("capture thread exited during startup".into()))
            }
        }
    }

    fn stop_tracks(&mut self) {
        if let Some(tracks) = self.tracks.take() {
            let _ = tracks.stop_tx.send(());
            if tracks.thread.join().is_err() {
                warn!("capture thread panicked during shutdown");
            }
        }
    }

    fn close(&mut self) {
        self.stop_tracks();
        if self.device.take().is_some() {
            debug!("input device released");
        }
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.close();
    }
}

/// Convert interleaved multi-channel audio to mono by averaging channels.
fn to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    let ch = channels as usize;
    data.chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Simple linear-interpolation downsampler.
///
/// Speech energy sits below 8kHz, so 48kHz → 16kHz needs no anti-alias filter.
fn downsample(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = src_rate as f64 / dst_rate as f64;
    let out_len = (samples.len() as f64 / ratio) as usize;
    let mut output = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos as usize;
        let frac = src_pos - idx as f64;

        let sample = if idx + 1 < samples.len() {
            samples[idx] as f64 * (1.0 - frac) + samples[idx + 1] as f64 * frac
        } else {
            samples[idx.min(samples.len() - 1)] as f64
        };

        output.push(sample as f32);
    }

    output
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn to_mono_averages_channels() {
        let stereo = [0.2, 0.4, -0.5, 0.5];
        let mono = to_mono(&stereo, 2);
        assert_eq!(mono.len(), 2);
        assert!((mono[0] - 0.3).abs() < 1e-6);
        assert!(mono[1].abs() < 1e-6);
    }

    #[test]
    fn downsample_48k_to_16k_keeps_a_third() {
        let samples: Vec<f32> = (0..4800).map(|i| (i as f32 / 4800.0)).collect();
        let out = downsample(&samples, 48_000, 16_000);
        assert_eq!(out.len(), 1600);
        assert!((out[1] - samples[3]).abs() < 1e-6);
    }

    #[test]
    fn downsample_same_rate_is_identity() {
        let samples = vec![0.1, 0.2, 0.3];
        assert_eq!(downsample(&samples, 16_000, 16_000), samples);
    }
}
