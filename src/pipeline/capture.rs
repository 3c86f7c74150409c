//! Microphone framing and transmission.
//!
//! Raw microphone buffers arrive in whatever sizes the device delivers. The
//! framer cuts them into fixed blocks; each block is encoded and handed to
//! the connection without waiting for delivery.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audio::CaptureDevice;
use crate::codec::encode_outbound;
use crate::error::Result;
use crate::live::{LiveSender, MediaChunk};

/// Cuts a continuous sample stream into fixed-size blocks.
#[derive(Debug)]
pub struct Framer {
    frame_size: usize,
    buffer: Vec<f32>,
}

impl Framer {
    /// `frame_size` of zero is treated as one.
    pub fn new(frame_size: usize) -> Self {
        let frame_size = frame_size.max(1);
        Self {
            frame_size,
            buffer: Vec::with_capacity(frame_size),
        }
    }

    /// Append samples and return every block that is now complete.
    pub fn push(&mut self, samples: &[f32]) -> Vec<Vec<f32>> {
        let mut blocks = Vec::new();
        let mut rest = samples;
        while !rest.is_empty() {
            let take = (self.frame_size - self.buffer.len()).min(rest.len());
            self.buffer.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.buffer.len() == self.frame_size {
                blocks.push(std::mem::replace(
                    &mut self.buffer,
                    Vec::with_capacity(self.frame_size),
                ));
            }
        }
        blocks
    }

    /// Samples held back waiting for a full block.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Connects a capture device to the outbound connection.
pub struct CapturePipeline {
    frame_size: usize,
    queue_depth: usize,
    running: Option<Running>,
}

struct Running {
    cancel: CancellationToken,
    _task: JoinHandle<()>,
}

impl CapturePipeline {
    pub fn new(frame_size: usize, queue_depth: usize) -> Self {
        Self {
            frame_size,
            queue_depth: queue_depth.max(1),
            running: None,
        }
    }

    /// Start the device and the framing task. A second call while running
    /// is a no-op. Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the device fails to start.
    pub fn start(&mut self, device: &mut dyn CaptureDevice, sender: LiveSender) -> Result<()> {
        if self.running.is_some() {
            return Ok(());
        }
        let (tx, rx) = mpsc::channel(self.queue_depth);
        device.start(tx)?;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_framer(rx, self.frame_size, sender, cancel.clone()));
        info!(
            frame_size = self.frame_size,
            sample_rate = device.sample_rate(),
            "capture pipeline started"
        );
        self.running = Some(Running {
            cancel,
            _task: task,
        });
        Ok(())
    }

    /// Disconnect the framing task. Idempotent.
    pub fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.cancel.cancel();
            debug!("capture pipeline stopping");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_framer(
    mut rx: mpsc::Receiver<Vec<f32>>,
    frame_size: usize,
    sender: LiveSender,
    cancel: CancellationToken,
) {
    let mut framer = Framer::new(frame_size);
    let mut sent: u64 = 0;
    let mut failed: u64 = 0;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            buf = rx.recv() => {
                let Some(buf) = buf else { break };
                for block in framer.push(&buf) {
                    let chunk = MediaChunk::pcm16(encode_outbound(&block));
                    match sender.send_audio(chunk) {
                        Ok(()) => sent += 1,
                        Err(e) => {
                            failed += 1;
                            if failed == 1 {
                                warn!("dropping outbound audio frame: {e}");
                            } else {
                                debug!(failed, "dropping outbound audio frame: {e}");
                            }
                        }
                    }
                }
            }
        }
    }

    info!(sent, failed, "capture pipeline stopped");
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::codec::decode_inbound;
    use crate::live::OutboundCommand;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[test]
    fn framer_emits_whole_blocks_and_keeps_remainder() {
        let mut framer = Framer::new(4);
        assert!(framer.push(&[0.1, 0.2, 0.3]).is_empty());
        assert_eq!(framer.pending(), 3);

        let blocks = framer.push(&[0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 1.0]);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0], vec![0.1, 0.2, 0.3, 0.4]);
        assert_eq!(blocks[1], vec![0.5, 0.6, 0.7, 0.8]);
        assert_eq!(framer.pending(), 2);
    }

    #[test]
    fn framer_block_count_matches_input_length() {
        let mut framer = Framer::new(4096);
        let mut blocks = 0;
        for _ in 0..10 {
            blocks += framer.push(&[0.0f32; 1000]).len();
        }
        assert_eq!(blocks, 10_000 / 4096);
        assert_eq!(framer.pending(), 10_000 % 4096);
    }

    /// Device that hands its sink to the test.
    #[derive(Default)]
    struct ManualDevice {
        sink: Arc<Mutex<Option<mpsc::Sender<Vec<f32>>>>>,
        starts: usize,
    }

    impl CaptureDevice for ManualDevice {
        fn sample_rate(&self) -> u32 {
            16_000
        }
        fn start(&mut self, sink: mpsc::Sender<Vec<f32>>) -> Result<()> {
            self.starts += 1;
            *self.sink.lock().unwrap() = Some(sink);
            Ok(())
        }
        fn stop_tracks(&mut self) {
            self.sink.lock().unwrap().take();
        }
        fn close(&mut self) {}
    }

    #[tokio::test]
    async fn blocks_are_encoded_and_sent() {
        let mut device = ManualDevice::default();
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let mut pipeline = CapturePipeline::new(4, 8);

        pipeline
            .start(&mut device, LiveSender::new(out_tx.clone()))
            .unwrap();
        pipeline
            .start(&mut device, LiveSender::new(out_tx))
            .unwrap();
        assert_eq!(device.starts, 1);

        let sink = device.sink.lock().unwrap().clone().unwrap();
        sink.send(vec![0.5, -0.5, 0.25, -0.25, 0.125]).await.unwrap();

        let cmd = tokio::time::timeout(Duration::from_secs(1), out_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let OutboundCommand::Audio(chunk) = cmd else {
            panic!("expected audio");
        };
        assert_eq!(chunk.mime_type, "audio/pcm;rate=16000");
        let frame = decode_inbound(&chunk.data, 16_000, 1).unwrap();
        assert_eq!(frame.samples(), &[0.5, -0.5, 0.25, -0.25]);

        pipeline.stop();
        pipeline.stop();
        assert!(!pipeline.is_running());
    }

    #[tokio::test]
    async fn send_failure_does_not_stop_framing() {
        let mut device = ManualDevice::default();
        let (out_tx, out_rx) = mpsc::channel(16);
        drop(out_rx);
        let mut pipeline = CapturePipeline::new(2, 8);
        pipeline.start(&mut device, LiveSender::new(out_tx)).unwrap();

        let sink = device.sink.lock().unwrap().clone().unwrap();
        for _ in 0..5 {
            sink.send(vec![0.1, 0.2]).await.unwrap();
        }
        // The framer keeps draining the queue even though every send fails.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sink.capacity(), 8);
        pipeline.stop();
    }
}
