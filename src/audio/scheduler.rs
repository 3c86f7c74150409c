//! Gapless playback scheduling for streamed audio chunks.
//!
//! Every unit's start time is anchored on the previous unit's computed end
//! (the playback cursor), never on the time its decode finished. Chunks are
//! decoded asynchronously, so decodes may complete out of order; each chunk
//! reserves a [`ChunkTicket`] when it arrives and decoded frames are released
//! to the output strictly in ticket order.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, info, warn};

use super::backend::{AudioOutput, UnitId};
use super::frame::AudioFrame;
use crate::error::{Result, VoiceError};

/// Position of a chunk in the arrival order of the current playback epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkTicket {
    epoch: u64,
    seq: u64,
}

/// A frame scheduled on the output clock.
#[derive(Debug, Clone)]
pub struct PlaybackUnit {
    pub id: UnitId,
    pub frame: AudioFrame,
    /// Start time on the output clock, in seconds.
    pub start_time: f64,
}

impl PlaybackUnit {
    pub fn end_time(&self) -> f64 {
        self.start_time + self.frame.duration()
    }
}

/// Schedules decoded frames for back-to-back playback on one output clock.
pub struct PlaybackScheduler {
    output: Option<Box<dyn AudioOutput>>,
    /// Where the next unit starts; `None` until the first enqueue after
    /// creation or interruption.
    next_start_time: Option<f64>,
    active: HashMap<UnitId, PlaybackUnit>,
    next_unit_id: UnitId,
    /// Bumped on every interruption; tickets from older epochs are stale.
    epoch: u64,
    next_ticket: u64,
    next_release: u64,
    pending: BTreeMap<u64, AudioFrame>,
}

impl PlaybackScheduler {
    pub fn new(output: Box<dyn AudioOutput>) -> Self {
        Self {
            output: Some(output),
            next_start_time: None,
            active: HashMap::new(),
            next_unit_id: 1,
            epoch: 0,
            next_ticket: 0,
            next_release: 0,
            pending: BTreeMap::new(),
        }
    }

    /// Reserve the next slot in arrival order. Call before decoding a chunk.
    pub fn reserve(&mut self) -> ChunkTicket {
        let ticket = ChunkTicket {
            epoch: self.epoch,
            seq: self.next_ticket,
        };
        self.next_ticket += 1;
        ticket
    }

    /// Hand over a decoded frame for a reserved ticket.
    ///
    /// Frames are held until every earlier ticket has been submitted, then
    /// enqueued in ticket order. Returns the units scheduled by this call,
    /// which may be empty. Tickets issued before the last
    /// [`interrupt`](Self::interrupt) are dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the output rejects a unit.
    pub fn submit(&mut self, ticket: ChunkTicket, frame: AudioFrame) -> Result<Vec<UnitId>> {
        if ticket.epoch != self.epoch {
            debug!(seq = ticket.seq, "dropping chunk decoded before interruption");
            return Ok(Vec::new());
        }
        if ticket.seq < self.next_release {
            warn!(seq = ticket.seq, "duplicate chunk submission ignored");
            return Ok(Vec::new());
        }
        self.pending.insert(ticket.seq, frame);

        let mut scheduled = Vec::new();
        while let Some(frame) = self.pending.remove(&self.next_release) {
            self.next_release += 1;
            if frame.is_empty() {
                continue;
            }
            scheduled.push(self.enqueue(frame)?);
        }
        Ok(scheduled)
    }

    /// Schedule a frame immediately after everything already queued.
    ///
    /// # Errors
    ///
    /// Returns an error if the scheduler has been shut down or the output
    /// rejects the unit.
    pub fn enqueue(&mut self, frame: AudioFrame) -> Result<UnitId> {
        let output = self
            .output
            .as_mut()
            .ok_or_else(|| VoiceError::Audio("playback scheduler is shut down".into()))?;

        let now = output.current_time();
        let start_time = match self.next_start_time {
            Some(cursor) => cursor.max(now),
            None => now,
        };
        let id = self.next_unit_id;
        self.next_unit_id += 1;

        output.start(id, &frame, start_time)?;

        let unit = PlaybackUnit {
            id,
            frame,
            start_time,
        };
        self.next_start_time = Some(unit.end_time());
        debug!(
            unit = id,
            start = start_time,
            duration = unit.frame.duration(),
            "scheduled playback unit"
        );
        self.active.insert(id, unit);
        Ok(id)
    }

    /// Record that a unit played to its end.
    ///
    /// Returns `true` when this drained the scheduler: no unit is playing
    /// and no reserved chunk is still waiting for its decode. Ids that are no
    /// longer active (stopped by an interruption) return `false`.
    pub fn on_finished(&mut self, id: UnitId) -> bool {
        self.active.remove(&id).is_some() && self.is_drained()
    }

    /// Nothing is playing and every reserved ticket has been submitted.
    pub fn is_drained(&self) -> bool {
        self.active.is_empty() && self.next_release == self.next_ticket
    }

    /// Stop every active unit and reset the cursor.
    ///
    /// Chunks still being decoded are invalidated, so nothing reserved
    /// before this call will play after it.
    pub fn interrupt(&mut self) {
        let stopped = self.active.len();
        if let Some(output) = self.output.as_mut() {
            for id in self.active.keys() {
                output.stop(*id);
            }
        }
        self.active.clear();
        self.next_start_time = None;
        self.pending.clear();
        self.epoch += 1;
        self.next_ticket = 0;
        self.next_release = 0;
        if stopped > 0 {
            info!(stopped, "playback interrupted");
        }
    }

    /// Stop everything and release the output clock. Idempotent.
    pub fn shutdown(&mut self) {
        self.interrupt();
        if let Some(mut output) = self.output.take() {
            output.close();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.output.is_none()
    }

    /// Number of units scheduled and not yet finished.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// The playback cursor, or `None` when unset.
    pub fn next_start_time(&self) -> Option<f64> {
        self.next_start_time
    }

    /// Active units ordered by start time.
    pub fn active_units(&self) -> Vec<&PlaybackUnit> {
        let mut units: Vec<&PlaybackUnit> = self.active.values().collect();
        units.sort_by(|a, b| a.start_time.total_cmp(&b.start_time));
        units
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recorded {
        now: f64,
        started: Vec<(UnitId, f64)>,
        stopped: Vec<UnitId>,
        closed: usize,
    }

    /// Output with a hand-driven clock.
    #[derive(Clone, Default)]
    struct FakeOutput(Arc<Mutex<Recorded>>);

    impl FakeOutput {
        fn set_now(&self, now: f64) {
            self.0.lock().unwrap().now = now;
        }
    }

    impl AudioOutput for FakeOutput {
        fn sample_rate(&self) -> u32 {
            24_000
        }
        fn current_time(&self) -> f64 {
            self.0.lock().unwrap().now
        }
        fn start(&mut self, id: UnitId, _frame: &AudioFrame, at: f64) -> Result<()> {
            self.0.lock().unwrap().started.push((id, at));
            Ok(())
        }
        fn stop(&mut self, id: UnitId) {
            self.0.lock().unwrap().stopped.push(id);
        }
        fn close(&mut self) {
            self.0.lock().unwrap().closed += 1;
        }
    }

    /// A frame of `secs` seconds at 24kHz.
    fn frame(secs: f64) -> AudioFrame {
        AudioFrame::new(vec![0.0f32; (secs * 24_000.0) as usize], 24_000, 1)
    }

    fn scheduler() -> (PlaybackScheduler, FakeOutput) {
        let output = FakeOutput::default();
        (PlaybackScheduler::new(Box::new(output.clone())), output)
    }

    #[test]
    fn units_chain_without_gap_or_overlap() {
        let (mut sched, output) = scheduler();
        output.set_now(1.0);
        for secs in [0.5, 0.25, 1.0, 0.125] {
            sched.enqueue(frame(secs)).unwrap();
        }

        let units = sched.active_units();
        assert_eq!(units.len(), 4);
        assert!((units[0].start_time - 1.0).abs() < 1e-9);
        for pair in units.windows(2) {
            assert!(pair[1].start_time >= pair[0].start_time);
            assert!((pair[1].start_time - pair[0].end_time()).abs() < 1e-9);
        }
        assert!((sched.next_start_time().unwrap() - 2.875).abs() < 1e-9);
    }

    #[test]
    fn late_chunk_starts_at_device_time() {
        let (mut sched, output) = scheduler();
        output.set_now(0.0);
        sched.enqueue(frame(0.5)).unwrap();

        // The clock ran past the cursor before the next chunk arrived.
        output.set_now(2.0);
        let id = sched.enqueue(frame(0.5)).unwrap();

        let recorded = output.0.lock().unwrap();
        let (_, at) = recorded.started.iter().find(|(u, _)| *u == id).unwrap();
        assert!((at - 2.0).abs() < 1e-9);
    }

    #[test]
    fn out_of_order_decodes_play_in_arrival_order() {
        let (mut sched, output) = scheduler();
        let first = sched.reserve();
        let second = sched.reserve();
        let third = sched.reserve();

        assert!(sched.submit(third, frame(0.3)).unwrap().is_empty());
        assert!(sched.submit(second, frame(0.2)).unwrap().is_empty());
        let scheduled = sched.submit(first, frame(0.1)).unwrap();
        assert_eq!(scheduled.len(), 3);

        let recorded = output.0.lock().unwrap();
        let starts: Vec<f64> = recorded.started.iter().map(|(_, at)| *at).collect();
        assert!((starts[0] - 0.0).abs() < 1e-9);
        assert!((starts[1] - 0.1).abs() < 1e-9);
        assert!((starts[2] - 0.3).abs() < 1e-9);
    }

    #[test]
    fn interrupt_empties_active_set_for_any_size() {
        for count in [0usize, 1, 5] {
            let (mut sched, output) = scheduler();
            for _ in 0..count {
                sched.enqueue(frame(0.2)).unwrap();
            }
            sched.interrupt();
            assert_eq!(sched.active_count(), 0);
            assert_eq!(sched.next_start_time(), None);
            assert_eq!(output.0.lock().unwrap().stopped.len(), count);
        }
    }

    #[test]
    fn interrupt_resets_cursor_to_device_time() {
        let (mut sched, output) = scheduler();
        output.set_now(0.0);
        sched.enqueue(frame(5.0)).unwrap();
        output.set_now(1.0);
        sched.interrupt();

        sched.enqueue(frame(0.5)).unwrap();
        let units = sched.active_units();
        assert_eq!(units.len(), 1);
        assert!((units[0].start_time - 1.0).abs() < 1e-9);
    }

    #[test]
    fn chunks_reserved_before_interrupt_never_play() {
        let (mut sched, output) = scheduler();
        let stale = sched.reserve();
        sched.interrupt();
        let fresh = sched.reserve();

        assert!(sched.submit(stale, frame(0.5)).unwrap().is_empty());
        assert_eq!(sched.submit(fresh, frame(0.5)).unwrap().len(), 1);
        assert_eq!(output.0.lock().unwrap().started.len(), 1);
    }

    #[test]
    fn finishing_last_unit_reports_drained() {
        let (mut sched, _output) = scheduler();
        let a = sched.enqueue(frame(0.1)).unwrap();
        let b = sched.enqueue(frame(0.1)).unwrap();

        assert!(!sched.on_finished(a));
        assert!(sched.on_finished(b));
        // Already removed.
        assert!(!sched.on_finished(b));
    }

    #[test]
    fn finish_is_not_drained_while_a_chunk_is_decoding() {
        let (mut sched, _output) = scheduler();
        let first = sched.reserve();
        let a = sched.submit(first, frame(0.1)).unwrap()[0];

        let second = sched.reserve();
        assert!(!sched.on_finished(a));
        assert!(!sched.is_drained());

        let b = sched.submit(second, frame(0.1)).unwrap()[0];
        assert!(sched.on_finished(b));
    }

    #[test]
    fn empty_last_chunk_leaves_scheduler_drained() {
        let (mut sched, _output) = scheduler();
        let ticket = sched.reserve();
        assert!(!sched.is_drained());
        sched
            .submit(ticket, AudioFrame::new(Vec::new(), 24_000, 1))
            .unwrap();
        assert!(sched.is_drained());
    }

    #[test]
    fn interrupt_forgets_outstanding_tickets() {
        let (mut sched, _output) = scheduler();
        let _pending = sched.reserve();
        sched.interrupt();
        assert!(sched.is_drained());
    }

    #[test]
    fn stopped_unit_finish_is_ignored() {
        let (mut sched, _output) = scheduler();
        let a = sched.enqueue(frame(0.1)).unwrap();
        sched.interrupt();
        assert!(!sched.on_finished(a));
    }

    #[test]
    fn shutdown_closes_output_once() {
        let (mut sched, output) = scheduler();
        sched.enqueue(frame(0.1)).unwrap();
        sched.shutdown();
        sched.shutdown();
        drop(sched);

        let recorded = output.0.lock().unwrap();
        assert_eq!(recorded.closed, 1);
        assert_eq!(recorded.stopped.len(), 1);
    }

    #[test]
    fn enqueue_after_shutdown_fails() {
        let (mut sched, _output) = scheduler();
        sched.shutdown();
        assert!(sched.is_shut_down());
        assert!(sched.enqueue(frame(0.1)).is_err());
    }

    #[test]
    fn empty_frames_are_skipped_but_keep_order() {
        let (mut sched, _output) = scheduler();
        let a = sched.reserve();
        let b = sched.reserve();
        assert!(sched.submit(a, AudioFrame::new(Vec::new(), 24_000, 1)).unwrap().is_empty());
        assert_eq!(sched.submit(b, frame(0.1)).unwrap().len(), 1);
    }
}
