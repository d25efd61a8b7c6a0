//! The playback buffer: synthesized audio waiting to be rendered.
//!
//! Frames are kept strictly in arrival order and tagged with the utterance
//! they belong to. Interruption is two-phase: [`PlaybackBuffer::interrupt`]
//! clears everything and starts discarding new frames, and
//! [`PlaybackBuffer::allow`] lets frames buffer again.
//!
//! The buffer is bounded by a number of samples. When synthesis outpaces
//! playback past that bound, the oldest unplayed frames are evicted.

use std::collections::VecDeque;
use tracing::warn;

/// One decoded frame of synthesized audio.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub utterance: u64,
    pub sequence: u64,
    pub samples: Vec<i16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Buffered,
    /// Interrupted: the frame was discarded.
    Discarded,
    /// Buffered after evicting `dropped` older frames to stay within bounds.
    BufferedWithEviction { dropped: usize },
}

/// Who holds the block, which decides when it lifts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    /// The host called `interrupt()`; held until `allow()`.
    Host,
    /// The user barged in; lifts when the next agent utterance begins.
    BargeIn,
}

#[derive(Debug)]
pub struct PlaybackBuffer {
    queue: VecDeque<AudioChunk>,
    queued_samples: usize,
    capacity_samples: usize,
    blocked: Option<BlockReason>,
    utterance: u64,
    next_sequence: u64,
    synthesis_complete: bool,
    completion_reported: bool,
    evicted_total: u64,
}

impl PlaybackBuffer {
    pub fn new(capacity_samples: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            queued_samples: 0,
            capacity_samples: capacity_samples.max(1),
            blocked: None,
            utterance: 0,
            next_sequence: 0,
            synthesis_complete: false,
            completion_reported: true,
            evicted_total: 0,
        }
    }

    /// Frames waiting to be played.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn queued_samples(&self) -> usize {
        self.queued_samples
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked.is_some()
    }

    pub fn block_reason(&self) -> Option<BlockReason> {
        self.blocked
    }

    pub fn current_utterance(&self) -> u64 {
        self.utterance
    }

    pub fn evicted_total(&self) -> u64 {
        self.evicted_total
    }

    /// Starts a new agent utterance and returns its id. Lifts a barge-in block.
    pub fn begin_utterance(&mut self) -> u64 {
        self.utterance += 1;
        self.synthesis_complete = false;
        self.completion_reported = false;
        if self.blocked == Some(BlockReason::BargeIn) {
            self.blocked = None;
        }
        self.utterance
    }

    pub fn push(&mut self, samples: Vec<i16>) -> PushOutcome {
        if self.blocked.is_some() {
            return PushOutcome::Discarded;
        }

        let mut dropped = 0;
        while !self.queue.is_empty() && self.queued_samples + samples.len() > self.capacity_samples {
            if let Some(old) = self.queue.pop_front() {
                self.queued_samples -= old.samples.len();
                dropped += 1;
            }
        }

        self.queued_samples += samples.len();
        self.queue.push_back(AudioChunk {
            utterance: self.utterance,
            sequence: self.next_sequence,
            samples,
        });
        self.next_sequence += 1;

        if dropped > 0 {
            self.evicted_total += dropped as u64;
            warn!(
                dropped,
                total = self.evicted_total,
                "Playback buffer over capacity, dropped oldest unplayed frames"
            );
            PushOutcome::BufferedWithEviction { dropped }
        } else {
            PushOutcome::Buffered
        }
    }

    pub fn pop(&mut self) -> Option<AudioChunk> {
        let chunk = self.queue.pop_front()?;
        self.queued_samples -= chunk.samples.len();
        Some(chunk)
    }

    /// The service finished synthesizing the current utterance.
    pub fn mark_synthesis_complete(&mut self) {
        self.synthesis_complete = true;
    }

    /// Clears every buffered frame and blocks new ones. Returns how many were discarded.
    ///
    /// The current utterance counts as finished: nothing more of it will be played.
    pub fn interrupt(&mut self, reason: BlockReason) -> usize {
        let discarded = self.queue.len();
        self.queue.clear();
        self.queued_samples = 0;
        self.synthesis_complete = true;
        if self.blocked != Some(BlockReason::Host) {
            self.blocked = Some(reason);
        }
        discarded
    }

    pub fn allow(&mut self) {
        self.blocked = None;
    }

    /// Clears frames and all flags. Used on session teardown.
    pub fn reset(&mut self) {
        self.queue.clear();
        self.queued_samples = 0;
        self.blocked = None;
        self.synthesis_complete = false;
        self.completion_reported = true;
    }

    /// Whether a completion is still owed for the current utterance.
    pub fn completion_pending(&self) -> bool {
        !self.completion_reported
    }

    /// Reports, once, that the current utterance has been fully played.
    ///
    /// Requires synthesis to be complete, the buffer to be exhausted and the
    /// output device to have rendered everything it was given.
    pub fn take_completion(&mut self, output_idle: bool) -> Option<u64> {
        if self.completion_reported || !self.synthesis_complete || !self.queue.is_empty() || !output_idle {
            return None;
        }
        self.completion_reported = true;
        Some(self.utterance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{AgentState, StateMachine, Trigger};

    fn frame() -> Vec<i16> {
        vec![0; 480]
    }

    #[test]
    fn test_interrupt_then_allow() {
        let mut buffer = PlaybackBuffer::new(48_000);
        buffer.begin_utterance();

        buffer.push(frame());
        buffer.push(frame());
        assert_eq!(buffer.len(), 2);

        assert_eq!(buffer.interrupt(BlockReason::Host), 2);
        assert_eq!(buffer.len(), 0);

        assert_eq!(buffer.push(frame()), PushOutcome::Discarded);
        assert_eq!(buffer.len(), 0);

        buffer.allow();
        assert_eq!(buffer.push(frame()), PushOutcome::Buffered);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_barge_in_block_lifts_on_next_utterance_but_host_block_does_not() {
        let mut buffer = PlaybackBuffer::new(48_000);
        buffer.begin_utterance();
        buffer.interrupt(BlockReason::BargeIn);
        assert_eq!(buffer.push(frame()), PushOutcome::Discarded);

        buffer.begin_utterance();
        assert!(!buffer.is_blocked());
        assert_eq!(buffer.push(frame()), PushOutcome::Buffered);

        buffer.interrupt(BlockReason::Host);
        // A later barge-in must not downgrade the host's hold.
        buffer.interrupt(BlockReason::BargeIn);
        buffer.begin_utterance();
        assert_eq!(buffer.block_reason(), Some(BlockReason::Host));
    }

    #[test]
    fn test_frames_keep_arrival_order_and_utterance_tag() {
        let mut buffer = PlaybackBuffer::new(48_000);
        let first = buffer.begin_utterance();
        buffer.push(vec![1]);
        buffer.push(vec![2]);
        let second = buffer.begin_utterance();
        buffer.push(vec![3]);

        let played: Vec<(u64, i16)> = std::iter::from_fn(|| buffer.pop())
            .map(|c| (c.utterance, c.samples[0]))
            .collect();
        assert_eq!(played, vec![(first, 1), (first, 2), (second, 3)]);
    }

    #[test]
    fn test_overflow_evicts_oldest() {
        let mut buffer = PlaybackBuffer::new(1_000);
        buffer.begin_utterance();
        buffer.push(vec![1; 400]);
        buffer.push(vec![2; 400]);

        assert_eq!(
            buffer.push(vec![3; 400]),
            PushOutcome::BufferedWithEviction { dropped: 1 }
        );
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.queued_samples(), 800);
        assert_eq!(buffer.pop().map(|c| c.samples[0]), Some(2));
        assert_eq!(buffer.evicted_total(), 1);
    }

    #[test]
    fn test_synthesis_complete_alone_does_not_end_speaking() {
        let mut machine = StateMachine::new();
        let mut buffer = PlaybackBuffer::new(48_000);

        let utterance = buffer.begin_utterance();
        machine.apply(Trigger::AgentSpeechStarted { utterance });
        for _ in 0..3 {
            buffer.push(frame());
        }

        buffer.mark_synthesis_complete();
        assert_eq!(buffer.take_completion(true), None);
        assert_eq!(machine.state(), AgentState::Speaking);

        while buffer.pop().is_some() {}
        // Device still rendering the last frame.
        assert_eq!(buffer.take_completion(false), None);

        let done = buffer.take_completion(true).expect("utterance completed");
        machine.apply(Trigger::PlaybackCompleted { utterance: done });
        assert_eq!(machine.state(), AgentState::Idle);

        // Reported only once.
        assert_eq!(buffer.take_completion(true), None);
    }

    #[test]
    fn test_interrupt_completes_the_current_utterance() {
        let mut buffer = PlaybackBuffer::new(48_000);
        let utterance = buffer.begin_utterance();
        buffer.push(frame());
        buffer.interrupt(BlockReason::Host);
        assert_eq!(buffer.take_completion(true), Some(utterance));
    }

    #[test]
    fn test_no_completion_before_any_utterance() {
        let mut buffer = PlaybackBuffer::new(48_000);
        buffer.mark_synthesis_complete();
        assert_eq!(buffer.take_completion(true), None);
        assert!(!buffer.completion_pending());
    }
}
