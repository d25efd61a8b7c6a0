//! The audio pipeline: capture framing on the way out, buffered playback on
//! the way in.
//!
//! The pipeline is driven by its owner. [`AudioPipeline::pump`] moves frames
//! from the [`PlaybackBuffer`] to the device, keeping at most the high-water
//! mark queued there so an interrupt never has much to throw away, and
//! reports when playback starts, drains and completes an utterance.

use crate::audio_utils::{FrameAssembler, OutboundAudioFrame, decode_pcm16};
use crate::config::AudioOptions;
use crate::device::{AudioError, AudioInput, AudioOutput, CaptureSender};
use crate::playback::{BlockReason, PlaybackBuffer, PushOutcome};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackSignal {
    /// The device started rendering after being silent.
    Started,
    /// Nothing is left anywhere: buffer empty and device idle.
    Drained,
    /// The given utterance has been fully played (or cut short).
    Completed(u64),
}

pub struct AudioPipeline {
    buffer: PlaybackBuffer,
    output: Box<dyn AudioOutput>,
    input: Box<dyn AudioInput>,
    assembler: FrameAssembler,
    high_water: usize,
    playing: bool,
}

impl AudioPipeline {
    pub fn new(
        options: &AudioOptions,
        output: Box<dyn AudioOutput>,
        input: Box<dyn AudioInput>,
    ) -> Self {
        Self {
            buffer: PlaybackBuffer::new(options.playback_capacity_samples()),
            output,
            input,
            assembler: FrameAssembler::new(options.frame_samples()),
            high_water: options.high_water_samples().max(1),
            playing: false,
        }
    }

    /// Frames buffered but not yet handed to the device.
    pub fn buffered_frames(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn is_blocked(&self) -> bool {
        self.buffer.is_blocked()
    }

    pub fn block_reason(&self) -> Option<BlockReason> {
        self.buffer.block_reason()
    }

    /// Any audio that has not been heard yet, buffered or on the device.
    pub fn has_outstanding(&self) -> bool {
        !self.buffer.is_empty() || self.output.pending_samples() > 0
    }

    /// Whether the current utterance is still unheard in part: synthesis not
    /// finished, or audio left in the buffer or on the device. A momentary
    /// underrun mid-utterance does not count as finished.
    pub fn utterance_pending(&self) -> bool {
        self.buffer.completion_pending() || self.has_outstanding()
    }

    /// Whether [`pump`](Self::pump) has anything to do.
    pub fn needs_pump(&self) -> bool {
        self.playing || !self.buffer.is_empty() || self.buffer.completion_pending()
    }

    /// Accepts one binary frame of synthesized PCM16 audio.
    pub fn receive(&mut self, pcm: &[u8]) -> PushOutcome {
        self.buffer.push(decode_pcm16(pcm))
    }

    pub fn begin_utterance(&mut self) -> u64 {
        self.buffer.begin_utterance()
    }

    pub fn mark_synthesis_complete(&mut self) {
        self.buffer.mark_synthesis_complete();
    }

    /// Stops playback now: clears the buffer and the device, and blocks new frames.
    pub fn interrupt(&mut self, reason: BlockReason) -> usize {
        let discarded = self.buffer.interrupt(reason);
        self.output.clear();
        info!(discarded, ?reason, "Playback interrupted");
        discarded
    }

    pub fn allow(&mut self) {
        self.buffer.allow();
    }

    pub fn pump(&mut self) -> Vec<PlaybackSignal> {
        let mut signals = Vec::new();

        while self.output.pending_samples() < self.high_water {
            let Some(chunk) = self.buffer.pop() else {
                break;
            };
            let accepted = self.output.write(&chunk.samples);
            if accepted < chunk.samples.len() {
                debug!(
                    accepted,
                    offered = chunk.samples.len(),
                    "Output device refused part of a frame"
                );
            }
            if !self.playing {
                self.playing = true;
                signals.push(PlaybackSignal::Started);
            }
        }

        let device_idle = self.output.pending_samples() == 0;
        if self.playing && self.buffer.is_empty() && device_idle {
            self.playing = false;
            signals.push(PlaybackSignal::Drained);
        }
        if let Some(utterance) = self.buffer.take_completion(device_idle) {
            signals.push(PlaybackSignal::Completed(utterance));
        }
        signals
    }

    pub fn is_capturing(&self) -> bool {
        self.input.is_running()
    }

    pub fn start_capture(&mut self, samples: CaptureSender) -> Result<(), AudioError> {
        if self.input.is_running() {
            return Ok(());
        }
        self.input.start(samples)?;
        info!("Capture started");
        Ok(())
    }

    pub fn stop_capture(&mut self) {
        if self.input.is_running() {
            self.input.stop();
            info!("Capture stopped");
        }
        self.assembler.clear();
    }

    /// Cuts captured samples into fixed-size outbound frames.
    pub fn frame_capture(&mut self, samples: &[i16]) -> Vec<OutboundAudioFrame> {
        self.assembler.push(samples)
    }

    /// Discards all audio in both directions. Used on session teardown.
    pub fn flush(&mut self) {
        self.stop_capture();
        self.buffer.reset();
        self.output.clear();
        self.playing = false;
    }
}
