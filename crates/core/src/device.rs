//! Audio device seams.
//!
//! The engine never talks to a sound card directly. Capture and playback go
//! through these two traits so hosts can plug in native devices, a browser
//! bridge, or nothing at all for text-only sessions.

use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AudioError {
    #[error("No input device available")]
    NoInputDevice,
    #[error("No output device available")]
    NoOutputDevice,
    #[error("Unsupported device configuration: {0}")]
    UnsupportedConfig(String),
    #[error("Audio stream error: {0}")]
    Stream(String),
    #[error("Resampler error: {0}")]
    Resampler(String),
}

/// Receives mono PCM16 samples at the negotiated input rate, in any chunk size.
pub type CaptureSender = mpsc::UnboundedSender<Vec<i16>>;

/// A playback device fed with mono PCM16 at the negotiated output rate.
#[cfg_attr(test, mockall::automock)]
pub trait AudioOutput: Send {
    /// Samples handed to the device that it has not rendered yet.
    fn pending_samples(&self) -> usize;

    /// Queues samples for rendering. Returns how many were accepted.
    fn write(&mut self, samples: &[i16]) -> usize;

    /// Drops everything queued on the device immediately.
    fn clear(&mut self);
}

#[cfg_attr(test, mockall::automock)]
pub trait AudioInput: Send {
    fn start(&mut self, samples: CaptureSender) -> Result<(), AudioError>;

    fn stop(&mut self);

    fn is_running(&self) -> bool;
}

/// Renders instantly into the void.
#[derive(Debug, Default)]
pub struct NullOutput;

impl AudioOutput for NullOutput {
    fn pending_samples(&self) -> usize {
        0
    }

    fn write(&mut self, samples: &[i16]) -> usize {
        samples.len()
    }

    fn clear(&mut self) {}
}

/// A microphone that never produces anything.
#[derive(Debug, Default)]
pub struct NullInput {
    running: bool,
}

impl AudioInput for NullInput {
    fn start(&mut self, _samples: CaptureSender) -> Result<(), AudioError> {
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.running = false;
    }

    fn is_running(&self) -> bool {
        self.running
    }
}
