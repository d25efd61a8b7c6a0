//! Voice Session Engine core.
//!
//! Sans-IO building blocks for a realtime voice session: nothing in this crate
//! opens a socket, touches an audio device or reads the clock. Time is passed
//! in as `Instant`s so every policy can be tested deterministically; the
//! `voice-realtime` crate wires these pieces to real I/O.

pub mod audio_utils;
pub mod config;
pub mod connection;
pub mod device;
pub mod error;
pub mod events;
pub mod function_call;
pub mod idle;
pub mod pipeline;
pub mod playback;
pub mod state;
pub mod vad;
pub mod wake;

pub use config::{ConfigError, ConnectionTarget, EngineConfig};
pub use device::{AudioError, AudioInput, AudioOutput};
pub use error::{EngineError, ErrorEvent, ErrorKind};
pub use events::{EventSink, SessionEvent};
pub use pipeline::{AudioPipeline, PlaybackSignal};
pub use state::{AgentState, StateMachine};
pub use voice_protocol::ServiceKind;
