//! Wire protocol shared by the voice session engine and its upstream services.
//!
//! Two logical channels speak the same framing: JSON text messages tagged by a
//! `"type"` field, plus raw binary PCM16 audio frames.
//!
//! - `client`: messages the engine sends upstream, including the `Settings` handshake.
//! - `server`: messages the upstream services send back.
//! - `codec`: turns raw frames into typed events and back.

pub mod client;
pub mod codec;
pub mod server;

pub use client::ClientMessage;
pub use codec::{InboundEvent, ProtocolError, decode, encode};
pub use server::ServerMessage;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The logical upstream channel a connection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    /// The conversational agent (listen, think, speak).
    Agent,
    /// Standalone speech-to-text with voice-activity events.
    Transcription,
}

impl ServiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Agent => "agent",
            ServiceKind::Transcription => "transcription",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single frame on a message stream, independent of the transport carrying it.
#[derive(Debug, Clone, PartialEq)]
pub enum WireFrame {
    Text(String),
    Binary(Bytes),
}

impl WireFrame {
    pub fn is_binary(&self) -> bool {
        matches!(self, WireFrame::Binary(_))
    }
}
