//! Realtime I/O for the voice session engine: WebSocket transports, per-channel
//! connection tasks and the session coordinator that ties them to the audio
//! pipeline.

pub mod connection;
#[cfg(feature = "native-audio")]
pub mod native_audio;
pub mod session;
pub mod transport;

pub use session::{
    AudioDevices, ConnectionSnapshot, Role, ServiceSelection, Session, SessionHandle,
    SessionSnapshot, UpdateOutcome,
};
pub use transport::{ConnectRequest, Connector, Transport, WsConnector};
