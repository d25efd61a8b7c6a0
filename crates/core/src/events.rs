//! The event stream a session emits to its host.
//!
//! Hosts implement [`EventSink`] and adapt it to whatever idiom they prefer.
//! An unbounded tokio channel sender implements it out of the box.

use crate::connection::ConnectionState;
use crate::error::ErrorEvent;
use crate::function_call::PendingFunctionCall;
use crate::state::AgentState;
use crate::vad::{EndResolution, VadSignalKind, VadSource};
use serde::Serialize;
use tokio::sync::mpsc;
use voice_protocol::ServiceKind;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A channel confirmed its settings and is carrying traffic.
    Ready { channel: ServiceKind },
    ConnectionStateChanged {
        channel: ServiceKind,
        state: ConnectionState,
    },
    AgentStateChanged { from: AgentState, to: AgentState },
    /// Interim or final transcription of the user's speech.
    Transcript {
        text: String,
        is_final: bool,
        speech_final: bool,
    },
    /// A finalized agent turn.
    AgentUtterance { text: String },
    /// A finalized user turn.
    UserMessage { text: String },
    PlaybackStateChanged { playing: bool },
    UserStartedSpeaking { source: VadSource },
    UserStoppedSpeaking {
        source: VadSource,
        resolution: EndResolution,
    },
    UtteranceEnd {
        channel: Vec<u32>,
        last_word_end: f64,
    },
    /// Two sources disagreed about voice activity within the conflict window.
    VoiceActivityConflict {
        earlier: (VadSource, VadSignalKind),
        later: (VadSource, VadSignalKind),
    },
    FunctionCallRequest(PendingFunctionCall),
    IdleTimeout,
    Warning {
        channel: ServiceKind,
        message: String,
        code: Option<String>,
    },
    Error(ErrorEvent),
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: SessionEvent);
}

impl EventSink for mpsc::UnboundedSender<SessionEvent> {
    fn emit(&self, event: SessionEvent) {
        // A host that dropped its receiver has stopped listening; nothing to do.
        let _ = self.send(event);
    }
}

/// Forwards events to a closure.
pub struct FnSink<F>(pub F);

impl<F> EventSink for FnSink<F>
where
    F: Fn(SessionEvent) + Send + Sync,
{
    fn emit(&self, event: SessionEvent) {
        (self.0)(event)
    }
}

/// Discards every event.
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: SessionEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_channel_sink_forwards_and_tolerates_closed_receiver() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.emit(SessionEvent::IdleTimeout);
        assert_eq!(rx.try_recv().unwrap(), SessionEvent::IdleTimeout);

        drop(rx);
        tx.emit(SessionEvent::PlaybackStateChanged { playing: true });
    }

    #[test]
    fn test_fn_sink() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = seen.clone();
        let sink = FnSink(move |event| captured.lock().unwrap().push(event));
        sink.emit(SessionEvent::Ready {
            channel: ServiceKind::Agent,
        });
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_events_serialize_with_tag() {
        let json = serde_json::to_value(SessionEvent::AgentStateChanged {
            from: AgentState::Idle,
            to: AgentState::Listening,
        })
        .unwrap();
        assert_eq!(json["event"], "agent_state_changed");
        assert_eq!(json["to"], "listening");
    }
}
