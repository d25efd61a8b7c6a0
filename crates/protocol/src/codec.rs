//! Decodes raw frames into typed events and encodes outbound messages.
//!
//! This is the only place that looks at raw payload shapes. Everything
//! downstream consumes [`InboundEvent`].

use crate::{ClientMessage, ServerMessage, WireFrame};
use bytes::Bytes;

/// A failure to turn a frame into a typed event. The offending frame is dropped.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("message has no `type` field")]
    MissingType,
    #[error("unknown message type `{0}`")]
    UnknownType(String),
    #[error("could not encode {kind}: {reason}")]
    Encode { kind: &'static str, reason: String },
}

impl ProtocolError {
    /// A short machine-readable code for error events.
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::Malformed(_) => "malformed",
            ProtocolError::MissingType => "missing_type",
            ProtocolError::UnknownType(_) => "unknown_type",
            ProtocolError::Encode { .. } => "encode",
        }
    }
}

/// A typed inbound event.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Message(ServerMessage),
    /// A binary frame of synthesized PCM16 audio.
    Audio(Bytes),
}

/// Decodes one inbound frame.
pub fn decode(frame: WireFrame) -> Result<InboundEvent, ProtocolError> {
    match frame {
        WireFrame::Binary(data) => Ok(InboundEvent::Audio(data)),
        WireFrame::Text(text) => decode_text(&text).map(InboundEvent::Message),
    }
}

fn decode_text(text: &str) -> Result<ServerMessage, ProtocolError> {
    match serde_json::from_str::<ServerMessage>(text) {
        Ok(msg) => Ok(msg),
        Err(err) => {
            // Tell an unknown type apart from a known type with a bad shape.
            let value: serde_json::Value = serde_json::from_str(text)
                .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
            match value.get("type").and_then(|t| t.as_str()) {
                None => Err(ProtocolError::MissingType),
                Some(kind) if err.to_string().contains("unknown variant") => {
                    Err(ProtocolError::UnknownType(kind.to_string()))
                }
                Some(_) => Err(ProtocolError::Malformed(err.to_string())),
            }
        }
    }
}

/// Encodes one outbound message as a text frame.
pub fn encode(msg: &ClientMessage) -> Result<WireFrame, ProtocolError> {
    serde_json::to_string(msg)
        .map(WireFrame::Text)
        .map_err(|e| ProtocolError::Encode {
            kind: msg.kind(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::TranscriptResult;

    fn text(s: &str) -> WireFrame {
        WireFrame::Text(s.to_string())
    }

    #[test]
    fn test_decode_binary_is_audio() {
        let event = decode(WireFrame::Binary(Bytes::from_static(&[1, 0, 2, 0]))).unwrap();
        assert_eq!(event, InboundEvent::Audio(Bytes::from_static(&[1, 0, 2, 0])));
    }

    #[test]
    fn test_decode_handshake_and_unit_messages() {
        assert_eq!(
            decode(text(r#"{"type":"SettingsApplied"}"#)).unwrap(),
            InboundEvent::Message(ServerMessage::SettingsApplied)
        );
        // Unknown extra fields on unit messages are tolerated.
        assert_eq!(
            decode(text(r#"{"type":"AgentAudioDone","extra":1}"#)).unwrap(),
            InboundEvent::Message(ServerMessage::AgentAudioDone)
        );
    }

    #[test]
    fn test_decode_utterance_end_and_function_call() {
        let event = decode(text(
            r#"{"type":"UtteranceEnd","channel":[0,1],"last_word_end":2.4}"#,
        ))
        .unwrap();
        assert_eq!(
            event,
            InboundEvent::Message(ServerMessage::UtteranceEnd {
                channel: vec![0, 1],
                last_word_end: 2.4
            })
        );

        let event = decode(text(
            r#"{"type":"FunctionCallRequest","id":"fc_1","name":"get_weather","arguments":"{\"city\":\"Oslo\"}"}"#,
        ))
        .unwrap();
        match event {
            InboundEvent::Message(ServerMessage::FunctionCallRequest { id, name, arguments }) => {
                assert_eq!(id, "fc_1");
                assert_eq!(name, "get_weather");
                assert_eq!(arguments, r#"{"city":"Oslo"}"#);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_decode_transcript_result() {
        let event = decode(text(
            r#"{"type":"Results","is_final":true,"speech_final":true,"start":0.0,"duration":1.2,
                "channel":{"alternatives":[{"transcript":"hello there","confidence":0.98,
                "words":[{"word":"hello","start":0.1,"end":0.4},{"word":"there","start":0.5,"end":0.9}]}]}}"#,
        ))
        .unwrap();
        let InboundEvent::Message(ServerMessage::Results(result)) = event else {
            panic!("expected Results");
        };
        let result: TranscriptResult = result;
        assert_eq!(result.transcript(), "hello there");
        assert!(result.speech_final);
        assert_eq!(result.last_word_end(), Some(0.9));
    }

    #[test]
    fn test_decode_errors_are_typed() {
        assert!(matches!(
            decode(text("not json")),
            Err(ProtocolError::Malformed(_))
        ));
        assert_eq!(
            decode(text(r#"{"content":"x"}"#)),
            Err(ProtocolError::MissingType)
        );
        assert_eq!(
            decode(text(r#"{"type":"AgentDancing"}"#)),
            Err(ProtocolError::UnknownType("AgentDancing".into()))
        );
        // Known type, wrong shape.
        assert!(matches!(
            decode(text(r#"{"type":"UtteranceEnd","channel":"zero"}"#)),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_encode_produces_text_frame() {
        let frame = encode(&ClientMessage::InjectUserMessage {
            content: "hi".into(),
        })
        .unwrap();
        assert_eq!(
            frame,
            WireFrame::Text(r#"{"type":"InjectUserMessage","content":"hi"}"#.into())
        );
    }
}
