//! Messages received from an upstream service.

use serde::Deserialize;

/// JSON messages sent by the service to the engine.
///
/// Binary synthesized audio does not appear here; the codec surfaces it as
/// [`crate::InboundEvent::Audio`].
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// The handshake was accepted; gated traffic may now flow.
    SettingsApplied,
    Welcome {
        #[serde(default)]
        request_id: Option<String>,
    },
    /// A finalized turn of the conversation, authored by `role`.
    ConversationText { role: String, content: String },
    UserStartedSpeaking,
    UserStoppedSpeaking,
    AgentThinking {
        #[serde(default)]
        content: Option<String>,
    },
    AgentStartedSpeaking {
        #[serde(default)]
        total_latency: Option<f64>,
        #[serde(default)]
        tts_latency: Option<f64>,
        #[serde(default)]
        ttt_latency: Option<f64>,
    },
    /// Synthesis for the current utterance finished. Playback may still be running.
    AgentAudioDone,
    /// Word-timing derived end of a user utterance.
    UtteranceEnd {
        channel: Vec<u32>,
        last_word_end: f64,
    },
    SpeechStarted {
        channel: Vec<u32>,
        timestamp: f64,
    },
    FunctionCallRequest {
        id: String,
        name: String,
        /// JSON-encoded arguments object.
        arguments: String,
    },
    Error {
        description: String,
        #[serde(default)]
        code: Option<String>,
    },
    Warning {
        description: String,
        #[serde(default)]
        code: Option<String>,
    },
    /// A transcription result from the transcription channel.
    Results(TranscriptResult),
    Metadata {
        #[serde(default)]
        request_id: Option<String>,
    },
}

impl ServerMessage {
    /// The wire name of this message, used for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::SettingsApplied => "SettingsApplied",
            ServerMessage::Welcome { .. } => "Welcome",
            ServerMessage::ConversationText { .. } => "ConversationText",
            ServerMessage::UserStartedSpeaking => "UserStartedSpeaking",
            ServerMessage::UserStoppedSpeaking => "UserStoppedSpeaking",
            ServerMessage::AgentThinking { .. } => "AgentThinking",
            ServerMessage::AgentStartedSpeaking { .. } => "AgentStartedSpeaking",
            ServerMessage::AgentAudioDone => "AgentAudioDone",
            ServerMessage::UtteranceEnd { .. } => "UtteranceEnd",
            ServerMessage::SpeechStarted { .. } => "SpeechStarted",
            ServerMessage::FunctionCallRequest { .. } => "FunctionCallRequest",
            ServerMessage::Error { .. } => "Error",
            ServerMessage::Warning { .. } => "Warning",
            ServerMessage::Results(_) => "Results",
            ServerMessage::Metadata { .. } => "Metadata",
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct TranscriptResult {
    pub channel: TranscriptChannel,
    #[serde(default)]
    pub is_final: bool,
    /// The endpointer decided the speaker finished this utterance.
    #[serde(default)]
    pub speech_final: bool,
    #[serde(default)]
    pub start: f64,
    #[serde(default)]
    pub duration: f64,
}

impl TranscriptResult {
    /// The top alternative's transcript, or an empty string.
    pub fn transcript(&self) -> &str {
        self.channel
            .alternatives
            .first()
            .map(|a| a.transcript.as_str())
            .unwrap_or("")
    }

    /// End time of the last recognized word, in seconds from stream start.
    pub fn last_word_end(&self) -> Option<f64> {
        self.channel
            .alternatives
            .first()
            .and_then(|a| a.words.last())
            .map(|w| w.end)
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct TranscriptChannel {
    pub alternatives: Vec<TranscriptAlternative>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct TranscriptAlternative {
    pub transcript: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub words: Vec<Word>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Word {
    pub word: String,
    pub start: f64,
    pub end: f64,
}
