//! Messages sent from the engine to an upstream service.

use serde::{Deserialize, Serialize};

/// Messages sent from the engine to the service.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// The configuration handshake. Must be the first message on an agent connection.
    Settings(AgentSettings),
    /// Replaces the agent's instructions on a live connection.
    UpdateInstructions { instructions: String },
    /// A user-authored turn injected as text.
    InjectUserMessage { content: String },
    /// An agent-authored turn the agent should speak verbatim.
    InjectAgentMessage { message: String },
    /// The host's answer to a `FunctionCallRequest`.
    FunctionCallResponse {
        id: String,
        name: String,
        content: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
    KeepAlive,
}

impl ClientMessage {
    /// The wire name of this message, used for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Settings(_) => "Settings",
            ClientMessage::UpdateInstructions { .. } => "UpdateInstructions",
            ClientMessage::InjectUserMessage { .. } => "InjectUserMessage",
            ClientMessage::InjectAgentMessage { .. } => "InjectAgentMessage",
            ClientMessage::FunctionCallResponse { .. } => "FunctionCallResponse",
            ClientMessage::KeepAlive => "KeepAlive",
        }
    }
}

/// Full agent configuration carried by the `Settings` handshake.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct AgentSettings {
    pub audio: AudioSettings,
    pub agent: AgentOptions,
}

impl AgentSettings {
    /// Structural equality that ignores the conversation context.
    ///
    /// The context grows with every turn, so including it would make every
    /// comparison against the last-applied settings report a change.
    pub fn same_ignoring_context(&self, other: &AgentSettings) -> bool {
        self.audio == other.audio && self.agent.without_context() == other.agent.without_context()
    }

    /// The instructions (system prompt) given to the think stage.
    pub fn instructions(&self) -> &str {
        &self.agent.think.prompt
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AudioSettings {
    pub input: AudioFormat,
    pub output: AudioFormat,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            input: AudioFormat::linear16(16_000),
            output: AudioFormat {
                container: Some("none".to_string()),
                ..AudioFormat::linear16(24_000)
            },
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AudioFormat {
    pub encoding: String,
    pub sample_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
}

impl AudioFormat {
    pub fn linear16(sample_rate: u32) -> Self {
        Self {
            encoding: "linear16".to_string(),
            sample_rate,
            container: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AgentOptions {
    pub language: String,
    pub listen: ListenOptions,
    pub think: ThinkOptions,
    pub speak: SpeakOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub greeting: Option<String>,
    /// Prior conversation turns replayed to the agent. Grows over a session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ConversationContext>,
}

impl AgentOptions {
    fn without_context(&self) -> AgentOptions {
        AgentOptions {
            context: None,
            ..self.clone()
        }
    }
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            language: "en".to_string(),
            listen: ListenOptions {
                provider: Provider::new("deepgram", "nova-3"),
            },
            think: ThinkOptions {
                provider: Provider::new("open_ai", "gpt-4o-mini"),
                prompt: "You are a helpful voice assistant. Keep answers short.".to_string(),
                functions: Vec::new(),
            },
            speak: SpeakOptions {
                provider: Provider::new("deepgram", "aura-2-thalia-en"),
            },
            greeting: None,
            context: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Provider {
    #[serde(rename = "type")]
    pub kind: String,
    pub model: String,
}

impl Provider {
    pub fn new(kind: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            model: model.into(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ListenOptions {
    pub provider: Provider,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ThinkOptions {
    pub provider: Provider,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub functions: Vec<FunctionDefinition>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SpeakOptions {
    pub provider: Provider,
}

/// A function the agent may ask the host to execute.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object.
    pub parameters: serde_json::Value,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct ConversationContext {
    pub messages: Vec<ContextMessage>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ContextMessage {
    pub role: String,
    pub content: String,
}
