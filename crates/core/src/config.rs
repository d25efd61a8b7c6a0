//! Engine configuration: connection target, per-channel service options,
//! idle-timeout policy and the tunables of every component.

use crate::connection::ReconnectPolicy;
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;
use voice_protocol::client::{AgentSettings, Provider};

/// A custom error type for configuration loading and validation failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
    #[error("No connection target configured: set either a direct API key or a gateway URL")]
    MissingTarget,
    #[error("Contradictory configuration: {0}")]
    Contradictory(String),
    #[error("Invalid option {0}: {1}")]
    InvalidOption(&'static str, String),
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        match self {
            ConfigError::MissingVar(_) => "missing_var",
            ConfigError::InvalidValue(..) => "invalid_value",
            ConfigError::MissingTarget => "missing_target",
            ConfigError::Contradictory(_) => "contradictory",
            ConfigError::InvalidOption(..) => "invalid_option",
        }
    }
}

pub const DEFAULT_AGENT_URL: &str = "wss://agent.deepgram.com/v1/agent/converse";
pub const DEFAULT_LISTEN_URL: &str = "wss://api.deepgram.com/v1/listen";

/// Where connections are opened. Exactly one mode must be configured.
#[derive(Clone, Debug)]
pub enum ConnectionTarget {
    /// Talk to the service directly with a long-lived credential.
    Direct {
        api_key: SecretString,
        agent_url: String,
        listen_url: String,
    },
    /// Talk to a wire-compatible gateway, which holds the credential.
    Gateway {
        base_url: String,
        auth_token: Option<SecretString>,
    },
}

impl ConnectionTarget {
    pub fn direct(api_key: impl Into<String>) -> Self {
        ConnectionTarget::Direct {
            api_key: SecretString::from(api_key.into()),
            agent_url: DEFAULT_AGENT_URL.to_string(),
            listen_url: DEFAULT_LISTEN_URL.to_string(),
        }
    }

    pub fn gateway(base_url: impl Into<String>, auth_token: Option<String>) -> Self {
        ConnectionTarget::Gateway {
            base_url: base_url.into(),
            auth_token: auth_token.map(SecretString::from),
        }
    }

    /// Base URL for the agent channel.
    pub fn agent_url(&self) -> String {
        match self {
            ConnectionTarget::Direct { agent_url, .. } => agent_url.clone(),
            ConnectionTarget::Gateway { base_url, .. } => {
                format!("{}/agent", base_url.trim_end_matches('/'))
            }
        }
    }

    /// Base URL for the transcription channel, without query parameters.
    pub fn listen_url(&self) -> String {
        match self {
            ConnectionTarget::Direct { listen_url, .. } => listen_url.clone(),
            ConnectionTarget::Gateway { base_url, .. } => {
                format!("{}/listen", base_url.trim_end_matches('/'))
            }
        }
    }

    /// The `Authorization` header value, if any.
    pub fn authorization(&self) -> Option<String> {
        match self {
            ConnectionTarget::Direct { api_key, .. } => {
                Some(format!("Token {}", api_key.expose_secret()))
            }
            ConnectionTarget::Gateway { auth_token, .. } => auth_token
                .as_ref()
                .map(|t| format!("Bearer {}", t.expose_secret())),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self {
            ConnectionTarget::Direct { api_key, .. } if api_key.expose_secret().trim().is_empty() => {
                Err(ConfigError::InvalidOption("api_key", "must not be empty".into()))
            }
            ConnectionTarget::Gateway { base_url, .. } if base_url.trim().is_empty() => {
                Err(ConfigError::InvalidOption("gateway_url", "must not be empty".into()))
            }
            _ => Ok(()),
        }
    }
}

/// Options for the transcription channel, sent as URL query parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct TranscriptionOptions {
    pub model: String,
    pub language: String,
    pub smart_format: bool,
    pub punctuate: bool,
    pub interim_results: bool,
    /// Gap in word timings that ends an utterance.
    pub utterance_end_ms: u32,
    pub vad_events: bool,
    /// Silence before the endpointer marks `speech_final`.
    pub endpointing_ms: u32,
}

impl Default for TranscriptionOptions {
    fn default() -> Self {
        Self {
            model: "nova-3".to_string(),
            language: "en-US".to_string(),
            smart_format: true,
            punctuate: true,
            interim_results: true,
            utterance_end_ms: 1000,
            vad_events: true,
            endpointing_ms: 300,
        }
    }
}

impl TranscriptionOptions {
    /// Renders the options as a query string for a stream sampled at `sample_rate`.
    pub fn query(&self, sample_rate: u32) -> String {
        format!(
            "model={}&language={}&smart_format={}&punctuate={}&interim_results={}&utterance_end_ms={}&vad_events={}&endpointing={}&encoding=linear16&sample_rate={}&channels=1",
            self.model,
            self.language,
            self.smart_format,
            self.punctuate,
            self.interim_results,
            self.utterance_end_ms,
            self.vad_events,
            self.endpointing_ms,
            sample_rate,
        )
    }
}

/// The inactivity policy.
#[derive(Clone, Debug, PartialEq)]
pub struct IdleTimeoutOptions {
    pub enabled: bool,
    /// Put the agent to sleep on expiry instead of closing the session.
    pub auto_sleep: bool,
    pub timeout: Duration,
    /// Phrases that wake a sleeping agent when heard in a user transcript.
    pub wake_words: Vec<String>,
}

impl Default for IdleTimeoutOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_sleep: true,
            timeout: Duration::from_secs(30),
            wake_words: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AudioOptions {
    /// Capture rate, negotiated in the handshake.
    pub input_sample_rate: u32,
    /// Synthesized audio rate, negotiated in the handshake.
    pub output_sample_rate: u32,
    /// Duration of one outbound capture frame.
    pub frame_duration: Duration,
    /// Upper bound of buffered, unplayed synthesized audio.
    pub playback_buffer: Duration,
    /// How far ahead of the device the pipeline writes.
    pub playback_high_water: Duration,
    /// Outbound audio frames held while a connection awaits confirmation.
    pub unconfirmed_audio_frames: usize,
}

impl Default for AudioOptions {
    fn default() -> Self {
        Self {
            input_sample_rate: 16_000,
            output_sample_rate: 24_000,
            frame_duration: Duration::from_millis(20),
            playback_buffer: Duration::from_secs(30),
            playback_high_water: Duration::from_millis(200),
            unconfirmed_audio_frames: 250,
        }
    }
}

impl AudioOptions {
    /// Samples in one fixed-size capture frame.
    pub fn frame_samples(&self) -> usize {
        (self.input_sample_rate as u128 * self.frame_duration.as_millis() / 1000) as usize
    }

    /// Capacity of the playback buffer in output samples.
    pub fn playback_capacity_samples(&self) -> usize {
        (self.output_sample_rate as u128 * self.playback_buffer.as_millis() / 1000) as usize
    }

    pub fn high_water_samples(&self) -> usize {
        (self.output_sample_rate as u128 * self.playback_high_water.as_millis() / 1000) as usize
    }
}

/// Everything a session needs, threaded through construction.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub target: Option<ConnectionTarget>,
    /// The agent handshake payload. Its audio formats are kept in step with `audio`.
    pub agent: AgentSettings,
    pub transcription: TranscriptionOptions,
    pub idle: IdleTimeoutOptions,
    pub audio: AudioOptions,
    pub reconnect: ReconnectPolicy,
    /// Teardown requested by the host is delayed by this window and cancelled on re-attach.
    pub reentry_grace: Duration,
    pub keepalive_interval: Duration,
    /// How long an explicit speech-end waits for an authoritative utterance-end.
    pub utterance_end_fallback: Duration,
    /// Contradictory voice-activity signals closer than this are reported.
    pub vad_conflict_window: Duration,
    /// Attempts to re-create a vanished agent connection for one injected message.
    pub inject_retry_limit: u32,
    /// Log every wire payload at debug level.
    pub debug: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            target: None,
            agent: AgentSettings::default(),
            transcription: TranscriptionOptions::default(),
            idle: IdleTimeoutOptions::default(),
            audio: AudioOptions::default(),
            reconnect: ReconnectPolicy::default(),
            reentry_grace: Duration::from_millis(100),
            keepalive_interval: Duration::from_secs(8),
            utterance_end_fallback: Duration::from_millis(1000),
            vad_conflict_window: Duration::from_millis(1000),
            inject_retry_limit: 3,
            debug: false,
        }
    }
}

impl EngineConfig {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let mut config = EngineConfig::default();

        let api_key = non_empty_var("VOICE_API_KEY");
        let gateway_url = non_empty_var("VOICE_GATEWAY_URL");
        config.target = match (api_key, gateway_url) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::Contradictory(
                    "VOICE_API_KEY and VOICE_GATEWAY_URL are mutually exclusive".to_string(),
                ));
            }
            (Some(key), None) => Some(ConnectionTarget::Direct {
                api_key: SecretString::from(key),
                agent_url: non_empty_var("VOICE_AGENT_URL")
                    .unwrap_or_else(|| DEFAULT_AGENT_URL.to_string()),
                listen_url: non_empty_var("VOICE_LISTEN_URL")
                    .unwrap_or_else(|| DEFAULT_LISTEN_URL.to_string()),
            }),
            (None, Some(url)) => Some(ConnectionTarget::gateway(
                url,
                non_empty_var("VOICE_GATEWAY_TOKEN"),
            )),
            (None, None) => return Err(ConfigError::MissingTarget),
        };

        let agent = &mut config.agent.agent;
        if let Some(prompt) = non_empty_var("VOICE_AGENT_PROMPT") {
            agent.think.prompt = prompt;
        }
        if let Some(model) = non_empty_var("VOICE_THINK_MODEL") {
            let kind = non_empty_var("VOICE_THINK_PROVIDER")
                .unwrap_or_else(|| agent.think.provider.kind.clone());
            agent.think.provider = Provider::new(kind, model);
        }
        if let Some(model) = non_empty_var("VOICE_SPEAK_MODEL") {
            agent.speak.provider.model = model;
        }
        if let Some(model) = non_empty_var("VOICE_LISTEN_MODEL") {
            agent.listen.provider.model = model.clone();
            config.transcription.model = model;
        }
        if let Some(language) = non_empty_var("VOICE_LANGUAGE") {
            agent.language = language.clone();
            config.transcription.language = language;
        }
        agent.greeting = non_empty_var("VOICE_GREETING");

        if let Some(secs) = non_empty_var("VOICE_IDLE_TIMEOUT_SECS") {
            let secs = secs.parse::<u64>().map_err(|e| {
                ConfigError::InvalidValue("VOICE_IDLE_TIMEOUT_SECS".to_string(), e.to_string())
            })?;
            config.idle.enabled = secs > 0;
            if secs > 0 {
                config.idle.timeout = Duration::from_secs(secs);
            }
        }
        if let Some(flag) = non_empty_var("VOICE_AUTO_SLEEP") {
            config.idle.auto_sleep = parse_bool("VOICE_AUTO_SLEEP", &flag)?;
        }
        if let Some(words) = non_empty_var("VOICE_WAKE_WORDS") {
            config.idle.wake_words = words
                .split(',')
                .map(str::trim)
                .filter(|w| !w.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(flag) = non_empty_var("VOICE_DEBUG") {
            config.debug = parse_bool("VOICE_DEBUG", &flag)?;
        }

        Ok(config)
    }

    pub fn with_target(mut self, target: ConnectionTarget) -> Self {
        self.target = Some(target);
        self
    }

    /// Checks that the configuration can drive a session. Called by `start()`
    /// before any connection is opened.
    pub fn validate(&self) -> Result<&ConnectionTarget, ConfigError> {
        let target = self.target.as_ref().ok_or(ConfigError::MissingTarget)?;
        target.validate()?;

        if self.audio.input_sample_rate == 0 || self.audio.output_sample_rate == 0 {
            return Err(ConfigError::InvalidOption(
                "sample_rate",
                "must be greater than zero".into(),
            ));
        }
        if self.audio.frame_samples() == 0 {
            return Err(ConfigError::InvalidOption(
                "frame_duration",
                "yields an empty capture frame".into(),
            ));
        }
        if self.idle.enabled && self.idle.timeout.is_zero() {
            return Err(ConfigError::InvalidOption(
                "idle.timeout",
                "must be non-zero when the idle timer is enabled".into(),
            ));
        }
        let handshake_audio = &self.agent.audio;
        if handshake_audio.input.sample_rate != self.audio.input_sample_rate
            || handshake_audio.output.sample_rate != self.audio.output_sample_rate
        {
            return Err(ConfigError::Contradictory(format!(
                "handshake negotiates {}/{} Hz but the audio pipeline runs at {}/{} Hz",
                handshake_audio.input.sample_rate,
                handshake_audio.output.sample_rate,
                self.audio.input_sample_rate,
                self.audio.output_sample_rate,
            )));
        }
        Ok(target)
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue(
            name.to_string(),
            format!("'{}' is not a boolean", other),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    const VARS: &[&str] = &[
        "VOICE_API_KEY",
        "VOICE_AGENT_URL",
        "VOICE_LISTEN_URL",
        "VOICE_GATEWAY_URL",
        "VOICE_GATEWAY_TOKEN",
        "VOICE_AGENT_PROMPT",
        "VOICE_THINK_PROVIDER",
        "VOICE_THINK_MODEL",
        "VOICE_SPEAK_MODEL",
        "VOICE_LISTEN_MODEL",
        "VOICE_LANGUAGE",
        "VOICE_GREETING",
        "VOICE_IDLE_TIMEOUT_SECS",
        "VOICE_AUTO_SLEEP",
        "VOICE_WAKE_WORDS",
        "VOICE_DEBUG",
    ];

    fn clear_env_vars() {
        for var in VARS {
            unsafe { env::remove_var(var) };
        }
    }

    #[test]
    fn test_config_error_display() {
        let missing_var = ConfigError::MissingVar("TEST_VAR".to_string());
        assert_eq!(
            format!("{}", missing_var),
            "Missing environment variable: TEST_VAR"
        );

        let invalid_value =
            ConfigError::InvalidValue("TEST_VAR".to_string(), "bad_value".to_string());
        assert_eq!(
            format!("{}", invalid_value),
            "Invalid value for environment variable TEST_VAR: bad_value"
        );
    }

    #[test]
    #[serial]
    fn test_config_from_env_direct_minimal() {
        clear_env_vars();
        unsafe { env::set_var("VOICE_API_KEY", "test-key") };

        let config = EngineConfig::from_env().expect("Config should load successfully");

        let target = config.validate().expect("direct target is valid");
        assert_eq!(target.agent_url(), DEFAULT_AGENT_URL);
        assert_eq!(target.listen_url(), DEFAULT_LISTEN_URL);
        assert_eq!(target.authorization().as_deref(), Some("Token test-key"));
        assert!(config.idle.enabled);
        assert_eq!(config.idle.timeout, Duration::from_secs(30));
        assert!(!config.debug);
    }

    #[test]
    #[serial]
    fn test_config_from_env_gateway_with_options() {
        clear_env_vars();
        unsafe {
            env::set_var("VOICE_GATEWAY_URL", "wss://gateway.local/v1/");
            env::set_var("VOICE_GATEWAY_TOKEN", "short-lived");
            env::set_var("VOICE_AGENT_PROMPT", "Be terse.");
            env::set_var("VOICE_IDLE_TIMEOUT_SECS", "0");
            env::set_var("VOICE_WAKE_WORDS", "hey robot, wake up ,");
            env::set_var("VOICE_LANGUAGE", "de");
            env::set_var("VOICE_DEBUG", "yes");
        }

        let config = EngineConfig::from_env().expect("Config should load successfully");
        let target = config.validate().expect("gateway target is valid");

        assert_eq!(target.agent_url(), "wss://gateway.local/v1/agent");
        assert_eq!(target.listen_url(), "wss://gateway.local/v1/listen");
        assert_eq!(target.authorization().as_deref(), Some("Bearer short-lived"));
        assert_eq!(config.agent.instructions(), "Be terse.");
        assert!(!config.idle.enabled);
        assert_eq!(config.idle.wake_words, vec!["hey robot", "wake up"]);
        assert_eq!(config.agent.agent.language, "de");
        assert_eq!(config.transcription.language, "de");
        assert!(config.debug);
    }

    #[test]
    #[serial]
    fn test_config_rejects_both_targets() {
        clear_env_vars();
        unsafe {
            env::set_var("VOICE_API_KEY", "test-key");
            env::set_var("VOICE_GATEWAY_URL", "wss://gateway.local");
        }

        let err = EngineConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Contradictory(_)));
    }

    #[test]
    #[serial]
    fn test_config_requires_a_target() {
        clear_env_vars();
        assert_eq!(
            EngineConfig::from_env().unwrap_err(),
            ConfigError::MissingTarget
        );
    }

    #[test]
    #[serial]
    fn test_config_invalid_timeout() {
        clear_env_vars();
        unsafe {
            env::set_var("VOICE_API_KEY", "test-key");
            env::set_var("VOICE_IDLE_TIMEOUT_SECS", "soon");
        }

        match EngineConfig::from_env().unwrap_err() {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "VOICE_IDLE_TIMEOUT_SECS"),
            other => panic!("Expected InvalidValue, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_rules() {
        assert_eq!(
            EngineConfig::default().validate().unwrap_err(),
            ConfigError::MissingTarget
        );

        let empty_key = EngineConfig::default().with_target(ConnectionTarget::direct("  "));
        assert!(matches!(
            empty_key.validate().unwrap_err(),
            ConfigError::InvalidOption("api_key", _)
        ));

        let mut zero_timeout =
            EngineConfig::default().with_target(ConnectionTarget::gateway("wss://gw", None));
        zero_timeout.idle.timeout = Duration::ZERO;
        assert!(matches!(
            zero_timeout.validate().unwrap_err(),
            ConfigError::InvalidOption("idle.timeout", _)
        ));

        let mut mismatched =
            EngineConfig::default().with_target(ConnectionTarget::gateway("wss://gw", None));
        mismatched.audio.output_sample_rate = 16_000;
        assert!(matches!(
            mismatched.validate().unwrap_err(),
            ConfigError::Contradictory(_)
        ));
    }

    #[test]
    fn test_gateway_without_token_has_no_authorization() {
        let target = ConnectionTarget::gateway("wss://gw", None);
        assert_eq!(target.authorization(), None);
    }

    #[test]
    fn test_transcription_query_and_frame_sizes() {
        let options = TranscriptionOptions::default();
        let query = options.query(16_000);
        assert!(query.starts_with("model=nova-3&language=en-US"));
        assert!(query.contains("utterance_end_ms=1000"));
        assert!(query.contains("vad_events=true"));
        assert!(query.ends_with("sample_rate=16000&channels=1"));

        let audio = AudioOptions::default();
        assert_eq!(audio.frame_samples(), 320);
        assert_eq!(audio.playback_capacity_samples(), 720_000);
        assert_eq!(audio.high_water_samples(), 4_800);
    }
}
