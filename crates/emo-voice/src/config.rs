//! Session configuration. Load from TOML and `EMO__*` environment overrides.

use crate::error::{VoiceError, VoiceResult};
use crate::persona::Persona;
use crate::routing::{DEFAULT_QUIT_PHRASES, DEFAULT_STOP_PHRASES};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Default config path when `EMO_CONFIG` is not set (extension resolved by the `config` crate).
pub const DEFAULT_CONFIG_PATH: &str = "config/emo";

/// Full configuration for one EMO Bridge session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmoConfig {
    pub generation: GenerationConfig,
    pub voice: VoiceConfig,
    pub notify: NotifyConfig,
    pub language: LanguageConfig,
    pub session: SessionConfig,
}

/// Response-generation service (Gemini).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// API key. Empty disables generation.
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "gemini-1.5-flash".to_string(),
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            timeout_secs: 30,
        }
    }
}

impl GenerationConfig {
    pub fn has_credential(&self) -> bool {
        !self.api_key.trim().is_empty()
    }
}

/// Which speech engine plays replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SynthesizerKind {
    /// Platform speech command (`say` / `espeak`).
    #[default]
    System,
    /// OpenAI-compatible TTS API played through the default output device.
    Remote,
    /// Log only; nothing is played.
    Silent,
}

/// Speech output parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// Words per minute.
    pub rate: u32,
    /// 0.0 ..= 1.0
    pub volume: f32,
    /// Spoken by `stop()`.
    pub farewell: String,
    pub synthesizer: SynthesizerKind,
    pub tts_base_url: String,
    pub tts_api_key: String,
    pub tts_model: String,
    /// Persona name (uppercase) -> engine voice name.
    pub persona_voices: HashMap<String, String>,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        let mut persona_voices = HashMap::new();
        persona_voices.insert("EMO".to_string(), "Catarina".to_string());
        persona_voices.insert("EMUSINIO".to_string(), "Joana".to_string());
        Self {
            rate: 180,
            volume: 1.0,
            farewell: "Goodbye!".to_string(),
            synthesizer: SynthesizerKind::System,
            tts_base_url: "https://api.openai.com/v1".to_string(),
            tts_api_key: String::new(),
            tts_model: "tts-1".to_string(),
            persona_voices,
        }
    }
}

impl VoiceConfig {
    pub fn voice_for(&self, persona: &Persona) -> Option<String> {
        self.persona_voices
            .get(&persona.as_str().to_uppercase())
            .cloned()
    }

    pub fn clamped_volume(&self) -> f32 {
        self.volume.clamp(0.0, 1.0)
    }
}

/// MQTT publish sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub enabled: bool,
    pub broker: String,
    pub port: u16,
    pub topic: String,
    pub client_id: String,
    pub keep_alive_secs: u64,
    /// How long to wait for the broker's CONNACK before giving up.
    pub connect_timeout_ms: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            broker: "localhost".to_string(),
            port: 1883,
            topic: "emo/bridge".to_string(),
            client_id: "emo-bridge".to_string(),
            keep_alive_secs: 60,
            connect_timeout_ms: 3000,
        }
    }
}

/// Locale-dependent behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LanguageConfig {
    /// Recognition language tag passed to the transcriber.
    pub recognition: String,
    /// When set, every reply is requested in this language (e.g. "Portuguese (Portugal)").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_language: Option<String>,
    pub quit_phrases: Vec<String>,
    pub stop_phrases: Vec<String>,
}

impl Default for LanguageConfig {
    fn default() -> Self {
        Self {
            recognition: "en-US".to_string(),
            reply_language: None,
            quit_phrases: DEFAULT_QUIT_PHRASES.iter().map(|s| s.to_string()).collect(),
            stop_phrases: DEFAULT_STOP_PHRASES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Timing of the turn-taking cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Initial persona.
    pub persona: Persona,
    /// Upper bound on one normal listen. `None` waits for speech indefinitely.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phrase_limit_ms: Option<u64>,
    /// Timeout of one barge-in capture attempt.
    pub barge_in_attempt_ms: u64,
    pub barge_in_phrase_limit_ms: u64,
    /// Interrupt polling granularity during playback.
    pub poll_interval_ms: u64,
    /// Bound on joining the session thread in `stop()`.
    pub stop_timeout_ms: u64,
    /// Pause after an unexpected cycle failure.
    pub error_backoff_ms: u64,
    /// Pause after a reply finished playing.
    pub post_reply_pause_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            persona: Persona::Emo,
            listen_timeout_ms: Some(5000),
            phrase_limit_ms: None,
            barge_in_attempt_ms: 800,
            barge_in_phrase_limit_ms: 1000,
            poll_interval_ms: 50,
            stop_timeout_ms: 1000,
            error_backoff_ms: 1000,
            post_reply_pause_ms: 500,
        }
    }
}

impl SessionConfig {
    pub fn listen_timeout(&self) -> Option<Duration> {
        self.listen_timeout_ms.map(Duration::from_millis)
    }

    pub fn phrase_limit(&self) -> Option<Duration> {
        self.phrase_limit_ms.map(Duration::from_millis)
    }

    pub fn barge_in_attempt(&self) -> Duration {
        Duration::from_millis(self.barge_in_attempt_ms)
    }

    pub fn barge_in_phrase_limit(&self) -> Duration {
        Duration::from_millis(self.barge_in_phrase_limit_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn post_reply_pause(&self) -> Duration {
        Duration::from_millis(self.post_reply_pause_ms)
    }
}

impl EmoConfig {
    /// Load config from file and environment. Precedence: env `EMO_CONFIG` path > `config/emo.toml` > defaults.
    pub fn load() -> VoiceResult<Self> {
        let path = std::env::var("EMO_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&path)
    }

    /// Load from `path` (missing file is fine) layered with `EMO__SECTION__KEY` env overrides.
    pub fn load_from(path: &str) -> VoiceResult<Self> {
        let built = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix("EMO")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;
        let cfg: EmoConfig = built.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Write the defaults to `path` if nothing is there yet. Returns whether a file was created.
    pub fn write_default(path: &Path) -> VoiceResult<bool> {
        if path.exists() {
            return Ok(false);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(&EmoConfig::default())
            .map_err(|e| VoiceError::Config(e.to_string()))?;
        std::fs::write(path, text)?;
        Ok(true)
    }

    pub fn validate(&self) -> VoiceResult<()> {
        let s = &self.session;
        if s.poll_interval_ms == 0 {
            return Err(VoiceError::Config("session.poll_interval_ms must be > 0".into()));
        }
        if s.barge_in_attempt_ms == 0 {
            return Err(VoiceError::Config("session.barge_in_attempt_ms must be > 0".into()));
        }
        if self.notify.enabled && self.notify.port == 0 {
            return Err(VoiceError::Config("notify.port must be > 0".into()));
        }
        if self.notify.enabled && self.notify.topic.trim().is_empty() {
            return Err(VoiceError::Config("notify.topic must not be empty".into()));
        }
        Ok(())
    }
}
