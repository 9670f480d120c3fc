//! Error types for the EMO voice engine

use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur while building or driving a voice session
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Generation error: {0}")]
    Generation(String),

    #[error("TTS error: {0}")]
    Tts(String),

    #[error("Notify error: {0}")]
    Notify(String),

    #[error("Thread error: {0}")]
    Thread(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for VoiceError {
    fn from(err: config::ConfigError) -> Self {
        VoiceError::Config(err.to_string())
    }
}

/// Failure of a single `Transcriber::listen` attempt.
///
/// `Timeout` and `Unintelligible` are expected during normal use and are retried silently.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecognitionError {
    #[error("no speech before timeout")]
    Timeout,

    #[error("speech could not be understood")]
    Unintelligible,

    #[error("recognition service failure: {0}")]
    Service(String),
}

impl RecognitionError {
    pub fn is_expected(&self) -> bool {
        matches!(self, RecognitionError::Timeout | RecognitionError::Unintelligible)
    }
}

/// Failure of a `ResponseGenerator::generate` call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GenerationError {
    #[error("network error: {0}")]
    Network(String),

    #[error("generation API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("generation API returned no text")]
    EmptyReply,

    #[error("no generation credential configured")]
    MissingCredential,
}

/// Failure while synthesizing or playing speech.
#[derive(Error, Debug)]
pub enum SynthesisError {
    #[error("speech engine error: {0}")]
    Engine(String),

    #[error("failed to launch speech engine: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Failure of the notify sink. Never surfaces to the status stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotifyError {
    #[error("notify connect failed: {0}")]
    Connect(String),

    #[error("notify publish failed: {0}")]
    Publish(String),
}

impl From<NotifyError> for VoiceError {
    fn from(err: NotifyError) -> Self {
        VoiceError::Notify(err.to_string())
    }
}

impl From<GenerationError> for VoiceError {
    fn from(err: GenerationError) -> Self {
        VoiceError::Generation(err.to_string())
    }
}
