//! **Speech-to-Text**: the `Transcriber` capability and the `Utterance` it produces.
//!
//! The engine never captures audio itself. A `Transcriber` owns the microphone (or any other
//! source) and turns one bounded listen into text. `ChannelTranscriber` is a text-fed
//! implementation for consoles and tests.

use crate::error::RecognitionError;
use chrono::{DateTime, Utc};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Mutex;
use std::time::Duration;

/// Parameters for one listen attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenRequest {
    /// Give up if no speech starts within this time (`RecognitionError::Timeout`).
    pub timeout: Option<Duration>,
    /// Cut a phrase off after this long.
    pub phrase_limit: Option<Duration>,
    /// Recognition language tag (e.g. "pt-PT").
    pub language: String,
}

/// Backend that captures and transcribes one utterance.
pub trait Transcriber: Send + Sync {
    /// Listen once. `Ok(None)` means nothing confident was heard.
    fn listen(&self, request: &ListenRequest) -> Result<Option<String>, RecognitionError>;
}

/// How an utterance reached the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UtteranceOrigin {
    NormalListen,
    BargeIn,
}

/// One transcribed unit of user speech. Consumed exactly once by routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    pub text: String,
    pub origin: UtteranceOrigin,
    pub heard_at: DateTime<Utc>,
}

impl Utterance {
    pub fn heard(text: impl Into<String>) -> Self {
        Self::new(text, UtteranceOrigin::NormalListen)
    }

    pub fn barge_in(text: impl Into<String>) -> Self {
        Self::new(text, UtteranceOrigin::BargeIn)
    }

    fn new(text: impl Into<String>, origin: UtteranceOrigin) -> Self {
        Self {
            text: text.into(),
            origin,
            heard_at: Utc::now(),
        }
    }
}

/// Sending half of a `ChannelTranscriber`.
#[derive(Debug, Clone)]
pub struct UtteranceFeed {
    tx: Sender<String>,
}

impl UtteranceFeed {
    /// Queue one utterance. Returns false once the transcriber is gone.
    pub fn push(&self, text: impl Into<String>) -> bool {
        self.tx.send(text.into()).is_ok()
    }
}

/// Transcriber fed with ready-made text (stdin lines, scripted tests).
///
/// Listens from the normal cycle and from barge-in share one queue, so text pushed while a
/// reply is playing is picked up as a barge-in.
pub struct ChannelTranscriber {
    rx: Mutex<Receiver<String>>,
}

impl ChannelTranscriber {
    pub fn channel() -> (UtteranceFeed, ChannelTranscriber) {
        let (tx, rx) = mpsc::channel();
        (
            UtteranceFeed { tx },
            ChannelTranscriber { rx: Mutex::new(rx) },
        )
    }
}

impl Transcriber for ChannelTranscriber {
    fn listen(&self, request: &ListenRequest) -> Result<Option<String>, RecognitionError> {
        let rx = self
            .rx
            .lock()
            .map_err(|e| RecognitionError::Service(format!("feed lock poisoned: {}", e)))?;
        let text = match request.timeout {
            Some(timeout) => match rx.recv_timeout(timeout) {
                Ok(t) => t,
                Err(RecvTimeoutError::Timeout) => return Err(RecognitionError::Timeout),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(RecognitionError::Service("utterance feed closed".into()))
                }
            },
            None => rx
                .recv()
                .map_err(|_| RecognitionError::Service("utterance feed closed".into()))?,
        };
        let text = text.trim();
        Ok((!text.is_empty()).then(|| text.to_string()))
    }
}
