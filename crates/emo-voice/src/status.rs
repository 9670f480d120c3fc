//! Session states and the status notifications published to the presentation layer.

use chrono::{DateTime, Utc};
use std::fmt;

/// Why the session last reported `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionErrorKind {
    /// The transcription service failed (not a timeout or unintelligible speech).
    RecognitionServiceFailure,
    /// The generation service could not be reached or answered with an error.
    GenerationFailure,
    /// No generation credential is configured.
    GenerationUnavailable,
    /// Anything else that went wrong inside a cycle.
    Unexpected,
}

/// Turn-taking state of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Listening,
    /// Internal: deciding what an utterance means. Not published.
    Routing,
    Generating,
    Speaking,
    /// Playback was cut short by barge-in or an interrupt request.
    Interrupted,
    Error(SessionErrorKind),
}

impl SessionState {
    /// Whether a change into this state is published on the status stream.
    pub fn is_published(&self) -> bool {
        !matches!(self, SessionState::Routing)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, SessionState::Error(_))
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "Idle",
            SessionState::Listening => "Listening",
            SessionState::Routing => "Routing",
            SessionState::Generating => "Generating",
            SessionState::Speaking => "Speaking",
            SessionState::Interrupted => "Interrupted",
            SessionState::Error(SessionErrorKind::GenerationFailure) => {
                "Error: Network Connection lost"
            }
            SessionState::Error(_) => "Error",
        };
        f.write_str(s)
    }
}

/// One entry of the status stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub state: SessionState,
    pub timestamp: DateTime<Utc>,
}

impl StatusEvent {
    pub fn now(state: SessionState) -> Self {
        Self {
            state,
            timestamp: Utc::now(),
        }
    }
}
