//! # EMO Voice - Turn-Taking Voice Session Engine
//!
//! Listens, routes, asks a language model for a reply, and speaks it, while the user
//! can barge in on playback at any moment. Personas (EMO, EMUSINIO) switch by a spoken
//! keyword prefix.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                  VoiceSessionController                      │
//! │  ┌────────────┐  ┌────────────┐  ┌────────────┐             │
//! │  │ Transcriber│→ │ TurnRouter │→ │ Generator  │             │
//! │  │  (listen)  │  │ quit/persona│ │  (Gemini)  │             │
//! │  └────────────┘  └────────────┘  └────────────┘             │
//! │         ↑                               ↓                    │
//! │  ┌────────────┐   InterruptToken  ┌────────────┐  ┌───────┐ │
//! │  │  BargeIn   │──────────────────→│  Playback  │→ │Notify │ │
//! │  │  Monitor   │                   │(Synthesizer)│ │ (MQTT)│ │
//! │  └────────────┘                   └────────────┘  └───────┘ │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod backends;
pub mod barge_in;
pub mod config;
pub mod controller;
pub mod error;
pub mod generation;
pub mod interrupt;
pub mod notify;
pub mod persona;
pub mod playback;
pub mod routing;
pub mod status;
pub mod stt;
pub mod voice_output;

pub use backends::{BackendFactory, DefaultBackends};
pub use barge_in::{BargeInEvent, BargeInMonitor, BargeInSettings, BargeInWorker};
pub use config::{
    EmoConfig, GenerationConfig, LanguageConfig, NotifyConfig, SessionConfig, SynthesizerKind,
    VoiceConfig, DEFAULT_CONFIG_PATH,
};
pub use controller::VoiceSessionController;
pub use error::{
    GenerationError, NotifyError, RecognitionError, SynthesisError, VoiceError, VoiceResult,
};
pub use generation::{GeminiGenerator, ResponseGenerator};
pub use interrupt::InterruptToken;
pub use notify::{MqttSink, NotifySink};
pub use persona::{build_prompt, instruction_for, Persona, PersonaContext, PersonaStyle, QUIT_SENTINEL};
pub use playback::{PlaybackOutcome, SpeechPlayback};
pub use routing::{Route, RoutedTurn, TurnRouter};
pub use status::{SessionErrorKind, SessionState, StatusEvent};
pub use stt::{ChannelTranscriber, ListenRequest, Transcriber, Utterance, UtteranceFeed, UtteranceOrigin};
pub use voice_output::{
    build_synthesizer, strip_emoji, CommandSynthesizer, PlaceholderSynthesizer, RemoteSynthesizer,
    SpeechParams, Synthesizer,
};
