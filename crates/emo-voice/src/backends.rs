//! Construction of the swappable backends (generator, notify sink) from configuration.
//!
//! The controller rebuilds both on `update_config`, so it holds a factory rather than the
//! concrete types.

use crate::config::EmoConfig;
use crate::error::VoiceResult;
use crate::generation::{GeminiGenerator, ResponseGenerator};
use crate::notify::{MqttSink, NotifySink};
use std::sync::Arc;
use tracing::warn;

/// Builds the config-dependent backends of a session.
pub trait BackendFactory: Send + Sync {
    /// `Ok(None)` when generation is disabled (no credential).
    fn generator(&self, cfg: &EmoConfig) -> VoiceResult<Option<Arc<dyn ResponseGenerator>>>;

    /// `None` when the sink is disabled or could not connect.
    fn notify_sink(&self, cfg: &EmoConfig) -> Option<Arc<dyn NotifySink>>;
}

/// Gemini generator + MQTT sink.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultBackends;

impl BackendFactory for DefaultBackends {
    fn generator(&self, cfg: &EmoConfig) -> VoiceResult<Option<Arc<dyn ResponseGenerator>>> {
        Ok(GeminiGenerator::from_config(&cfg.generation)?
            .map(|g| Arc::new(g) as Arc<dyn ResponseGenerator>))
    }

    fn notify_sink(&self, cfg: &EmoConfig) -> Option<Arc<dyn NotifySink>> {
        if !cfg.notify.enabled {
            return None;
        }
        match MqttSink::connect(&cfg.notify) {
            Ok(sink) => Some(Arc::new(sink)),
            Err(e) => {
                warn!("MQTT Error: {} - continuing without MQTT support", e);
                None
            }
        }
    }
}
