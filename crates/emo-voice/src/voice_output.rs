//! **Voice output**: the `Synthesizer` capability and its backends.
//!
//! Every backend acquires its engine once per `speak` call (child process or output stream)
//! and releases it on every exit path. `stop_current` may be called from any thread and
//! terminates the audio itself, not just the wait.

use crate::config::{SynthesizerKind, VoiceConfig};
use crate::error::{SynthesisError, VoiceError, VoiceResult};
use once_cell::sync::Lazy;
use regex::Regex;
use rodio::{OutputStream, Sink, Source};
use std::io::Cursor;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

static EMOJI: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        "[\u{1F1E6}-\u{1F1FF}\u{1F300}-\u{1F5FF}\u{1F600}-\u{1F64F}\u{1F680}-\u{1F6FF}\
         \u{1F700}-\u{1F77F}\u{1F780}-\u{1F7FF}\u{1F800}-\u{1F8FF}\u{1F900}-\u{1F9FF}\
         \u{1FA00}-\u{1FAFF}\u{2600}-\u{26FF}\u{2700}-\u{27BF}\u{FE0F}\u{200D}]",
    )
    .expect("emoji pattern is valid")
});

/// Remove emoji so speech engines don't read them out.
pub fn strip_emoji(text: &str) -> String {
    let stripped = EMOJI.replace_all(text, "");
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Voice parameters for one utterance.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechParams {
    /// Words per minute.
    pub rate: u32,
    /// 0.0 ..= 1.0
    pub volume: f32,
    /// Engine voice name, if the persona has one.
    pub voice: Option<String>,
}

impl Default for SpeechParams {
    fn default() -> Self {
        Self {
            rate: 180,
            volume: 1.0,
            voice: None,
        }
    }
}

/// Backend that speaks text aloud.
pub trait Synthesizer: Send + Sync {
    /// Speak `text`, blocking until playback finishes or `stop_current` is called.
    fn speak(&self, text: &str, params: &SpeechParams) -> Result<(), SynthesisError>;

    /// Terminate the playback in progress, if any. Safe to call from another thread.
    fn stop_current(&self);
}

fn lock_slot<T>(slot: &Mutex<T>) -> MutexGuard<'_, T> {
    match slot.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A running speech engine that can be cut off.
trait Engine {
    fn halt(self);
}

impl Engine for Child {
    fn halt(mut self) {
        let _ = self.kill();
        let _ = self.wait();
    }
}

impl Engine for Arc<Sink> {
    fn halt(self) {
        self.stop();
    }
}

struct SlotState<E> {
    next_ticket: u64,
    /// Tickets below this were stopped.
    stopped_below: u64,
    current: Option<(u64, E)>,
}

/// The engine of the utterance in progress, shared by `speak` and `stop_current`.
///
/// Each `speak` takes a ticket before it acquires an engine. `stop_current` stops every
/// ticket issued so far, so a stop that lands while the engine is still being fetched or
/// spawned is honored at registration. A call only ever releases its own engine.
struct EngineSlot<E> {
    state: Mutex<SlotState<E>>,
}

impl<E> EngineSlot<E> {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                next_ticket: 0,
                stopped_below: 0,
                current: None,
            }),
        }
    }

    fn ticket(&self) -> u64 {
        let mut state = lock_slot(&self.state);
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        ticket
    }

    fn is_stopped(&self, ticket: u64) -> bool {
        ticket < lock_slot(&self.state).stopped_below
    }

    /// Make `engine` the current one. Hands it back if `ticket` was stopped meanwhile.
    fn register(&self, ticket: u64, engine: E) -> Result<(), E> {
        let mut state = lock_slot(&self.state);
        if ticket < state.stopped_below {
            return Err(engine);
        }
        state.current = Some((ticket, engine));
        Ok(())
    }

    /// Run `f` on the engine registered under `ticket`; `None` once it is gone.
    fn with_engine<R>(&self, ticket: u64, f: impl FnOnce(&mut E) -> R) -> Option<R> {
        let mut state = lock_slot(&self.state);
        match state.current.as_mut() {
            Some((t, engine)) if *t == ticket => Some(f(engine)),
            _ => None,
        }
    }

    /// Take back the engine registered under `ticket`, if it is still there.
    fn release(&self, ticket: u64) -> Option<E> {
        let mut state = lock_slot(&self.state);
        if matches!(state.current, Some((t, _)) if t == ticket) {
            state.current.take().map(|(_, e)| e)
        } else {
            None
        }
    }

    /// Stop every ticket issued so far and hand out the registered engine.
    fn stop_all(&self) -> Option<E> {
        let mut state = lock_slot(&self.state);
        state.stopped_below = state.next_ticket;
        state.current.take().map(|(_, e)| e)
    }

    fn is_engaged(&self) -> bool {
        lock_slot(&self.state).current.is_some()
    }
}

/// Halts the engine of one `speak` call on every exit path, unless it was already taken.
struct EngineGuard<'a, E: Engine> {
    slot: &'a EngineSlot<E>,
    ticket: u64,
}

impl<E: Engine> Drop for EngineGuard<'_, E> {
    fn drop(&mut self) {
        if let Some(engine) = self.slot.release(self.ticket) {
            engine.halt();
        }
    }
}

/// Placeholder: logs the text and returns. Use headless or when no speech engine exists.
#[derive(Debug, Default)]
pub struct PlaceholderSynthesizer;

impl Synthesizer for PlaceholderSynthesizer {
    fn speak(&self, text: &str, _params: &SpeechParams) -> Result<(), SynthesisError> {
        info!("🔇 (silent) {}", text);
        Ok(())
    }

    fn stop_current(&self) {}
}

// -----------------------------------------------------------------------------
// Platform speech command
// -----------------------------------------------------------------------------

/// Speaks through the platform speech command: `say` on macOS, `espeak` elsewhere.
pub struct CommandSynthesizer {
    program: String,
    poll_interval: Duration,
    current: EngineSlot<Child>,
}

impl CommandSynthesizer {
    pub fn new(program: impl Into<String>, poll_interval: Duration) -> Self {
        Self {
            program: program.into(),
            poll_interval,
            current: EngineSlot::new(),
        }
    }

    pub fn for_current_platform(poll_interval: Duration) -> Self {
        let program = if cfg!(target_os = "macos") { "say" } else { "espeak" };
        Self::new(program, poll_interval)
    }

    /// Whether a speech process is running right now.
    pub fn is_playing(&self) -> bool {
        self.current.is_engaged()
    }

    fn command(&self, text: &str, params: &SpeechParams) -> Command {
        let mut cmd = Command::new(&self.program);
        let name = std::path::Path::new(&self.program)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        match name {
            "say" => {
                if let Some(voice) = &params.voice {
                    cmd.arg("-v").arg(voice);
                }
                cmd.arg("-r").arg(params.rate.to_string()).arg("--");
            }
            "espeak" | "espeak-ng" => {
                // espeak amplitude is 0..=200, 100 is normal.
                let amplitude = (params.volume.clamp(0.0, 1.0) * 100.0).round() as u32;
                cmd.arg("-s")
                    .arg(params.rate.to_string())
                    .arg("-a")
                    .arg(amplitude.to_string())
                    .arg("--");
            }
            _ => {}
        }
        cmd.arg(text).stdout(Stdio::null()).stderr(Stdio::null());
        cmd
    }
}

impl Synthesizer for CommandSynthesizer {
    fn speak(&self, text: &str, params: &SpeechParams) -> Result<(), SynthesisError> {
        let clean = strip_emoji(text);
        if clean.is_empty() {
            return Ok(());
        }
        let ticket = self.current.ticket();
        let child = self.command(&clean, params).spawn()?;
        if let Err(child) = self.current.register(ticket, child) {
            debug!("VoiceOutput: stopped before {} started speaking", self.program);
            child.halt();
            return Ok(());
        }
        let _guard = EngineGuard {
            slot: &self.current,
            ticket,
        };

        loop {
            let Some(exited) = self.current.with_engine(ticket, |child| child.try_wait()) else {
                // Taken by stop_current.
                return Ok(());
            };
            if let Some(status) = exited? {
                self.current.release(ticket);
                if !status.success() {
                    return Err(SynthesisError::Engine(format!(
                        "{} exited with {}",
                        self.program, status
                    )));
                }
                return Ok(());
            }
            std::thread::sleep(self.poll_interval);
        }
    }

    fn stop_current(&self) {
        if let Some(child) = self.current.stop_all() {
            child.halt();
            info!("VoiceOutput: {} stopped (interruption or manual)", self.program);
        }
    }
}

// -----------------------------------------------------------------------------
// Remote TTS + local playback
// -----------------------------------------------------------------------------

/// OpenAI-compatible TTS (`/audio/speech`) played through the default output device.
pub struct RemoteSynthesizer {
    /// Base URL without trailing slash (e.g. https://api.openai.com/v1).
    pub base_url: String,
    api_key: String,
    /// TTS model: tts-1 (fast) or tts-1-hd (higher quality).
    pub model: String,
    poll_interval: Duration,
    client: reqwest::blocking::Client,
    current: EngineSlot<Arc<Sink>>,
}

impl RemoteSynthesizer {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        poll_interval: Duration,
    ) -> VoiceResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| VoiceError::Tts(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            poll_interval,
            client,
            current: EngineSlot::new(),
        })
    }

    /// Whether audio is playing right now.
    pub fn is_playing(&self) -> bool {
        self.current.is_engaged()
    }

    fn synthesize(&self, text: &str, params: &SpeechParams) -> Result<Vec<u8>, SynthesisError> {
        let url = format!("{}/audio/speech", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
            "voice": params.voice.as_deref().unwrap_or("shimmer"),
            "speed": (params.rate as f32 / 180.0).clamp(0.25, 4.0),
        });
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .map_err(|e| SynthesisError::Engine(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().unwrap_or_default();
            return Err(SynthesisError::Engine(format!("TTS API error {}: {}", status, body)));
        }
        let bytes = res.bytes().map_err(|e| SynthesisError::Engine(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

impl Synthesizer for RemoteSynthesizer {
    fn speak(&self, text: &str, params: &SpeechParams) -> Result<(), SynthesisError> {
        let clean = strip_emoji(text);
        if clean.is_empty() {
            return Ok(());
        }
        let ticket = self.current.ticket();
        let bytes = self.synthesize(&clean, params)?;
        if bytes.is_empty() || self.current.is_stopped(ticket) {
            debug!("VoiceOutput: stopped before remote playback started");
            return Ok(());
        }

        // The output stream is !Send; it lives only for this playback.
        let (_stream, handle) =
            OutputStream::try_default().map_err(|e| SynthesisError::Engine(e.to_string()))?;
        let sink = Arc::new(Sink::try_new(&handle).map_err(|e| SynthesisError::Engine(e.to_string()))?);
        let source = rodio::Decoder::new(Cursor::new(bytes))
            .map_err(|e| SynthesisError::Engine(format!("Decode failed: {}", e)))?;
        sink.set_volume(params.volume.clamp(0.0, 1.0));
        sink.append(source.convert_samples::<f32>());

        if let Err(sink) = self.current.register(ticket, Arc::clone(&sink)) {
            sink.halt();
            return Ok(());
        }
        let _guard = EngineGuard {
            slot: &self.current,
            ticket,
        };

        while !sink.empty() {
            if self.current.with_engine(ticket, |_| ()).is_none() {
                break;
            }
            std::thread::sleep(self.poll_interval);
        }
        debug!("VoiceOutput: remote playback ended");
        Ok(())
    }

    fn stop_current(&self) {
        if let Some(sink) = self.current.stop_all() {
            sink.halt();
            info!("VoiceOutput: stopped (interruption or manual)");
        }
    }
}

/// Build the synthesizer selected in `voice.synthesizer`.
pub fn build_synthesizer(cfg: &VoiceConfig, poll_interval: Duration) -> VoiceResult<Arc<dyn Synthesizer>> {
    Ok(match cfg.synthesizer {
        SynthesizerKind::System => Arc::new(CommandSynthesizer::for_current_platform(poll_interval)),
        SynthesizerKind::Remote => {
            if cfg.tts_api_key.trim().is_empty() {
                warn!("voice.synthesizer = remote but voice.tts_api_key is empty; speech is silent");
                Arc::new(PlaceholderSynthesizer)
            } else {
                Arc::new(RemoteSynthesizer::new(
                    cfg.tts_base_url.clone(),
                    cfg.tts_api_key.trim(),
                    cfg.tts_model.clone(),
                    poll_interval,
                )?)
            }
        }
        SynthesizerKind::Silent => Arc::new(PlaceholderSynthesizer),
    })
}
