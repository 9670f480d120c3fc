//! Voice session controller - the turn-taking state machine
//!
//! One controller owns one session: a dedicated thread running
//! listen → route → generate → speak, with barge-in re-entry from playback.
//!
//! Threads of one session:
//! - `emo-session`: the cycle (this module)
//! - `emo-playback`: synthesis of the current reply (`playback`)
//! - `emo-barge-in`: capture during playback (`barge_in`)
//!
//! A session thread is tagged with a generation number. After `stop()` (or a newer
//! `start()`), a thread still blocked in a remote call is abandoned: when it returns it
//! finds its generation stale and exits without touching shared state.

use crate::backends::BackendFactory;
use crate::barge_in::{BargeInEvent, BargeInMonitor, BargeInSettings};
use crate::config::EmoConfig;
use crate::error::{GenerationError, VoiceError, VoiceResult};
use crate::generation::ResponseGenerator;
use crate::interrupt::InterruptToken;
use crate::notify::NotifySink;
use crate::persona::{build_prompt, Persona, PersonaContext, QUIT_SENTINEL};
use crate::playback::{PlaybackOutcome, SpeechPlayback};
use crate::routing::{Route, TurnRouter};
use crate::status::{SessionErrorKind, SessionState, StatusEvent};
use crate::stt::{ListenRequest, Transcriber, Utterance};
use crate::voice_output::{SpeechParams, Synthesizer};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

/// Capacity of the status broadcast. Slow subscribers skip old states.
const STATUS_CAPACITY: usize = 64;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn read<T: Clone>(l: &RwLock<T>) -> T {
    match l.read() {
        Ok(g) => g.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

fn replace<T>(l: &RwLock<T>, value: T) -> T {
    match l.write() {
        Ok(mut g) => std::mem::replace(&mut *g, value),
        Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), value),
    }
}

/// State shared between the controller handle and its session thread.
struct Shared {
    running: AtomicBool,
    generation: AtomicU64,
    speaking: Arc<AtomicBool>,
    token: InterruptToken,
    state: Mutex<SessionState>,
    last_error: Mutex<Option<SessionErrorKind>>,
    persona: PersonaContext,
    config: RwLock<Arc<EmoConfig>>,
    router: RwLock<Arc<TurnRouter>>,
    generator: RwLock<Option<Arc<dyn ResponseGenerator>>>,
    notify: RwLock<Option<Arc<dyn NotifySink>>>,
    transcriber: Arc<dyn Transcriber>,
    synthesizer: Arc<dyn Synthesizer>,
    factory: Arc<dyn BackendFactory>,
    status_tx: broadcast::Sender<StatusEvent>,
}

impl Shared {
    fn is_current(&self, generation: u64) -> bool {
        self.running.load(Ordering::SeqCst) && self.generation.load(Ordering::SeqCst) == generation
    }

    /// Record and publish a state. Errors are always published; other states only on change.
    fn set_state(&self, next: SessionState) {
        let mut state = lock(&self.state);
        self.write_state(&mut state, next);
    }

    /// Like `set_state`, but only while `generation` is the live session.
    fn set_state_for(&self, generation: u64, next: SessionState) -> bool {
        let mut state = lock(&self.state);
        if !self.is_current(generation) {
            return false;
        }
        self.write_state(&mut state, next);
        true
    }

    fn write_state(&self, state: &mut SessionState, next: SessionState) {
        if *state == next && !next.is_error() {
            return;
        }
        *state = next;
        if let SessionState::Error(kind) = next {
            *lock(&self.last_error) = Some(kind);
        }
        if next.is_published() {
            // No subscribers is fine.
            let _ = self.status_tx.send(StatusEvent::now(next));
        }
    }

    fn fail(&self, generation: u64, kind: SessionErrorKind) {
        self.set_state_for(generation, SessionState::Error(kind));
    }

    fn config(&self) -> Arc<EmoConfig> {
        read(&self.config)
    }

    fn router(&self) -> Arc<TurnRouter> {
        read(&self.router)
    }

    fn generator(&self) -> Option<Arc<dyn ResponseGenerator>> {
        read(&self.generator)
    }

    fn notify(&self) -> Option<Arc<dyn NotifySink>> {
        read(&self.notify)
    }

    fn speech_params(&self, cfg: &EmoConfig, persona: &Persona) -> SpeechParams {
        SpeechParams {
            rate: cfg.voice.rate,
            volume: cfg.voice.clamped_volume(),
            voice: cfg.voice.voice_for(persona),
        }
    }

    /// Sleep up to `duration`, waking early when the session is no longer current.
    fn pause(&self, generation: u64, duration: Duration) {
        let deadline = Instant::now() + duration;
        let step = self.config().session.poll_interval();
        while self.is_current(generation) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(step.min(deadline - now));
        }
    }
}

/// What the loop does after one cycle.
enum CycleOutcome {
    Continue,
    /// Unexpected failure: back off before the next cycle.
    Backoff,
    /// The session ended itself (quit phrase or `QUIT` reply).
    End,
}

/// Drives one voice session: start/stop, persona, config hot-swap, status stream.
pub struct VoiceSessionController {
    shared: Arc<Shared>,
    session: Mutex<Option<thread::JoinHandle<()>>>,
}

impl VoiceSessionController {
    /// Build a controller. Generation and notify backends come from `factory`.
    ///
    /// A missing generation credential is not an error: the controller starts in
    /// `Error(GenerationUnavailable)` and keeps listening.
    pub fn new(
        cfg: EmoConfig,
        transcriber: Arc<dyn Transcriber>,
        synthesizer: Arc<dyn Synthesizer>,
        factory: Arc<dyn BackendFactory>,
    ) -> VoiceResult<Self> {
        cfg.validate()?;
        let generator = factory.generator(&cfg)?;
        let notify = factory.notify_sink(&cfg);
        let (status_tx, _) = broadcast::channel(STATUS_CAPACITY);

        let shared = Arc::new(Shared {
            running: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            speaking: Arc::new(AtomicBool::new(false)),
            token: InterruptToken::new(),
            state: Mutex::new(SessionState::Idle),
            last_error: Mutex::new(None),
            persona: PersonaContext::new(cfg.session.persona.clone()),
            router: RwLock::new(Arc::new(TurnRouter::from_config(&cfg.language))),
            config: RwLock::new(Arc::new(cfg)),
            generator: RwLock::new(generator),
            notify: RwLock::new(notify),
            transcriber,
            synthesizer,
            factory,
            status_tx,
        });

        if shared.generator().is_none() {
            warn!("Generation API key missing; replies are disabled until one is configured");
            shared.set_state(SessionState::Error(SessionErrorKind::GenerationUnavailable));
        }
        info!(persona = %shared.persona.current(), "🎭 Voice session controller ready");

        Ok(Self {
            shared,
            session: Mutex::new(None),
        })
    }

    /// Begin the turn-taking cycle on its own thread. No-op while already running.
    pub fn start(&self) -> VoiceResult<()> {
        let mut slot = lock(&self.session);
        if self.shared.running.swap(true, Ordering::SeqCst) {
            debug!("start() ignored: session already running");
            return Ok(());
        }
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;

        if self.shared.generator().is_none() {
            self.shared
                .set_state(SessionState::Error(SessionErrorKind::GenerationUnavailable));
        }
        self.shared.set_state(SessionState::Listening);

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("emo-session".into())
            .spawn(move || run_session(shared, generation))
            .map_err(|e| {
                self.shared.running.store(false, Ordering::SeqCst);
                self.shared.set_state(SessionState::Idle);
                VoiceError::Thread(format!("session: {}", e))
            })?;
        // An abandoned thread from an earlier session exits on its own.
        *slot = Some(handle);
        info!("🚀 Voice session started");
        Ok(())
    }

    /// Stop the session, speak the farewell, and settle in `Idle`.
    ///
    /// In-flight playback is cut short. The session thread is joined for at most
    /// `session.stop_timeout_ms`; a thread still blocked in a remote call is abandoned.
    /// Safe to call when nothing is running.
    pub fn stop(&self) {
        let handle = lock(&self.session).take();
        let was_running = self.shared.running.swap(false, Ordering::SeqCst);
        self.shared.token.raise();
        let cfg = self.shared.config();

        if let Some(handle) = handle {
            let deadline = Instant::now() + cfg.session.stop_timeout();
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                if handle.join().is_err() {
                    error!("Session thread panicked");
                }
            } else {
                warn!("Session thread busy in a remote call; abandoned");
            }
        }

        let persona = self.shared.persona.current();
        let params = self.shared.speech_params(&cfg, &persona);
        if let Err(e) = self.shared.synthesizer.speak(&cfg.voice.farewell, &params) {
            warn!("Farewell failed: {}", e);
        }

        self.shared.set_state(SessionState::Idle);
        if was_running {
            info!("👋 Voice session stopped");
        }
    }

    /// Switch persona. Takes effect from the next generation request.
    pub fn set_persona(&self, name: &str) -> Persona {
        let persona = Persona::parse(name);
        self.shared.persona.set(persona.clone());
        info!(persona = %persona, "Persona set");
        persona
    }

    /// Hot-swap configuration. Rebuilds the generator and reconnects the notify sink,
    /// closing the previous connection first.
    pub fn update_config(&self, cfg: EmoConfig) -> VoiceResult<()> {
        cfg.validate()?;
        let generator = self.shared.factory.generator(&cfg)?;

        if let Some(old) = replace(&self.shared.notify, None) {
            old.close();
        }
        let notify = self.shared.factory.notify_sink(&cfg);
        let has_generator = generator.is_some();

        replace(&self.shared.notify, notify);
        replace(&self.shared.generator, generator);
        replace(
            &self.shared.router,
            Arc::new(TurnRouter::from_config(&cfg.language)),
        );
        replace(&self.shared.config, Arc::new(cfg));

        if has_generator {
            info!("Configuration updated");
        } else {
            warn!("Configuration updated without a generation API key");
            self.shared
                .set_state(SessionState::Error(SessionErrorKind::GenerationUnavailable));
        }
        Ok(())
    }

    /// Subscribe to status changes from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.shared.status_tx.subscribe()
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.shared.state)
    }

    pub fn persona(&self) -> Persona {
        self.shared.persona.current()
    }

    pub fn last_error(&self) -> Option<SessionErrorKind> {
        *lock(&self.shared.last_error)
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn is_speaking(&self) -> bool {
        self.shared.speaking.load(Ordering::SeqCst)
    }

    /// Cut the current reply short without ending the session.
    pub fn interrupt(&self) {
        if self.is_speaking() {
            info!("⚡ Interrupt requested");
            self.shared.token.raise();
        }
    }
}

impl Drop for VoiceSessionController {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.token.raise();
        if let Some(old) = replace(&self.shared.notify, None) {
            old.close();
        }
    }
}

fn run_session(shared: Arc<Shared>, generation: u64) {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut pending: Option<Utterance> = None;

    while shared.is_current(generation) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            run_cycle(&shared, generation, &events_tx, &mut events_rx, &mut pending)
        }));
        match outcome {
            Ok(CycleOutcome::Continue) => {}
            Ok(CycleOutcome::Backoff) => {
                shared.pause(generation, shared.config().session.error_backoff());
            }
            Ok(CycleOutcome::End) => {
                let mut state = lock(&shared.state);
                if shared.is_current(generation) {
                    shared.running.store(false, Ordering::SeqCst);
                    shared.write_state(&mut state, SessionState::Idle);
                    info!("Session ended by the conversation");
                }
                break;
            }
            Err(_) => {
                error!("Unexpected failure in voice cycle");
                shared.fail(generation, SessionErrorKind::Unexpected);
                shared.speaking.store(false, Ordering::SeqCst);
                shared.pause(generation, shared.config().session.error_backoff());
            }
        }
    }
    debug!(generation, "Session thread exited");
}

fn run_cycle(
    shared: &Arc<Shared>,
    generation: u64,
    events_tx: &mpsc::UnboundedSender<BargeInEvent>,
    events_rx: &mut mpsc::UnboundedReceiver<BargeInEvent>,
    pending: &mut Option<Utterance>,
) -> CycleOutcome {
    let cfg = shared.config();

    let text = match pending.take() {
        Some(utterance) => {
            debug!(text = %utterance.text, origin = ?utterance.origin, "Routing held utterance");
            utterance.text
        }
        None => {
            if !shared.set_state_for(generation, SessionState::Listening) {
                return CycleOutcome::Continue;
            }
            let request = ListenRequest {
                timeout: cfg.session.listen_timeout(),
                phrase_limit: cfg.session.phrase_limit(),
                language: cfg.language.recognition.clone(),
            };
            match shared.transcriber.listen(&request) {
                Ok(Some(text)) => text,
                Ok(None) => return CycleOutcome::Continue,
                Err(e) if e.is_expected() => {
                    debug!("Listen: {}", e);
                    return CycleOutcome::Continue;
                }
                Err(e) => {
                    warn!("Speech recognition failed: {}", e);
                    shared.fail(generation, SessionErrorKind::RecognitionServiceFailure);
                    return CycleOutcome::Backoff;
                }
            }
        }
    };
    if !shared.set_state_for(generation, SessionState::Routing) {
        return CycleOutcome::Continue;
    }
    info!("👂 Heard: {}", text);

    let router = shared.router();
    let routed = router.route(&text);
    if let Some(persona) = routed.persona {
        info!(persona = %persona, "Switched persona");
        shared.persona.set(persona);
    }
    let user_text = match routed.route {
        Route::Quit => return CycleOutcome::End,
        Route::Skip => return CycleOutcome::Continue,
        Route::Respond(text) => text,
    };

    let Some(generator) = shared.generator() else {
        warn!("Cannot answer: {}", GenerationError::MissingCredential);
        shared.fail(generation, SessionErrorKind::GenerationUnavailable);
        return CycleOutcome::Continue;
    };
    let persona = shared.persona.current();
    let prompt = build_prompt(&persona, cfg.language.reply_language.as_deref(), &user_text);
    if !shared.set_state_for(generation, SessionState::Generating) {
        return CycleOutcome::Continue;
    }
    let reply = match generator.generate(&prompt) {
        Ok(reply) => reply,
        Err(e) => {
            warn!("Generation failed: {}", e);
            shared.fail(generation, SessionErrorKind::GenerationFailure);
            return CycleOutcome::Continue;
        }
    };
    if !shared.is_current(generation) {
        debug!("Reply arrived after stop; dropped");
        return CycleOutcome::Continue;
    }
    if reply.trim() == QUIT_SENTINEL {
        info!("Generator ended the conversation");
        return CycleOutcome::End;
    }

    if !shared.set_state_for(generation, SessionState::Speaking) {
        return CycleOutcome::Continue;
    }
    info!(persona = %persona, "🗣️ {}", reply);
    // Events left over from an earlier reply must not leak into this one.
    while events_rx.try_recv().is_ok() {}

    let monitor = BargeInMonitor::new(
        Arc::clone(&shared.transcriber),
        router,
        BargeInSettings {
            attempt_timeout: cfg.session.barge_in_attempt(),
            phrase_limit: cfg.session.barge_in_phrase_limit(),
            language: cfg.language.recognition.clone(),
        },
        events_tx.clone(),
    );
    let playback = SpeechPlayback::new(
        Arc::clone(&shared.synthesizer),
        shared.token.clone(),
        Arc::clone(&shared.speaking),
        cfg.session.poll_interval(),
    )
    .with_cancel({
        let live = Arc::clone(shared);
        move || !live.is_current(generation)
    });
    let params = shared.speech_params(&cfg, &persona);
    let outcome = match playback.speak(&reply, &params, Some(&monitor)) {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("Playback could not start: {}", e);
            shared.fail(generation, SessionErrorKind::Unexpected);
            return CycleOutcome::Backoff;
        }
    };

    if let Some(sink) = shared.notify() {
        if let Err(e) = sink.publish(&cfg.notify.topic, &reply) {
            warn!("Notify failed: {}", e);
        }
    }

    match outcome {
        PlaybackOutcome::Interrupted => {
            shared.set_state_for(generation, SessionState::Interrupted);
        }
        PlaybackOutcome::Finished => {
            shared.pause(generation, cfg.session.post_reply_pause());
            shared.set_state_for(generation, SessionState::Listening);
        }
    }

    // A capture attempt still running holds the transcriber; whatever it hears is the next turn.
    let attempt = cfg.session.barge_in_attempt() + cfg.session.barge_in_phrase_limit();
    monitor.settle(attempt, || shared.is_current(generation));
    while let Ok(event) = events_rx.try_recv() {
        match event {
            BargeInEvent::StopPhrase(phrase) => debug!("Stopped by {:?}", phrase),
            BargeInEvent::Utterance(utterance) => *pending = Some(utterance),
        }
    }
    CycleOutcome::Continue
}
