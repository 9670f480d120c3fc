//! **Barge-in monitor**: listens while a reply is playing and interrupts it on new speech.
//!
//! A supervised worker owned by the playback unit: started after the interrupt token is
//! cleared, closed before the token is read. Results go back over a channel.
//!
//! The worker acts on a transcription only while holding the `active` gate, and `stop`
//! closes that gate first. Once `stop` returns, the worker can no longer raise the token,
//! even if its thread is still finishing a capture attempt. Speech captured by such a late
//! attempt was meant for the next turn: it is handed back as a normal utterance, and the
//! controller calls `settle` before listening so the two never compete for the capture.

use crate::error::{VoiceError, VoiceResult};
use crate::interrupt::InterruptToken;
use crate::routing::TurnRouter;
use crate::stt::{ListenRequest, Transcriber, Utterance};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Pause after a failed attempt so a broken recognizer doesn't spin.
const FAILED_ATTEMPT_PAUSE: Duration = Duration::from_millis(50);

/// What the monitor heard during playback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BargeInEvent {
    /// A stop phrase: playback stops, nothing is forwarded.
    StopPhrase(String),
    /// Any other speech: playback stops and the utterance is routed next.
    ///
    /// Speech from an attempt that outlived its playback arrives here too, with
    /// `UtteranceOrigin::NormalListen` and without the token raised.
    Utterance(Utterance),
}

/// Capture settings for barge-in attempts.
#[derive(Debug, Clone)]
pub struct BargeInSettings {
    /// Timeout of one capture-and-transcribe attempt.
    pub attempt_timeout: Duration,
    pub phrase_limit: Duration,
    pub language: String,
}

impl Default for BargeInSettings {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_millis(800),
            phrase_limit: Duration::from_millis(1000),
            language: "en-US".to_string(),
        }
    }
}

/// Spawns barge-in workers for successive playbacks.
pub struct BargeInMonitor {
    transcriber: Arc<dyn Transcriber>,
    router: Arc<TurnRouter>,
    settings: BargeInSettings,
    events: mpsc::UnboundedSender<BargeInEvent>,
    /// Workers whose thread outlived `BargeInWorker::stop`.
    detached: Arc<Mutex<Vec<thread::JoinHandle<()>>>>,
}

impl BargeInMonitor {
    pub fn new(
        transcriber: Arc<dyn Transcriber>,
        router: Arc<TurnRouter>,
        settings: BargeInSettings,
        events: mpsc::UnboundedSender<BargeInEvent>,
    ) -> Self {
        Self {
            transcriber,
            router,
            settings,
            events,
            detached: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Wait up to `timeout` for detached workers to finish their capture attempt.
    ///
    /// Gives up early once `live` returns false. Returns true when none is left running.
    pub fn settle(&self, timeout: Duration, live: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let mut detached = lock(&self.detached);
            let (finished, running): (Vec<_>, Vec<_>) =
                detached.drain(..).partition(|h| h.is_finished());
            *detached = running;
            drop(detached);
            for handle in finished {
                let _ = handle.join();
            }
            if self.is_settled() {
                return true;
            }
            if !live() || Instant::now() >= deadline {
                debug!("Barge-in worker still capturing; listening anyway");
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn is_settled(&self) -> bool {
        lock(&self.detached).is_empty()
    }

    /// Start monitoring. The worker runs while `speaking` is true and its gate is open.
    pub fn start(&self, token: InterruptToken, speaking: Arc<AtomicBool>) -> VoiceResult<BargeInWorker> {
        let active = Arc::new(Mutex::new(true));
        let worker = Worker {
            transcriber: Arc::clone(&self.transcriber),
            router: Arc::clone(&self.router),
            request: ListenRequest {
                timeout: Some(self.settings.attempt_timeout),
                phrase_limit: Some(self.settings.phrase_limit),
                language: self.settings.language.clone(),
            },
            events: self.events.clone(),
            token,
            speaking,
            active: Arc::clone(&active),
        };
        let handle = thread::Builder::new()
            .name("emo-barge-in".into())
            .spawn(move || worker.run())
            .map_err(|e| VoiceError::Thread(format!("barge-in monitor: {}", e)))?;
        debug!("Barge-in monitor started");
        Ok(BargeInWorker {
            active,
            handle: Some(handle),
            detached: Arc::clone(&self.detached),
        })
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct Worker {
    transcriber: Arc<dyn Transcriber>,
    router: Arc<TurnRouter>,
    request: ListenRequest,
    events: mpsc::UnboundedSender<BargeInEvent>,
    token: InterruptToken,
    speaking: Arc<AtomicBool>,
    active: Arc<Mutex<bool>>,
}

impl Worker {
    fn should_run(&self) -> bool {
        self.speaking.load(Ordering::SeqCst) && *lock(&self.active)
    }

    fn run(self) {
        while self.should_run() {
            let text = match self.transcriber.listen(&self.request) {
                Ok(Some(text)) if !text.trim().is_empty() => text,
                Ok(_) => continue,
                Err(e) if e.is_expected() => {
                    trace!("barge-in attempt: {}", e);
                    continue;
                }
                Err(e) => {
                    debug!("barge-in attempt failed: {}", e);
                    thread::sleep(FAILED_ATTEMPT_PAUSE);
                    continue;
                }
            };

            // Late results after playback ended must not touch the token.
            let mut open = lock(&self.active);
            if !*open || !self.speaking.load(Ordering::SeqCst) {
                self.hand_back(text);
                break;
            }
            self.token.raise();
            let event = if self.router.is_stop(&text) {
                info!("⚡ Speech interrupted by user command: {:?}", text);
                BargeInEvent::StopPhrase(text)
            } else {
                info!("⚡ Barge-in: {:?}", text);
                BargeInEvent::Utterance(Utterance::barge_in(text))
            };
            if self.events.send(event).is_err() {
                warn!("Barge-in receiver dropped");
            }
            *open = false;
            break;
        }
        trace!("Barge-in monitor exited");
    }

    /// Pass on speech that arrived after playback ended. Stop phrases have nothing left to stop.
    fn hand_back(&self, text: String) {
        if self.router.is_stop(&text) {
            debug!("Stop phrase arrived after playback ended; dropped");
            return;
        }
        debug!("Barge-in result arrived after playback ended; handed back as a turn");
        if self.events.send(BargeInEvent::Utterance(Utterance::heard(text))).is_err() {
            warn!("Barge-in receiver dropped");
        }
    }
}

/// Handle to a running barge-in worker.
pub struct BargeInWorker {
    active: Arc<Mutex<bool>>,
    handle: Option<thread::JoinHandle<()>>,
    detached: Arc<Mutex<Vec<thread::JoinHandle<()>>>>,
}

impl BargeInWorker {
    /// Close the gate, then wait up to `join_timeout` for the thread to exit.
    ///
    /// After this returns the worker no longer raises the token, even if the join timed out.
    /// A worker still capturing is left to `BargeInMonitor::settle`.
    pub fn stop(mut self, join_timeout: Duration) {
        *lock(&self.active) = false;
        if let Some(handle) = self.handle.take() {
            let deadline = Instant::now() + join_timeout;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                debug!("Barge-in worker still in a capture attempt; detached");
                lock(&self.detached).push(handle);
            }
        }
    }
}

impl Drop for BargeInWorker {
    fn drop(&mut self) {
        *lock(&self.active) = false;
    }
}
