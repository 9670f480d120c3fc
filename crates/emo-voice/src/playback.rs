//! Speech playback unit: one reply, spoken on its own thread, cut short by the interrupt token.
//!
//! Ordering per playback:
//! 1. clear the token, raise `speaking`
//! 2. start synthesis, then the barge-in worker
//! 3. poll the token every `poll_interval`; on raise, `stop_current` the synthesizer
//!    (repeated every poll during the grace window, so a stop that lands before the engine
//!    has started still takes effect)
//! 4. drop `speaking`, stop the barge-in worker
//! 5. read the token to tell `Finished` from `Interrupted`

use crate::barge_in::BargeInMonitor;
use crate::error::{SynthesisError, VoiceError, VoiceResult};
use crate::interrupt::InterruptToken;
use crate::voice_output::{SpeechParams, Synthesizer};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How a playback ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Finished,
    Interrupted,
}

type CancelCheck = Box<dyn Fn() -> bool + Send + Sync>;

/// Speaks replies through a `Synthesizer` while watching the interrupt token.
pub struct SpeechPlayback {
    synthesizer: Arc<dyn Synthesizer>,
    token: InterruptToken,
    speaking: Arc<AtomicBool>,
    poll_interval: Duration,
    /// How long to wait for the engine to wind down after `stop_current`.
    stop_grace: Duration,
    cancelled: Option<CancelCheck>,
}

/// Drops `speaking` on every exit path.
struct SpeakingFlag<'a>(&'a AtomicBool);

impl<'a> SpeakingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for SpeakingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SpeechPlayback {
    pub fn new(
        synthesizer: Arc<dyn Synthesizer>,
        token: InterruptToken,
        speaking: Arc<AtomicBool>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            synthesizer,
            token,
            speaking,
            poll_interval,
            stop_grace: Duration::from_millis(500),
            cancelled: None,
        }
    }

    /// Extra stop condition checked with the token, for stop requests that may race the clear.
    pub fn with_cancel(mut self, cancelled: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.cancelled = Some(Box::new(cancelled));
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    fn should_stop(&self) -> bool {
        self.token.is_raised() || self.cancelled.as_ref().map_or(false, |c| c())
    }

    /// Stop the synthesizer and wait up to `stop_grace` for the playback thread.
    fn wind_down(&self, done_rx: &mpsc::Receiver<Result<(), SynthesisError>>) {
        let deadline = Instant::now() + self.stop_grace;
        loop {
            self.synthesizer.stop_current();
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                debug!("Synthesis thread still winding down; detached");
                return;
            }
            match done_rx.recv_timeout(self.poll_interval.min(left)) {
                Ok(result) => return report(result),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    /// Speak `text`, blocking until it finishes or the token is raised.
    ///
    /// A synthesis failure is logged and reported as `Finished`. Errors are returned only when
    /// the playback thread cannot be started.
    pub fn speak(
        &self,
        text: &str,
        params: &SpeechParams,
        monitor: Option<&BargeInMonitor>,
    ) -> VoiceResult<PlaybackOutcome> {
        self.token.clear();
        let flag = SpeakingFlag::raise(&self.speaking);

        let (done_tx, done_rx) = mpsc::channel::<Result<(), SynthesisError>>();
        let synthesizer = Arc::clone(&self.synthesizer);
        let owned_text = text.to_string();
        let owned_params = params.clone();
        let token = self.token.clone();
        thread::Builder::new()
            .name("emo-playback".into())
            .spawn(move || {
                let result = if token.is_raised() {
                    Ok(())
                } else {
                    synthesizer.speak(&owned_text, &owned_params)
                };
                let _ = done_tx.send(result);
            })
            .map_err(|e| VoiceError::Thread(format!("playback: {}", e)))?;

        let worker = monitor.and_then(|m| match m.start(self.token.clone(), Arc::clone(&self.speaking)) {
            Ok(w) => Some(w),
            Err(e) => {
                warn!("Barge-in unavailable for this reply: {}", e);
                None
            }
        });

        loop {
            match done_rx.recv_timeout(self.poll_interval) {
                Ok(result) => {
                    report(result);
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.should_stop() {
                        self.token.raise();
                        info!("🛑 Stopping playback");
                        self.wind_down(&done_rx);
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("Synthesis thread ended without a result");
                    break;
                }
            }
        }

        drop(flag);
        if let Some(worker) = worker {
            worker.stop(self.poll_interval);
        }

        Ok(if self.token.is_raised() {
            PlaybackOutcome::Interrupted
        } else {
            PlaybackOutcome::Finished
        })
    }
}

fn report(result: Result<(), SynthesisError>) {
    if let Err(e) = result {
        warn!("Synthesis failed: {}; continuing as if spoken", e);
    }
}
