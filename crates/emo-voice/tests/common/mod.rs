//! Scripted fakes of the four capabilities for driving a controller in tests.

#![allow(dead_code)]

use emo_voice::{
    BackendFactory, EmoConfig, GenerationError, ListenRequest, NotifyError, NotifySink,
    RecognitionError, ResponseGenerator, SessionState, SpeechParams, StatusEvent, SynthesisError,
    Synthesizer, Transcriber, VoiceResult,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

pub fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Fast timings so sessions cycle quickly.
pub fn test_config() -> EmoConfig {
    let mut cfg = EmoConfig::default();
    cfg.generation.api_key = "test-key".into();
    cfg.session.listen_timeout_ms = Some(20);
    cfg.session.phrase_limit_ms = None;
    cfg.session.barge_in_attempt_ms = 10;
    cfg.session.barge_in_phrase_limit_ms = 100;
    cfg.session.poll_interval_ms = 5;
    cfg.session.stop_timeout_ms = 500;
    cfg.session.error_backoff_ms = 30;
    cfg.session.post_reply_pause_ms = 10;
    cfg
}

type Heard = Result<Option<String>, RecognitionError>;

/// Replays scripted results. Normal listens and barge-in attempts have separate scripts;
/// a request with a phrase limit is a barge-in attempt (`test_config` sets none for normal).
#[derive(Default)]
pub struct ScriptedTranscriber {
    normal: Mutex<VecDeque<Heard>>,
    barge_in: Mutex<VecDeque<Heard>>,
    pub normal_listens: AtomicUsize,
    pub barge_in_listens: AtomicUsize,
}

impl ScriptedTranscriber {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn say(&self, text: &str) {
        self.normal.lock().unwrap().push_back(Ok(Some(text.to_string())));
    }

    pub fn fail(&self, err: RecognitionError) {
        self.normal.lock().unwrap().push_back(Err(err));
    }

    pub fn barge_in(&self, text: &str) {
        self.barge_in.lock().unwrap().push_back(Ok(Some(text.to_string())));
    }
}

impl Transcriber for ScriptedTranscriber {
    fn listen(&self, request: &ListenRequest) -> Result<Option<String>, RecognitionError> {
        let (queue, counter) = if request.phrase_limit.is_some() {
            (&self.barge_in, &self.barge_in_listens)
        } else {
            (&self.normal, &self.normal_listens)
        };
        counter.fetch_add(1, Ordering::SeqCst);
        if let Some(next) = queue.lock().unwrap().pop_front() {
            return next;
        }
        thread::sleep(request.timeout.unwrap_or(Duration::from_millis(20)));
        Err(RecognitionError::Timeout)
    }
}

enum Reply {
    Text(String),
    Fail(GenerationError),
    Panic,
}

/// Replays scripted replies, records prompts. Answers "Okay." once the script runs out.
pub struct ScriptedGenerator {
    replies: Mutex<VecDeque<Reply>>,
    pub prompts: Mutex<Vec<String>>,
    delay: Duration,
}

impl ScriptedGenerator {
    pub fn new() -> Arc<Self> {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(VecDeque::new()),
            prompts: Mutex::new(Vec::new()),
            delay,
        })
    }

    pub fn reply(&self, text: &str) {
        self.replies.lock().unwrap().push_back(Reply::Text(text.to_string()));
    }

    pub fn fail(&self, err: GenerationError) {
        self.replies.lock().unwrap().push_back(Reply::Fail(err));
    }

    pub fn panic_next(&self) {
        self.replies.lock().unwrap().push_back(Reply::Panic);
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

impl ResponseGenerator for ScriptedGenerator {
    fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        thread::sleep(self.delay);
        let next = self.replies.lock().unwrap().pop_front();
        match next {
            Some(Reply::Text(text)) => Ok(text),
            Some(Reply::Fail(err)) => Err(err),
            Some(Reply::Panic) => panic!("generator blew up"),
            None => Ok("Okay.".to_string()),
        }
    }
}

/// "Plays" each utterance for `length` or until stopped. Records what was said.
pub struct RecordingSynth {
    length: Mutex<Duration>,
    stop_requested: AtomicBool,
    pub spoken: Mutex<Vec<String>>,
    pub params: Mutex<Vec<SpeechParams>>,
    pub stops: AtomicUsize,
    /// Time from `stop_current` to `speak` returning, per interrupted utterance.
    pub stop_latencies: Mutex<Vec<Duration>>,
    stopped_at: Mutex<Option<Instant>>,
    playing: AtomicBool,
}

impl RecordingSynth {
    pub fn new(length: Duration) -> Arc<Self> {
        Arc::new(Self {
            length: Mutex::new(length),
            stop_requested: AtomicBool::new(false),
            spoken: Mutex::new(Vec::new()),
            params: Mutex::new(Vec::new()),
            stops: AtomicUsize::new(0),
            stop_latencies: Mutex::new(Vec::new()),
            stopped_at: Mutex::new(None),
            playing: AtomicBool::new(false),
        })
    }

    /// Applies from the next `speak`.
    pub fn set_length(&self, length: Duration) {
        *self.length.lock().unwrap() = length;
    }

    pub fn spoken(&self) -> Vec<String> {
        self.spoken.lock().unwrap().clone()
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }
}

impl Synthesizer for RecordingSynth {
    fn speak(&self, text: &str, params: &SpeechParams) -> Result<(), SynthesisError> {
        self.stop_requested.store(false, Ordering::SeqCst);
        self.params.lock().unwrap().push(params.clone());
        self.spoken.lock().unwrap().push(text.to_string());
        self.playing.store(true, Ordering::SeqCst);
        let length = *self.length.lock().unwrap();
        let start = Instant::now();
        while start.elapsed() < length {
            if self.stop_requested.load(Ordering::SeqCst) {
                if let Some(at) = self.stopped_at.lock().unwrap().take() {
                    self.stop_latencies.lock().unwrap().push(at.elapsed());
                }
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        self.playing.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn stop_current(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        *self.stopped_at.lock().unwrap() = Some(Instant::now());
        self.stop_requested.store(true, Ordering::SeqCst);
    }
}

/// Records publications; optionally fails every publish.
#[derive(Default)]
pub struct RecordingSink {
    pub published: Mutex<Vec<(String, String)>>,
    pub closed: AtomicBool,
    pub failing: bool,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            failing: true,
            ..Default::default()
        })
    }

    pub fn published(&self) -> Vec<(String, String)> {
        self.published.lock().unwrap().clone()
    }
}

impl NotifySink for RecordingSink {
    fn publish(&self, topic: &str, message: &str) -> Result<(), NotifyError> {
        if self.failing {
            return Err(NotifyError::Publish("broker gone".into()));
        }
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), message.to_string()));
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Hands out the scripted generator when a credential is configured, and a fresh
/// recording sink per connect when notify is enabled.
pub struct FakeBackends {
    pub generator: Arc<ScriptedGenerator>,
    pub sinks: Mutex<Vec<Arc<RecordingSink>>>,
    failing_sink: bool,
}

impl FakeBackends {
    pub fn new(generator: Arc<ScriptedGenerator>) -> Arc<Self> {
        Arc::new(Self {
            generator,
            sinks: Mutex::new(Vec::new()),
            failing_sink: false,
        })
    }

    pub fn with_failing_sink(generator: Arc<ScriptedGenerator>) -> Arc<Self> {
        Arc::new(Self {
            generator,
            sinks: Mutex::new(Vec::new()),
            failing_sink: true,
        })
    }

    pub fn sinks(&self) -> Vec<Arc<RecordingSink>> {
        self.sinks.lock().unwrap().clone()
    }
}

impl BackendFactory for FakeBackends {
    fn generator(&self, cfg: &EmoConfig) -> VoiceResult<Option<Arc<dyn ResponseGenerator>>> {
        if !cfg.generation.has_credential() {
            return Ok(None);
        }
        Ok(Some(Arc::clone(&self.generator) as Arc<dyn ResponseGenerator>))
    }

    fn notify_sink(&self, cfg: &EmoConfig) -> Option<Arc<dyn NotifySink>> {
        if !cfg.notify.enabled {
            return None;
        }
        let sink = if self.failing_sink {
            RecordingSink::failing()
        } else {
            RecordingSink::new()
        };
        self.sinks.lock().unwrap().push(Arc::clone(&sink));
        Some(sink as Arc<dyn NotifySink>)
    }
}

/// Poll `cond` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// Drain everything published so far.
pub fn drain(rx: &mut broadcast::Receiver<StatusEvent>) -> Vec<SessionState> {
    let mut states = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => states.push(event.state),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    states
}

/// Keep draining into `seen` until one of them satisfies `pred`.
pub fn wait_for_state(
    rx: &mut broadcast::Receiver<StatusEvent>,
    seen: &mut Vec<SessionState>,
    timeout: Duration,
    pred: impl Fn(&SessionState) -> bool,
) -> bool {
    let start = seen.len();
    wait_until(timeout, || {
        seen.extend(drain(rx));
        seen[start..].iter().any(&pred)
    })
}
