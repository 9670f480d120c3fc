//! End-to-end tests of the turn-taking cycle with scripted capabilities.

mod common;

use common::*;
use emo_voice::{
    instruction_for, GenerationError, Persona, RecognitionError, SessionErrorKind, SessionState,
    SpeechParams, SynthesisError, Synthesizer, VoiceSessionController,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(5);

struct Rig {
    stt: Arc<ScriptedTranscriber>,
    gen: Arc<ScriptedGenerator>,
    synth: Arc<RecordingSynth>,
    backends: Arc<FakeBackends>,
}

impl Rig {
    fn new(reply_length: Duration) -> Self {
        init_logging();
        let gen = ScriptedGenerator::new();
        Self {
            stt: ScriptedTranscriber::new(),
            backends: FakeBackends::new(Arc::clone(&gen)),
            gen,
            synth: RecordingSynth::new(reply_length),
        }
    }

    fn controller(&self, cfg: emo_voice::EmoConfig) -> VoiceSessionController {
        VoiceSessionController::new(
            cfg,
            self.stt.clone(),
            self.synth.clone(),
            self.backends.clone(),
        )
        .unwrap()
    }
}

fn position(seen: &[SessionState], state: SessionState) -> Option<usize> {
    seen.iter().position(|s| *s == state)
}

// --- stop() ---

#[test]
fn stop_without_session_only_says_farewell() {
    let rig = Rig::new(Duration::ZERO);
    let ctl = rig.controller(test_config());
    assert_eq!(ctl.state(), SessionState::Idle);

    ctl.stop();
    assert_eq!(ctl.state(), SessionState::Idle);
    assert!(!ctl.is_running());
    assert_eq!(rig.synth.spoken(), vec!["Goodbye!".to_string()]);
}

#[test]
fn stop_while_listening_reaches_idle_within_bound() {
    let rig = Rig::new(Duration::ZERO);
    let ctl = rig.controller(test_config());
    let mut rx = ctl.subscribe();
    ctl.start().unwrap();
    let mut seen = Vec::new();
    assert!(wait_for_state(&mut rx, &mut seen, WAIT, |s| *s == SessionState::Listening));

    let t = Instant::now();
    ctl.stop();
    assert!(t.elapsed() < Duration::from_millis(700));
    assert_eq!(ctl.state(), SessionState::Idle);
    assert!(!ctl.is_running());
    assert_eq!(rig.synth.spoken(), vec!["Goodbye!".to_string()]);
    assert_eq!(drain(&mut rx).last(), Some(&SessionState::Idle));
}

#[test]
fn stop_while_speaking_cuts_playback() {
    let rig = Rig::new(Duration::from_secs(10));
    rig.stt.say("tell me everything");
    rig.gen.reply("A very long answer");
    let ctl = rig.controller(test_config());
    ctl.start().unwrap();

    assert!(wait_until(WAIT, || rig.synth.is_playing()));
    assert!(ctl.is_speaking());
    rig.synth.set_length(Duration::ZERO);

    let t = Instant::now();
    ctl.stop();
    assert!(t.elapsed() < Duration::from_millis(700));
    assert_eq!(ctl.state(), SessionState::Idle);
    assert!(!ctl.is_speaking());
    assert!(rig.synth.stops.load(Ordering::SeqCst) >= 1);
    assert_eq!(
        rig.synth.spoken(),
        vec!["A very long answer".to_string(), "Goodbye!".to_string()]
    );
}

#[test]
fn stop_abandons_slow_generation() {
    init_logging();
    let gen = ScriptedGenerator::with_delay(Duration::from_millis(600));
    gen.reply("too late");
    let stt = ScriptedTranscriber::new();
    stt.say("hello");
    let synth = RecordingSynth::new(Duration::ZERO);
    let mut cfg = test_config();
    cfg.session.stop_timeout_ms = 100;
    let ctl = VoiceSessionController::new(
        cfg,
        stt.clone(),
        synth.clone(),
        FakeBackends::new(Arc::clone(&gen)),
    )
    .unwrap();
    let mut rx = ctl.subscribe();
    ctl.start().unwrap();
    let mut seen = Vec::new();
    assert!(wait_for_state(&mut rx, &mut seen, WAIT, |s| *s == SessionState::Generating));

    let t = Instant::now();
    ctl.stop();
    assert!(t.elapsed() < Duration::from_millis(400));
    assert_eq!(ctl.state(), SessionState::Idle);

    // The abandoned reply comes back and must change nothing.
    thread::sleep(Duration::from_millis(800));
    assert_eq!(ctl.state(), SessionState::Idle);
    assert_eq!(synth.spoken(), vec!["Goodbye!".to_string()]);
    assert!(!drain(&mut rx).contains(&SessionState::Speaking));
}

#[test]
fn session_can_restart_after_stop() {
    let rig = Rig::new(Duration::ZERO);
    let ctl = rig.controller(test_config());
    ctl.start().unwrap();
    ctl.start().unwrap();
    assert!(ctl.is_running());
    ctl.stop();

    rig.stt.say("hello again");
    ctl.start().unwrap();
    assert!(wait_until(WAIT, || rig.gen.calls() == 1));
    ctl.stop();
    assert_eq!(ctl.state(), SessionState::Idle);
}

// --- barge-in ---

#[test]
fn barge_in_interrupts_and_routes_new_utterance() {
    let rig = Rig::new(Duration::from_secs(3));
    rig.stt.say("tell me a story");
    rig.stt.barge_in("what about dragons");
    rig.gen.reply("Once upon a time");
    rig.gen.reply("Dragons breathe fire");
    let ctl = rig.controller(test_config());
    let mut rx = ctl.subscribe();
    ctl.start().unwrap();

    let mut seen = Vec::new();
    assert!(wait_for_state(&mut rx, &mut seen, WAIT, |s| *s == SessionState::Interrupted));
    assert!(wait_until(WAIT, || rig.synth.spoken().len() == 2));
    seen.extend(drain(&mut rx));

    // The second turn skipped the normal listen.
    assert_eq!(rig.stt.normal_listens.load(Ordering::SeqCst), 1);
    let interrupted = position(&seen, SessionState::Interrupted).unwrap();
    assert_eq!(seen[interrupted + 1], SessionState::Generating);

    let prompts = rig.gen.prompts();
    assert!(prompts[1].ends_with("User said: \"what about dragons\""));

    // Audio stopped promptly after the interrupt.
    let latencies = rig.synth.stop_latencies.lock().unwrap().clone();
    assert!(latencies[0] < Duration::from_millis(200));

    rig.synth.set_length(Duration::ZERO);
    ctl.stop();
    assert_eq!(ctl.state(), SessionState::Idle);
}

#[test]
fn stop_phrase_silences_without_new_turn() {
    let rig = Rig::new(Duration::from_secs(3));
    rig.stt.say("tell me a story");
    rig.stt.barge_in("Be quiet");
    rig.gen.reply("Once upon a time");
    let ctl = rig.controller(test_config());
    let mut rx = ctl.subscribe();
    ctl.start().unwrap();

    let mut seen = Vec::new();
    assert!(wait_for_state(&mut rx, &mut seen, WAIT, |s| *s == SessionState::Interrupted));
    assert!(wait_for_state(&mut rx, &mut seen, WAIT, |s| *s == SessionState::Listening));
    let interrupted = position(&seen, SessionState::Interrupted).unwrap();
    assert_eq!(seen[interrupted + 1], SessionState::Listening);
    assert_eq!(rig.gen.calls(), 1);
    assert!(ctl.is_running());

    ctl.stop();
}

#[test]
fn external_interrupt_cuts_reply_but_keeps_session() {
    let rig = Rig::new(Duration::from_secs(5));
    rig.stt.say("talk to me");
    let ctl = rig.controller(test_config());
    let mut rx = ctl.subscribe();
    ctl.start().unwrap();

    assert!(wait_until(WAIT, || rig.synth.is_playing()));
    ctl.interrupt();
    let mut seen = Vec::new();
    assert!(wait_for_state(&mut rx, &mut seen, WAIT, |s| *s == SessionState::Interrupted));
    assert!(wait_until(WAIT, || !rig.synth.is_playing()));
    assert!(ctl.is_running());

    rig.synth.set_length(Duration::ZERO);
    ctl.stop();
}

// --- routing ---

#[test]
fn quit_phrase_ends_session() {
    let rig = Rig::new(Duration::ZERO);
    rig.stt.say("  EXIT ");
    let ctl = rig.controller(test_config());
    ctl.start().unwrap();

    assert!(wait_until(WAIT, || !ctl.is_running()));
    assert_eq!(ctl.state(), SessionState::Idle);
    assert_eq!(rig.gen.calls(), 0);
    assert!(rig.synth.spoken().is_empty());
}

#[test]
fn sentences_containing_quit_words_are_answered() {
    let rig = Rig::new(Duration::ZERO);
    rig.stt.say("please stop the music");
    rig.stt.say("the end");
    let ctl = rig.controller(test_config());
    ctl.start().unwrap();

    assert!(wait_until(WAIT, || rig.gen.calls() == 2));
    assert!(ctl.is_running());
    ctl.stop();
}

#[test]
fn persona_prefix_switches_and_is_stripped() {
    let rig = Rig::new(Duration::ZERO);
    rig.stt.say("Emusinio tell me a joke");
    rig.gen.reply("Patience is a virtue.");
    let ctl = rig.controller(test_config());
    ctl.start().unwrap();

    assert!(wait_until(WAIT, || rig.synth.spoken().len() == 1));
    assert_eq!(ctl.persona(), Persona::Emusinio);
    let prompt = &rig.gen.prompts()[0];
    assert!(prompt.starts_with("You are EMUSINIO."));
    assert!(prompt.ends_with("User said: \"tell me a joke\""));
    assert!(!prompt.contains("Include emojis"));
    assert_eq!(
        rig.synth.params.lock().unwrap()[0].voice.as_deref(),
        Some("Joana")
    );
    ctl.stop();
}

#[test]
fn bare_persona_keyword_skips_generation() {
    let rig = Rig::new(Duration::ZERO);
    rig.stt.say("emo");
    let mut cfg = test_config();
    cfg.session.persona = Persona::Emusinio;
    let ctl = rig.controller(cfg);
    let mut rx = ctl.subscribe();
    ctl.start().unwrap();

    assert!(wait_until(WAIT, || rig.stt.normal_listens.load(Ordering::SeqCst) >= 3));
    assert_eq!(ctl.persona(), Persona::Emo);
    assert_eq!(rig.gen.calls(), 0);
    assert!(!drain(&mut rx).contains(&SessionState::Generating));
    ctl.stop();
}

#[test]
fn quit_reply_ends_session_without_playback() {
    let rig = Rig::new(Duration::ZERO);
    rig.stt.say("I'm done, bye");
    rig.gen.reply("QUIT");
    let ctl = rig.controller(test_config());
    ctl.start().unwrap();

    assert!(wait_until(WAIT, || !ctl.is_running()));
    assert_eq!(ctl.state(), SessionState::Idle);
    assert!(rig.synth.spoken().is_empty());
}

#[test]
fn quit_reply_is_case_sensitive() {
    let rig = Rig::new(Duration::ZERO);
    rig.stt.say("say quit");
    rig.gen.reply("quit");
    let ctl = rig.controller(test_config());
    ctl.start().unwrap();

    assert!(wait_until(WAIT, || rig.synth.spoken().len() == 1));
    assert_eq!(rig.synth.spoken()[0], "quit");
    assert!(ctl.is_running());
    ctl.stop();
}

#[test]
fn set_persona_selects_style() {
    let rig = Rig::new(Duration::ZERO);
    let ctl = rig.controller(test_config());

    assert_eq!(ctl.set_persona("EMUSINIO"), Persona::Emusinio);
    assert!(!instruction_for(&ctl.persona()).emoji_allowed);
    ctl.set_persona("emo");
    assert!(instruction_for(&ctl.persona()).emoji_allowed);

    ctl.set_persona("EMUSINIO");
    rig.stt.say("good morning");
    ctl.start().unwrap();
    assert!(wait_until(WAIT, || rig.gen.calls() == 1));
    assert!(rig.gen.prompts()[0].starts_with("You are EMUSINIO."));
    ctl.stop();
}

// --- failures ---

#[test]
fn generation_failure_reports_network_error_and_keeps_listening() {
    let rig = Rig::new(Duration::ZERO);
    rig.gen.fail(GenerationError::Network("connection reset".into()));
    rig.stt.say("hello");
    rig.stt.say("hello again");
    let ctl = rig.controller(test_config());
    let mut rx = ctl.subscribe();
    ctl.start().unwrap();

    let failed = SessionState::Error(SessionErrorKind::GenerationFailure);
    let mut seen = Vec::new();
    assert!(wait_for_state(&mut rx, &mut seen, WAIT, |s| *s == failed));
    assert!(wait_until(WAIT, || rig.gen.calls() == 2));
    seen.extend(drain(&mut rx));

    assert!(ctl.is_running());
    assert_eq!(ctl.last_error(), Some(SessionErrorKind::GenerationFailure));
    let at = position(&seen, failed).unwrap();
    assert_eq!(seen[at + 1], SessionState::Listening);
    assert_eq!(failed.to_string(), "Error: Network Connection lost");
    // Only the successful reply was spoken.
    assert!(wait_until(WAIT, || rig.synth.spoken().len() == 1));
    ctl.stop();
}

#[test]
fn recognition_service_failure_is_reported_and_retried() {
    let rig = Rig::new(Duration::ZERO);
    rig.stt.fail(RecognitionError::Service("microphone unplugged".into()));
    rig.stt.say("are you there");
    let ctl = rig.controller(test_config());
    let mut rx = ctl.subscribe();
    ctl.start().unwrap();

    let mut seen = Vec::new();
    assert!(wait_for_state(&mut rx, &mut seen, WAIT, |s| {
        *s == SessionState::Error(SessionErrorKind::RecognitionServiceFailure)
    }));
    assert!(wait_until(WAIT, || rig.gen.calls() == 1));
    assert!(ctl.is_running());
    ctl.stop();
}

#[test]
fn expected_recognition_misses_are_silent() {
    let rig = Rig::new(Duration::ZERO);
    rig.stt.fail(RecognitionError::Timeout);
    rig.stt.fail(RecognitionError::Unintelligible);
    rig.stt.say("hi");
    let ctl = rig.controller(test_config());
    let mut rx = ctl.subscribe();
    ctl.start().unwrap();

    assert!(wait_until(WAIT, || rig.synth.spoken().len() == 1));
    assert!(!drain(&mut rx).iter().any(|s| s.is_error()));
    assert_eq!(ctl.last_error(), None);
    ctl.stop();
}

#[test]
fn panic_inside_cycle_is_contained() {
    let rig = Rig::new(Duration::ZERO);
    rig.gen.panic_next();
    rig.stt.say("boom");
    rig.stt.say("still there?");
    let ctl = rig.controller(test_config());
    let mut rx = ctl.subscribe();
    ctl.start().unwrap();

    let mut seen = Vec::new();
    assert!(wait_for_state(&mut rx, &mut seen, WAIT, |s| {
        *s == SessionState::Error(SessionErrorKind::Unexpected)
    }));
    assert!(wait_until(WAIT, || rig.gen.calls() == 2));
    assert!(ctl.is_running());
    ctl.stop();
}

struct BrokenSynth;

impl Synthesizer for BrokenSynth {
    fn speak(&self, _text: &str, _params: &SpeechParams) -> Result<(), SynthesisError> {
        Err(SynthesisError::Engine("no output device".into()))
    }

    fn stop_current(&self) {}
}

#[test]
fn synthesis_failure_counts_as_spoken() {
    init_logging();
    let gen = ScriptedGenerator::new();
    gen.reply("Hello there");
    let stt = ScriptedTranscriber::new();
    stt.say("hi");
    let backends = FakeBackends::new(Arc::clone(&gen));
    let mut cfg = test_config();
    cfg.notify.enabled = true;
    let ctl = VoiceSessionController::new(cfg, stt, Arc::new(BrokenSynth), backends.clone()).unwrap();
    let mut rx = ctl.subscribe();
    ctl.start().unwrap();

    let sink = backends.sinks()[0].clone();
    assert!(wait_until(WAIT, || sink.published().len() == 1));
    assert!(!drain(&mut rx).iter().any(|s| s.is_error()));
    ctl.stop();
}

// --- credentials, config and notify ---

#[test]
fn missing_credential_reports_error_without_crashing() {
    let rig = Rig::new(Duration::ZERO);
    let mut cfg = test_config();
    cfg.generation.api_key.clear();
    let ctl = rig.controller(cfg);
    let unavailable = SessionState::Error(SessionErrorKind::GenerationUnavailable);
    assert_eq!(ctl.state(), unavailable);

    let mut rx = ctl.subscribe();
    rig.stt.say("hello");
    ctl.start().unwrap();
    let mut seen = Vec::new();
    assert!(wait_for_state(&mut rx, &mut seen, WAIT, |s| *s == SessionState::Listening));
    assert_eq!(seen[0], unavailable);
    assert!(wait_until(WAIT, || rig.stt.normal_listens.load(Ordering::SeqCst) >= 2));
    assert!(ctl.is_running());
    assert_eq!(rig.gen.calls(), 0);
    ctl.stop();
}

#[test]
fn reply_is_published_after_playback() {
    let rig = Rig::new(Duration::ZERO);
    rig.stt.say("hi");
    rig.gen.reply("Olá! 😀");
    let mut cfg = test_config();
    cfg.notify.enabled = true;
    let ctl = rig.controller(cfg);
    ctl.start().unwrap();

    let sink = rig.backends.sinks()[0].clone();
    assert!(wait_until(WAIT, || sink.published().len() == 1));
    assert_eq!(
        sink.published()[0],
        ("emo/bridge".to_string(), "Olá! 😀".to_string())
    );
    ctl.stop();
}

#[test]
fn notify_failure_never_reaches_status() {
    init_logging();
    let gen = ScriptedGenerator::new();
    let stt = ScriptedTranscriber::new();
    stt.say("hi");
    let synth = RecordingSynth::new(Duration::ZERO);
    let mut cfg = test_config();
    cfg.notify.enabled = true;
    let ctl = VoiceSessionController::new(
        cfg,
        stt,
        synth.clone(),
        FakeBackends::with_failing_sink(gen),
    )
    .unwrap();
    let mut rx = ctl.subscribe();
    ctl.start().unwrap();

    assert!(wait_until(WAIT, || synth.spoken().len() == 1));
    thread::sleep(Duration::from_millis(50));
    assert!(!drain(&mut rx).iter().any(|s| s.is_error()));
    assert_eq!(ctl.last_error(), None);
    ctl.stop();
}

#[test]
fn update_config_reconnects_notify_and_swaps_credentials() {
    let rig = Rig::new(Duration::ZERO);
    let mut cfg = test_config();
    cfg.notify.enabled = true;
    let ctl = rig.controller(cfg.clone());
    assert_eq!(rig.backends.sinks().len(), 1);

    cfg.notify.topic = "emo/test".into();
    ctl.update_config(cfg.clone()).unwrap();
    let sinks = rig.backends.sinks();
    assert_eq!(sinks.len(), 2);
    assert!(sinks[0].closed.load(Ordering::SeqCst));
    assert!(!sinks[1].closed.load(Ordering::SeqCst));

    rig.stt.say("hi");
    rig.gen.reply("hey");
    ctl.start().unwrap();
    assert!(wait_until(WAIT, || sinks[1].published().len() == 1));
    assert_eq!(sinks[1].published()[0].0, "emo/test");
    assert!(sinks[0].published().is_empty());

    cfg.generation.api_key.clear();
    ctl.update_config(cfg).unwrap();
    assert_eq!(ctl.last_error(), Some(SessionErrorKind::GenerationUnavailable));
    ctl.stop();
}

#[test]
fn invalid_config_is_rejected() {
    let rig = Rig::new(Duration::ZERO);
    let ctl = rig.controller(test_config());
    let mut bad = test_config();
    bad.session.poll_interval_ms = 0;
    assert!(ctl.update_config(bad).is_err());
}
