//! EMO Bridge console daemon
//!
//! Runs one voice session. Each stdin line is one utterance (type while a reply is
//! playing to barge in). Console commands:
//! - `/persona <name>`: switch persona
//! - `/interrupt`: cut the current reply short
//!
//! Stops on CTRL-C, end of input, or when the conversation ends itself.

use emo_voice::{
    build_synthesizer, ChannelTranscriber, DefaultBackends, EmoConfig, SessionState,
    UtteranceFeed, VoiceResult, VoiceSessionController, DEFAULT_CONFIG_PATH,
};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Load .env file if present (before any env::var calls)
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[emo-daemon] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if std::env::var("EMO_CONFIG").is_err() {
        let path = PathBuf::from(format!("{}.toml", DEFAULT_CONFIG_PATH));
        match EmoConfig::write_default(&path) {
            Ok(true) => tracing::info!(path = %path.display(), "Wrote default configuration"),
            Ok(false) => {}
            Err(e) => tracing::warn!(error = %e, "could not write default configuration"),
        }
    }
    let config = match EmoConfig::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };

    let (feed, transcriber) = ChannelTranscriber::channel();
    // Blocking HTTP clients must be built (and dropped) off the async runtime.
    let built = tokio::task::spawn_blocking(move || -> VoiceResult<VoiceSessionController> {
        let synthesizer = build_synthesizer(&config.voice, config.session.poll_interval())?;
        VoiceSessionController::new(
            config,
            Arc::new(transcriber),
            synthesizer,
            Arc::new(DefaultBackends),
        )
    })
    .await;
    let controller = match built {
        Ok(Ok(c)) => Arc::new(c),
        Ok(Err(e)) => {
            tracing::error!(error = %e, "could not build voice session");
            std::process::exit(1);
        }
        Err(e) => {
            tracing::error!(error = %e, "voice session setup panicked");
            std::process::exit(1);
        }
    };

    let mut status = controller.subscribe();
    let (eof_tx, mut eof_rx) = mpsc::unbounded_channel();
    spawn_console(feed, Arc::clone(&controller), eof_tx);

    if let Err(e) = controller.start() {
        tracing::error!(error = %e, "could not start voice session");
        std::process::exit(1);
    }
    tracing::info!(persona = %controller.persona(), "EMO Bridge listening (type to talk)");

    loop {
        tokio::select! {
            event = status.recv() => match event {
                Ok(event) => {
                    tracing::info!(status = %event.state, "status");
                    if event.state == SessionState::Idle && !controller.is_running() {
                        tracing::info!("Conversation ended");
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "status stream lagged");
                }
                Err(RecvError::Closed) => break,
            },
            _ = eof_rx.recv() => {
                tracing::info!("End of input; shutting down");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("CTRL-C received; shutting down");
                break;
            }
        }
    }

    let stopping = Arc::clone(&controller);
    drop(controller);
    if let Err(e) = tokio::task::spawn_blocking(move || stopping.stop()).await {
        tracing::error!(error = %e, "stop failed");
    }
}

/// Forward stdin lines to the session on a plain thread (stdin reads block).
fn spawn_console(
    feed: UtteranceFeed,
    controller: Arc<VoiceSessionController>,
    eof: mpsc::UnboundedSender<()>,
) {
    let spawned = std::thread::Builder::new()
        .name("emo-console".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        tracing::warn!(error = %e, "stdin read failed");
                        break;
                    }
                };
                let line = line.trim();
                if let Some(name) = line.strip_prefix("/persona ") {
                    controller.set_persona(name);
                } else if line == "/interrupt" {
                    controller.interrupt();
                } else if !feed.push(line) {
                    break;
                }
            }
            let _ = eof.send(());
        });
    if let Err(e) = spawned {
        tracing::error!(error = %e, "could not start console reader");
    }
}
