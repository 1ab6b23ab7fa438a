//! HaloLive - Full-duplex voice assistant
//!
//! Listens on the PulseAudio microphone, speaks through a VOICEVOX engine
//! and answers with an OpenAI-compatible chat model. Speech-to-text is not
//! built in: after the microphone hears you, type what you said on stdin.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use halolive::config::EngineConfig;
use halolive::device::PulseSink;
use halolive::echo_gate::EchoGate;
use halolive::events::PipelineEvent;
use halolive::listener::spawn_listener;
use halolive::pipeline::SpeechPipeline;
use halolive::responder::ChatCompletionsClient;
use halolive::synthesis::VoiceVoxClient;
use halolive::turn::{CollaboratorError, Transcriber, TurnController};
use std::io::BufRead;
use std::sync::{mpsc as std_mpsc, Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Lines typed on stdin stand in for speech-to-text
struct StdinTranscriber {
    lines: Mutex<std_mpsc::Receiver<String>>,
}

impl StdinTranscriber {
    fn spawn() -> std::io::Result<Self> {
        let (tx, rx) = std_mpsc::channel();
        std::thread::Builder::new()
            .name("stdin-reader".to_string())
            .spawn(move || {
                for line in std::io::stdin().lock().lines() {
                    let Ok(line) = line else { break };
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            })?;
        Ok(Self {
            lines: Mutex::new(rx),
        })
    }
}

impl Transcriber for StdinTranscriber {
    fn listen_once(&self, timeout: Duration) -> Result<Option<String>, CollaboratorError> {
        println!("⌨️  Type what you said ({} s):", timeout.as_secs());
        let lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        match lines.recv_timeout(timeout) {
            Ok(line) => Ok(Some(line).filter(|l| !l.trim().is_empty())),
            Err(std_mpsc::RecvTimeoutError::Timeout) => Ok(None),
            Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                Err(CollaboratorError::Transcriber("stdin closed".to_string()))
            }
        }
    }
}

async fn log_pipeline_events(mut events: broadcast::Receiver<PipelineEvent>) {
    loop {
        match events.recv().await {
            Ok(PipelineEvent::SynthesisFailed {
                epoch,
                sequence,
                error,
            }) => warn!("Sentence {}:{} could not be synthesized: {}", epoch, sequence, error),
            Ok(event) => debug!("Pipeline event: {:?}", event),
            Err(broadcast::error::RecvError::Lagged(n)) => debug!("Missed {} pipeline events", n),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let path = std::env::var("HALOLIVE_CONFIG").unwrap_or_else(|_| "halolive.json".to_string());
    let config = EngineConfig::load(&path).with_context(|| format!("loading config {}", path))?;
    info!("Starting halolive (config: {})", path);

    // Blocking HTTP clients are built here, outside the async runtime
    let echo_gate = config
        .echo_gate
        .enabled
        .then(|| Arc::new(EchoGate::from_config(&config.echo_gate, config.audio.sample_rate)));
    let synthesizer = Arc::new(VoiceVoxClient::new(&config.synthesis)?);
    let sink = Arc::new(PulseSink::new(&config.audio));
    let pipeline = Arc::new(SpeechPipeline::start(
        &config.pipeline,
        synthesizer,
        sink,
        echo_gate.clone(),
    )?);
    let generator = Arc::new(ChatCompletionsClient::new(&config.llm)?);
    let transcriber = Arc::new(StdinTranscriber::spawn()?);

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let listener = spawn_listener(&config.audio, &config.vad, echo_gate, events_tx)
        .context("starting microphone listener")?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    println!("=== HaloLive ===");
    println!("Talk to {}. Say one of {:?} or press Ctrl+C to quit.", config.turn.assistant_name, config.turn.exit_words);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    let end = runtime.block_on(async {
        tokio::spawn(log_pipeline_events(pipeline.subscribe()));
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl+C received, shutting down");
                let _ = shutdown_tx.send(true);
            }
        });

        let mut controller = TurnController::new(
            &config.turn,
            config.llm.model.clone(),
            pipeline.clone(),
            generator.clone(),
        )
        .with_transcriber(transcriber);
        controller.run(events_rx, shutdown_rx).await
    });

    listener.stop();
    let report = pipeline.shutdown();
    if !report.abandoned.is_empty() {
        warn!("Abandoned stage threads: {:?}", report.abandoned);
    }
    runtime.shutdown_timeout(Duration::from_secs(1));
    drop(generator);

    info!("Conversation ended: {:?}", end?);
    Ok(())
}
