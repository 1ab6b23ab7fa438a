//! Turn controller: glue between the listener, speech-to-text, the reply
//! model and the speech pipeline
//!
//! The controller is a single async loop. It never blocks on a collaborator
//! directly; transcription and reply generation run on the blocking pool.

use crate::config::TurnConfig;
use crate::events::TurnEvent;
use crate::pipeline::{self, segment, BargeInMode, SpeechPipeline};
use crate::transcript::{
    apply_replacements, strip_speaker_prefix, ConversationHistory, TranscriptFilter, Verdict,
};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long the farewell may take to play before the loop returns anyway
const FAREWELL_WAIT: Duration = Duration::from_secs(15);

/// Failure of a speech-to-text or reply collaborator
#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    #[error("transcription failed: {0}")]
    Transcriber(String),

    #[error("response generation failed: {0}")]
    Generator(String),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Blocking speech-to-text for one utterance
pub trait Transcriber: Send + Sync {
    /// `Ok(None)` when nothing was recognized within `timeout`
    fn listen_once(&self, timeout: Duration) -> Result<Option<String>, CollaboratorError>;
}

/// Blocking reply generation
pub trait ResponseGenerator: Send + Sync {
    fn generate(
        &self,
        model: &str,
        prompt: &str,
        system: &str,
        history: &str,
    ) -> Result<String, CollaboratorError>;
}

/// Why [`TurnController::run`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnEnd {
    /// The user said an exit word and the farewell was spoken
    Farewell,
    Shutdown,
    /// Every event sender went away
    InputClosed,
}

enum Flow {
    Continue,
    Stop,
}

/// What a final transcript led to
enum Turn {
    Done,
    Farewell,
    Generating(PendingReply),
}

type Transcription = JoinHandle<Result<Option<String>, CollaboratorError>>;

/// A final transcript and whether the agent was speaking when it was heard
struct Heard {
    text: String,
    interrupting: bool,
}

/// A reply being generated on the blocking pool
struct PendingReply {
    task: JoinHandle<Result<String, CollaboratorError>>,
    /// The agent was speaking when the question was asked
    interrupting: bool,
}

pub struct TurnController {
    pipeline: Arc<SpeechPipeline>,
    transcriber: Option<Arc<dyn Transcriber>>,
    generator: Arc<dyn ResponseGenerator>,
    filter: TranscriptFilter,
    history: ConversationHistory,
    config: TurnConfig,
    model: String,

    /// Consecutive collaborator failures
    failures: u32,
    /// Playback is paused because the user started talking over the agent
    listening: bool,
}

impl TurnController {
    pub fn new(
        config: &TurnConfig,
        model: impl Into<String>,
        pipeline: Arc<SpeechPipeline>,
        generator: Arc<dyn ResponseGenerator>,
    ) -> Self {
        Self {
            pipeline,
            transcriber: None,
            generator,
            filter: TranscriptFilter::from_config(config),
            history: ConversationHistory::new(config.history_lines),
            config: config.clone(),
            model: model.into(),
            failures: 0,
            listening: false,
        }
    }

    /// Transcribe after every detected speech start
    pub fn with_transcriber(mut self, transcriber: Arc<dyn Transcriber>) -> Self {
        self.transcriber = Some(transcriber);
        self
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures
    }

    /// System prompt with `{owner_name}` and `{your_name}` filled in
    pub fn system_prompt(&self) -> String {
        self.config
            .system_prompt
            .replace("{owner_name}", &self.config.user_name)
            .replace("{your_name}", &self.config.assistant_name)
    }

    /// Drive the conversation until shutdown, an exit word, or the end of input
    pub async fn run(
        &mut self,
        mut events: mpsc::UnboundedReceiver<TurnEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> pipeline::Result<TurnEnd> {
        let mut transcription: Option<Transcription> = None;
        let mut reply: Option<PendingReply> = None;
        // Final transcripts heard while a reply is still being generated
        let mut backlog: VecDeque<Heard> = VecDeque::new();
        let mut input_closed = false;
        info!("💬 Conversation loop started");

        let end = loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break TurnEnd::Shutdown;
                    }
                }

                heard = async {
                    match transcription.as_mut() {
                        Some(task) => task.await,
                        None => std::future::pending().await,
                    }
                }, if transcription.is_some() => {
                    transcription = None;
                    match heard.map_err(CollaboratorError::from).and_then(|r| r) {
                        Ok(Some(text)) => {
                            if let Flow::Stop = self.accept_transcript(&text, &mut reply, &mut backlog).await? {
                                break TurnEnd::Farewell;
                            }
                        }
                        Ok(None) => {
                            debug!("Nothing transcribed");
                            self.leave_listening();
                        }
                        Err(e) => {
                            self.record_failure(&e);
                            self.leave_listening();
                        }
                    }
                }

                outcome = async {
                    match reply.as_mut() {
                        Some(pending) => (&mut pending.task).await,
                        None => std::future::pending().await,
                    }
                }, if reply.is_some() => {
                    let interrupting = reply.take().is_some_and(|p| p.interrupting);
                    let outcome = outcome.map_err(CollaboratorError::from).and_then(|r| r);
                    self.on_reply(outcome, interrupting)?;

                    let mut farewell = false;
                    while reply.is_none() {
                        let Some(heard) = backlog.pop_front() else { break };
                        if let Flow::Stop = self.answer(heard, &mut reply).await? {
                            farewell = true;
                            break;
                        }
                    }
                    if farewell {
                        break TurnEnd::Farewell;
                    }
                    if input_closed && reply.is_none() {
                        break TurnEnd::InputClosed;
                    }
                }

                event = events.recv(), if !input_closed => {
                    let Some(event) = event else {
                        input_closed = true;
                        if reply.is_none() {
                            break TurnEnd::InputClosed;
                        }
                        debug!("Input closed, finishing the reply in progress");
                        continue;
                    };
                    match event {
                        TurnEvent::SpeechStarted => {
                            self.enter_listening();
                            if transcription.is_none() {
                                transcription = self.start_transcription();
                            }
                        }
                        TurnEvent::Transcript { text, is_final: false } => {
                            debug!("Partial transcript: {}", text);
                            self.enter_listening();
                        }
                        TurnEvent::Transcript { text, is_final: true } => {
                            if let Flow::Stop = self.accept_transcript(&text, &mut reply, &mut backlog).await? {
                                break TurnEnd::Farewell;
                            }
                        }
                        TurnEvent::ListenerFailed(message) => {
                            warn!("Listener reported a failure: {}", message);
                        }
                        TurnEvent::Shutdown => break TurnEnd::Shutdown,
                    }
                }
            }
        };

        if transcription.is_some() {
            debug!("Leaving an unfinished transcription behind");
        }
        if reply.is_some() {
            debug!("Leaving an unfinished reply behind");
        }
        info!("💬 Conversation loop ended ({:?})", end);
        Ok(end)
    }

    fn start_transcription(&self) -> Option<Transcription> {
        let transcriber = self.transcriber.clone()?;
        let timeout = self.config.stt_timeout();
        Some(tokio::task::spawn_blocking(move || {
            transcriber.listen_once(timeout)
        }))
    }

    /// Pause the agent while the user talks over it
    fn enter_listening(&mut self) {
        if !self.listening && self.pipeline.is_playing() && !self.pipeline.is_paused() {
            self.pipeline.pause();
            self.listening = true;
            info!("👂 User is talking, playback paused");
        }
    }

    fn leave_listening(&mut self) {
        if self.listening {
            self.pipeline.resume();
            self.listening = false;
            info!("▶️ Playback resumed");
        }
    }

    fn record_failure(&mut self, error: &CollaboratorError) {
        self.failures += 1;
        warn!(
            "Turn skipped ({}/{} consecutive failures): {}",
            self.failures, self.config.max_failures, error
        );
        if self.failures >= self.config.max_failures.max(1) {
            error!("❌ {} turns failed in a row", self.failures);
            self.failures = 0;
        }
    }

    fn is_exit(&self, text: &str) -> bool {
        self.config
            .exit_words
            .iter()
            .any(|w| !w.is_empty() && text.contains(w.as_str()))
    }

    /// Answer `text` now, or hold it until the reply in progress is spoken
    async fn accept_transcript(
        &mut self,
        text: &str,
        reply: &mut Option<PendingReply>,
        backlog: &mut VecDeque<Heard>,
    ) -> pipeline::Result<Flow> {
        let heard = Heard {
            text: text.to_string(),
            interrupting: self.listening || self.pipeline.is_playing(),
        };
        if reply.is_some() {
            debug!("Reply in progress, holding {:?}", text);
            backlog.push_back(heard);
            return Ok(Flow::Continue);
        }
        self.answer(heard, reply).await
    }

    async fn answer(
        &mut self,
        heard: Heard,
        reply: &mut Option<PendingReply>,
    ) -> pipeline::Result<Flow> {
        Ok(match self.on_final_transcript(&heard.text, heard.interrupting).await? {
            Turn::Done => Flow::Continue,
            Turn::Farewell => Flow::Stop,
            Turn::Generating(pending) => {
                *reply = Some(pending);
                Flow::Continue
            }
        })
    }

    async fn on_final_transcript(
        &mut self,
        raw: &str,
        interrupting: bool,
    ) -> pipeline::Result<Turn> {
        let text = apply_replacements(raw.trim(), &self.config.replacements);
        match self.filter.check(&text, self.pipeline.last_spoken().as_deref()) {
            Verdict::Accept => {}
            Verdict::Echo {
                similarity,
                matched,
            } => {
                info!("🔁 Ignoring self-echo {:?} ({:.2} vs {:?})", text, similarity, matched);
                self.leave_listening();
                return Ok(Turn::Done);
            }
            Verdict::Noise { score } => {
                info!("🗑️ Ignoring incoherent transcript {:?} ({:.2})", text, score);
                self.leave_listening();
                return Ok(Turn::Done);
            }
        }

        info!("👤 {}: {}", self.config.user_name, text);

        if self.is_exit(&text) {
            self.say_farewell(interrupting).await?;
            return Ok(Turn::Farewell);
        }

        self.history.push(&self.config.user_name, &text);
        let generator = self.generator.clone();
        let model = self.model.clone();
        let system = self.system_prompt();
        let history = self.history.render();
        let task = tokio::task::spawn_blocking(move || {
            generator.generate(&model, &text, &system, &history)
        });
        Ok(Turn::Generating(PendingReply { task, interrupting }))
    }

    fn on_reply(
        &mut self,
        outcome: Result<String, CollaboratorError>,
        interrupting: bool,
    ) -> pipeline::Result<()> {
        let reply = match outcome.map(|r| strip_speaker_prefix(&r, &self.config.assistant_name)) {
            Ok(reply) if !reply.is_empty() => reply,
            Ok(_) => {
                self.record_failure(&CollaboratorError::Generator("empty reply".to_string()));
                self.leave_listening();
                return Ok(());
            }
            Err(e) => {
                self.record_failure(&e);
                self.leave_listening();
                return Ok(());
            }
        };

        self.failures = 0;
        info!("🤖 {}: {}", self.config.assistant_name, reply);
        self.history.push(&self.config.assistant_name, &reply);
        self.speak(&reply, interrupting || self.listening)
    }

    /// Queue `text`, cutting off whatever is still playing if the user interrupted it
    fn speak(&mut self, text: &str, interrupting: bool) -> pipeline::Result<()> {
        if interrupting {
            let epoch = self.pipeline.barge_in("", BargeInMode::Hard)?;
            debug!("Interrupted own speech, now at epoch {}", epoch);
        }
        self.pipeline.push_text(&speakable(text))?;
        self.pipeline.resume();
        self.listening = false;
        Ok(())
    }

    async fn say_farewell(&mut self, interrupting: bool) -> pipeline::Result<()> {
        let farewell = self.config.farewell.clone();
        info!("👋 Exit word heard, saying goodbye");
        self.history.push(&self.config.assistant_name, &farewell);
        if farewell.trim().is_empty() {
            return Ok(());
        }
        self.speak(&farewell, interrupting)?;

        let pipeline = self.pipeline.clone();
        let finished = tokio::task::spawn_blocking(move || pipeline.wait_until_idle(FAREWELL_WAIT))
            .await
            .unwrap_or(false);
        if !finished {
            warn!("Farewell did not finish playing within {:?}", FAREWELL_WAIT);
        }
        Ok(())
    }
}

/// Make sure the segmenter releases the tail of a reply without waiting for more text
fn speakable(text: &str) -> String {
    let text = text.trim();
    match text.chars().last() {
        Some(c) if segment::TERMINATORS.contains(&c) => text.to_string(),
        _ => format!("{}。", text),
    }
}
