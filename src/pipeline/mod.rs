//! Pipelined speech synthesis and playback
//!
//! Text goes through four stages:
//!
//! 1. **Ingest** (1 thread) accumulates fragments and cuts sentences.
//! 2. **Synthesis** (N threads) renders sentences to audio concurrently.
//! 3. **Player** (1 thread) plays results strictly by sequence number.
//! 4. The caller drives it all through [`SpeechPipeline`].
//!
//! Every `barge_in` starts a new epoch. Work tagged with an older epoch is
//! dropped wherever it is found, so an interruption never lets stale audio
//! reach the speaker.

mod ingest;
mod player;
pub mod segment;
mod state;
mod worker;

pub use segment::SentenceSegmenter;

use crate::config::PipelineConfig;
use crate::device::AudioSink;
use crate::echo_gate::EchoGate;
use crate::events::PipelineEvent;
use crate::synthesis::Synthesizer;
use ingest::IngestMsg;
use player::Player;
use serde::Deserialize;
use state::{Shared, State};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Error type for pipeline control calls
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("pipeline is closed for input")]
    Closed,

    #[error("pipeline is not running")]
    NotRunning,

    #[error("failed to spawn {0} thread: {1}")]
    Spawn(String, #[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// How a barge-in treats the sentence currently playing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BargeInMode {
    /// Cut the current sentence off and speak the new text next
    Hard,
    /// Let the current sentence finish, then switch
    Soft,
}

/// What a soft barge-in does with sentences that are synthesized but not yet playing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SoftBargeInPolicy {
    /// Only the sentence on the device finishes
    #[default]
    DiscardReady,
    /// The ready run directly after it plays too
    FinishReady,
}

/// Which stage threads exited in time during shutdown
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub joined: Vec<String>,
    pub abandoned: Vec<String>,
}

/// Tells the shutdown path that a stage thread has returned
struct ExitNotice {
    name: String,
    tx: Sender<String>,
}

impl Drop for ExitNotice {
    fn drop(&mut self) {
        let _ = self.tx.send(std::mem::take(&mut self.name));
    }
}

/// Spawns named stage threads that report their exit
struct StageSet<'a> {
    exit_tx: &'a Sender<String>,
}

impl StageSet<'_> {
    fn spawn(
        &self,
        handles: &mut Vec<(String, JoinHandle<()>)>,
        name: String,
        body: impl FnOnce() + Send + 'static,
    ) -> Result<()> {
        let notice = ExitNotice {
            name: name.clone(),
            tx: self.exit_tx.clone(),
        };
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let _notice = notice;
                body();
            })
            .map_err(|e| PipelineError::Spawn(name.clone(), e))?;
        debug!("Spawned stage thread {}", name);
        handles.push((name, handle));
        Ok(())
    }
}

struct Stages {
    handles: Vec<(String, JoinHandle<()>)>,
    exits: Receiver<String>,
}

/// Long-lived speech output engine for one conversation session
pub struct SpeechPipeline {
    shared: Arc<Shared>,
    input: Mutex<Option<SyncSender<IngestMsg>>>,
    stages: Mutex<Option<Stages>>,
    join_timeout: Duration,
    drain_timeout: Duration,
}

impl SpeechPipeline {
    /// Spawn the ingest, synthesis and player threads
    pub fn start(
        config: &PipelineConfig,
        synthesizer: Arc<dyn Synthesizer>,
        sink: Arc<dyn AudioSink>,
        echo_gate: Option<Arc<EchoGate>>,
    ) -> Result<Self> {
        let (events, _) = broadcast::channel(256);
        let state = State::new(config.sentence_queue, config.autoplay, config.soft_barge_in);
        let shared = Arc::new(Shared::new(state, events));

        let (input_tx, input_rx) = mpsc::sync_channel(config.input_queue.max(1));
        let (exit_tx, exit_rx) = mpsc::channel();
        let mut handles = Vec::new();

        let stages = StageSet { exit_tx: &exit_tx };
        let started = stages
            .spawn(&mut handles, "tts-ingest".to_string(), {
                let shared = shared.clone();
                let segmenter = SentenceSegmenter::new(config.max_sentence_len);
                move || ingest::run(shared, input_rx, segmenter)
            })
            .and_then(|_| {
                for id in 0..config.workers.max(1) {
                    let shared = shared.clone();
                    let synthesizer = synthesizer.clone();
                    stages.spawn(&mut handles, format!("tts-synth-{}", id), move || {
                        worker::run(shared, synthesizer, id)
                    })?;
                }
                Ok(())
            })
            .and_then(|_| {
                let player = Player {
                    shared: shared.clone(),
                    sink,
                    echo_gate,
                    chunk_ms: config.chunk_ms,
                };
                stages.spawn(&mut handles, "tts-player".to_string(), move || player.run())
            });

        if let Err(e) = started {
            // Release whatever did start
            shared.lock().stopping = true;
            shared.notify();
            return Err(e);
        }

        info!(
            "🗣️ Speech pipeline started ({} workers, autoplay: {})",
            config.workers, config.autoplay
        );

        Ok(Self {
            shared,
            input: Mutex::new(Some(input_tx)),
            stages: Mutex::new(Some(Stages {
                handles,
                exits: exit_rx,
            })),
            join_timeout: config.join_timeout(),
            drain_timeout: config.drain_timeout(),
        })
    }

    fn sender(&self) -> Result<SyncSender<IngestMsg>> {
        self.input
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .cloned()
            .ok_or(PipelineError::NotRunning)
    }

    /// Send to ingestion; `pending_input` has already been counted
    fn send(&self, tx: &SyncSender<IngestMsg>, msg: IngestMsg) -> Result<()> {
        if tx.send(msg).is_err() {
            let mut st = self.shared.lock();
            st.pending_input = st.pending_input.saturating_sub(1);
            drop(st);
            self.shared.notify();
            return Err(PipelineError::NotRunning);
        }
        Ok(())
    }

    /// Queue a text fragment of any size for the current epoch
    pub fn push_text(&self, fragment: &str) -> Result<()> {
        if fragment.is_empty() {
            return Ok(());
        }
        let tx = self.sender()?;
        let epoch = {
            let mut st = self.shared.lock();
            if st.stopping {
                return Err(PipelineError::NotRunning);
            }
            if st.closed {
                return Err(PipelineError::Closed);
            }
            st.pending_input += 1;
            st.epoch
        };
        self.send(
            &tx,
            IngestMsg::Text {
                epoch,
                text: fragment.to_string(),
            },
        )
    }

    /// No more input; the buffered tail is flushed as a final sentence
    pub fn close(&self) {
        let Ok(tx) = self.sender() else {
            return;
        };
        {
            let mut st = self.shared.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            st.pending_input += 1;
        }
        if self.send(&tx, IngestMsg::Close).is_err() {
            let mut st = self.shared.lock();
            st.ingest_done = true;
            drop(st);
            self.shared.notify();
        }
        debug!("Speech pipeline closed for input");
    }

    /// Interrupt current speech and start a new epoch with `text`.
    ///
    /// Once this returns nothing queued before it can play, except (in soft
    /// mode) the sentence already on the device.
    pub fn barge_in(&self, text: &str, mode: BargeInMode) -> Result<u64> {
        let text = text.trim();
        let tx = match mode {
            BargeInMode::Soft if !text.is_empty() => Some(self.sender()?),
            _ => None,
        };

        let epoch = {
            let mut st = self.shared.lock();
            if st.stopping {
                return Err(PipelineError::NotRunning);
            }
            if st.closed {
                return Err(PipelineError::Closed);
            }
            match mode {
                BargeInMode::Hard => {
                    let inject = (!text.is_empty()).then(|| text.to_string());
                    let (epoch, injected) = st.begin_hard_epoch(inject);
                    self.shared.emit(PipelineEvent::EpochChanged { epoch });
                    if let Some(sentence) = injected {
                        self.shared.emit(PipelineEvent::SentenceQueued {
                            epoch: sentence.epoch,
                            sequence: sentence.sequence,
                            text: sentence.text,
                        });
                    }
                    epoch
                }
                BargeInMode::Soft => {
                    let epoch = st.begin_soft_epoch();
                    if tx.is_some() {
                        st.pending_input += 1;
                    }
                    epoch
                }
            }
        };
        self.shared.notify();
        info!("✋ Barge-in ({:?}) -> epoch {}", mode, epoch);

        if let Some(tx) = tx {
            self.send(
                &tx,
                IngestMsg::Text {
                    epoch,
                    text: text.to_string(),
                },
            )?;
        }
        Ok(epoch)
    }

    /// Silence everything now without queuing anything new.
    ///
    /// Unlike `barge_in` this also works after `close`.
    pub fn stop(&self) {
        let epoch = {
            let mut st = self.shared.lock();
            if st.stopping {
                return;
            }
            let (epoch, _) = st.begin_hard_epoch(None);
            epoch
        };
        self.shared.emit(PipelineEvent::EpochChanged { epoch });
        self.shared.notify();
        info!("🛑 Speech stopped (epoch {})", epoch);
    }

    /// Close the playback gate; the current sentence keeps playing
    pub fn pause(&self) {
        let mut st = self.shared.lock();
        st.gate_open = false;
        st.close_gate_when_idle = false;
        drop(st);
        self.shared.notify();
    }

    pub fn resume(&self) {
        let mut st = self.shared.lock();
        st.gate_open = true;
        st.close_gate_when_idle = false;
        drop(st);
        self.shared.notify();
    }

    /// Let everything already queued play, then close the gate
    pub fn pause_after_flush(&self) {
        let mut st = self.shared.lock();
        if st.gate_open {
            st.close_gate_when_idle = true;
        }
        drop(st);
        self.shared.notify();
    }

    /// Abandon the sentence playing now, or the next one if none is.
    ///
    /// The request is spent once that sentence is done, even if it finished
    /// before the player noticed.
    pub fn skip_current(&self) {
        let (epoch, sequence) = self.shared.lock().request_skip();
        debug!("Skip requested for {}:{}", epoch, sequence);
        self.shared.notify();
    }

    pub fn is_playing(&self) -> bool {
        self.shared.lock().is_playing()
    }

    pub fn is_paused(&self) -> bool {
        !self.shared.lock().gate_open
    }

    pub fn current_epoch(&self) -> u64 {
        self.shared.lock().epoch
    }

    /// Text of the last sentence that reached the speaker
    pub fn last_spoken(&self) -> Option<String> {
        self.shared.lock().last_spoken.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.shared.subscribe()
    }

    /// Block until nothing is playing or queued; `false` on timeout
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut st = self.shared.lock();
        while st.is_playing() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            st = self.shared.wait_timeout(st, deadline - now);
        }
        true
    }

    /// Close, drain, stop and join every stage.
    ///
    /// Threads that miss the join timeout are detached and listed as abandoned.
    /// Calling it again returns an empty report.
    pub fn shutdown(&self) -> ShutdownReport {
        let Some(stages) = self
            .stages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return ShutdownReport::default();
        };

        self.close();
        if !self.wait_until_idle(self.drain_timeout) {
            warn!("Speech did not drain within {:?}, stopping", self.drain_timeout);
        }

        self.shared.lock().stopping = true;
        self.shared.notify();
        // Unblocks the ingest thread's recv
        self.input
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let mut exited = Vec::new();
        let deadline = Instant::now() + self.join_timeout;
        while exited.len() < stages.handles.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match stages.exits.recv_timeout(remaining) {
                Ok(name) => exited.push(name),
                Err(_) => break,
            }
        }

        let mut report = ShutdownReport::default();
        for (name, handle) in stages.handles {
            if exited.contains(&name) {
                if handle.join().is_err() {
                    warn!("Stage {} panicked", name);
                }
                report.joined.push(name);
            } else {
                warn!("Stage {} did not exit within {:?}, abandoning", name, self.join_timeout);
                report.abandoned.push(name);
            }
        }

        info!(
            "Speech pipeline shut down ({} joined, {} abandoned)",
            report.joined.len(),
            report.abandoned.len()
        );
        report
    }
}

impl Drop for SpeechPipeline {
    fn drop(&mut self) {
        // Never block in drop; threads see `stopping` and wind down detached
        self.shared.lock().stopping = true;
        self.shared.notify();
        self.input
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

#[cfg(test)]
mod tests;
