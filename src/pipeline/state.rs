//! State shared by every pipeline stage.
//!
//! All of it lives behind one mutex so epoch checks and the inserts or
//! removals they guard happen atomically with respect to `barge_in`.

use super::SoftBargeInPolicy;
use crate::audio::PcmAudio;
use crate::events::PipelineEvent;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;

/// `(epoch, sequence)`
pub(crate) type Key = (u64, u64);

/// A unit of text waiting for synthesis
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Sentence {
    pub epoch: u64,
    pub sequence: u64,
    pub text: String,
}

/// Output of one synthesis job; `audio` is `None` when synthesis failed
#[derive(Debug, Clone)]
pub(crate) struct SynthesisResult {
    pub text: String,
    pub audio: Option<PcmAudio>,
}

/// The sentence the player has taken out of the results map
#[derive(Debug, Clone)]
pub(crate) struct NowPlaying {
    pub epoch: u64,
    pub sequence: u64,
    /// Audio is going to the device; before this it is waiting on the gate
    pub started: bool,
}

#[derive(Debug)]
pub(crate) struct State {
    /// Current epoch; ingestion and synthesis only produce for this one
    pub epoch: u64,
    /// Next sequence number ingestion hands out in `epoch`
    pub next_assign_seq: u64,

    /// Unsegmented text for `epoch`
    pub buffer: String,
    /// Fragments and the close marker sent to ingestion but not yet handled
    pub pending_input: usize,

    pub sentences: VecDeque<Sentence>,
    pub sentence_capacity: usize,
    /// Sentences a worker is synthesizing right now
    pub in_flight: Vec<Key>,
    pub results: BTreeMap<Key, SynthesisResult>,

    /// Playback cursor
    pub player_epoch: u64,
    pub next_sequence: u64,
    pub now_playing: Option<NowPlaying>,
    pub last_spoken: Option<String>,

    pub gate_open: bool,
    /// Close the gate once the current epoch has nothing left to play
    pub close_gate_when_idle: bool,
    /// The one sentence `skip_current` was aimed at
    pub skip_requested: Option<Key>,

    pub soft_policy: SoftBargeInPolicy,

    /// No more input accepted
    pub closed: bool,
    /// Ingestion has flushed its last sentence
    pub ingest_done: bool,
    /// Threads should exit as soon as possible
    pub stopping: bool,
}

impl State {
    pub fn new(sentence_capacity: usize, autoplay: bool, soft_policy: SoftBargeInPolicy) -> Self {
        Self {
            epoch: 0,
            next_assign_seq: 0,
            buffer: String::new(),
            pending_input: 0,
            sentences: VecDeque::with_capacity(sentence_capacity),
            sentence_capacity: sentence_capacity.max(1),
            in_flight: Vec::new(),
            results: BTreeMap::new(),
            player_epoch: 0,
            next_sequence: 0,
            now_playing: None,
            last_spoken: None,
            gate_open: autoplay,
            close_gate_when_idle: false,
            skip_requested: None,
            soft_policy,
            closed: false,
            ingest_done: false,
            stopping: false,
        }
    }

    /// Work that will still reach the speaker in the epoch being played or adopted
    pub fn has_pending_work(&self) -> bool {
        self.pending_input > 0
            || !self.sentences.is_empty()
            || self.in_flight.iter().any(|&(epoch, _)| epoch == self.epoch)
            || self.results.keys().any(|&(epoch, _)| epoch >= self.player_epoch)
            || self.player_epoch < self.epoch
    }

    pub fn is_playing(&self) -> bool {
        !self.stopping && (self.now_playing.is_some() || self.has_pending_work())
    }

    /// Input is closed and nothing is left to play
    pub fn is_drained(&self) -> bool {
        self.closed && self.ingest_done && self.now_playing.is_none() && !self.has_pending_work()
    }

    pub fn queue_full(&self) -> bool {
        self.sentences.len() >= self.sentence_capacity
    }

    /// Synthesized or in-flight audio of the current epoch fills the results budget
    pub fn results_full(&self) -> bool {
        let epoch = self.epoch;
        let held = self.results.keys().filter(|k| k.0 == epoch).count()
            + self.in_flight.iter().filter(|k| k.0 == epoch).count();
        held >= self.sentence_capacity
    }

    /// Aim a skip at the sentence on the device, or the next one at the cursor
    pub fn request_skip(&mut self) -> Key {
        let key = match &self.now_playing {
            Some(playing) => (playing.epoch, playing.sequence),
            None => (self.player_epoch, self.next_sequence),
        };
        self.skip_requested = Some(key);
        key
    }

    pub fn skip_pending_for(&self, key: Key) -> bool {
        self.skip_requested == Some(key)
    }

    /// `key` is done with, however it ended; a skip aimed at it is spent
    pub fn settle_skip(&mut self, key: Key) {
        if self.skip_pending_for(key) {
            self.skip_requested = None;
        }
    }

    /// Assign the next sequence number and queue a sentence of the current epoch
    pub fn enqueue(&mut self, text: String) -> Sentence {
        let sentence = Sentence {
            epoch: self.epoch,
            sequence: self.next_assign_seq,
            text,
        };
        self.next_assign_seq += 1;
        self.sentences.push_back(sentence.clone());
        sentence
    }

    /// Store a finished synthesis if its epoch is still current.
    ///
    /// Returns `false` when the result was stale and dropped.
    pub fn store_result(&mut self, sentence: &Sentence, audio: Option<PcmAudio>) -> bool {
        self.in_flight
            .retain(|&key| key != (sentence.epoch, sentence.sequence));
        if sentence.epoch != self.epoch || sentence.epoch < self.player_epoch {
            return false;
        }
        self.results.insert(
            (sentence.epoch, sentence.sequence),
            SynthesisResult {
                text: sentence.text.clone(),
                audio,
            },
        );
        true
    }

    /// Start a new epoch, discarding queued and buffered text
    fn advance_epoch(&mut self) -> u64 {
        self.epoch += 1;
        self.next_assign_seq = 0;
        self.buffer.clear();
        self.sentences.clear();
        self.skip_requested = None;
        self.epoch
    }

    /// Hard interrupt: everything older than the new epoch is dead on return
    pub fn begin_hard_epoch(&mut self, inject: Option<String>) -> (u64, Option<Sentence>) {
        let epoch = self.advance_epoch();
        self.results.clear();
        self.player_epoch = epoch;
        self.next_sequence = 0;
        let injected = inject.map(|text| self.enqueue(text));
        (epoch, injected)
    }

    /// Soft interrupt: the sentence on the device may finish, then the player switches
    pub fn begin_soft_epoch(&mut self) -> u64 {
        let epoch = self.advance_epoch();
        match self.soft_policy {
            SoftBargeInPolicy::DiscardReady => self.results.clear(),
            SoftBargeInPolicy::FinishReady => {
                // Keep the synthesized run that directly follows the cursor
                let player_epoch = self.player_epoch;
                let mut next = self.next_sequence;
                if let Some(playing) = &self.now_playing {
                    if playing.epoch == player_epoch {
                        next = playing.sequence + 1;
                    }
                }
                let mut keep = BTreeMap::new();
                while let Some(result) = self.results.remove(&(player_epoch, next)) {
                    keep.insert((player_epoch, next), result);
                    next += 1;
                }
                self.results = keep;
            }
        }
        epoch
    }

    /// Move the player cursor to the current epoch
    pub fn adopt_current_epoch(&mut self) {
        self.player_epoch = self.epoch;
        self.next_sequence = 0;
        let player_epoch = self.player_epoch;
        self.results.retain(|&(epoch, _), _| epoch >= player_epoch);
        if self.skip_requested.is_some_and(|(epoch, _)| epoch < player_epoch) {
            self.skip_requested = None;
        }
    }
}

/// The state plus its condition variable and the event fan-out
pub(crate) struct Shared {
    state: Mutex<State>,
    changed: Condvar,
    events: broadcast::Sender<PipelineEvent>,
}

impl Shared {
    pub fn new(state: State, events: broadcast::Sender<PipelineEvent>) -> Self {
        Self {
            state: Mutex::new(state),
            changed: Condvar::new(),
            events,
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn wait<'a>(&self, guard: MutexGuard<'a, State>) -> MutexGuard<'a, State> {
        self.changed
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn wait_timeout<'a>(
        &self,
        guard: MutexGuard<'a, State>,
        timeout: Duration,
    ) -> MutexGuard<'a, State> {
        match self.changed.wait_timeout(guard, timeout) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }

    pub fn notify(&self) {
        self.changed.notify_all();
    }

    pub fn emit(&self, event: PipelineEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }
}
