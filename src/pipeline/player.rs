//! Player stage: plays results strictly in (epoch, sequence) order

use super::state::{Key, NowPlaying, Shared, SynthesisResult};
use super::SoftBargeInPolicy;
use crate::audio::PcmAudio;
use crate::device::{AudioSink, PlaybackStream};
use crate::echo_gate::EchoGate;
use crate::events::PipelineEvent;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Why playback of a sentence stopped early
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cut {
    /// Shutdown
    Stopping,
    /// A hard barge-in moved the cursor to a newer epoch
    Superseded,
    /// `skip_current`
    Skipped,
    /// The device failed mid-sentence
    DeviceError,
}

pub(crate) struct Player {
    pub shared: Arc<Shared>,
    pub sink: Arc<dyn AudioSink>,
    pub echo_gate: Option<Arc<EchoGate>>,
    pub chunk_ms: u32,
}

impl Player {
    pub fn run(self) {
        while let Some((key, result)) = self.next_result() {
            match result.audio {
                Some(audio) if !audio.is_empty() => {
                    if self.wait_for_gate(key, &result.text) {
                        self.play(key, &result.text, &audio);
                    }
                }
                _ => self.pass_over(key),
            }
        }
        debug!("Player exiting");
    }

    /// Wait for the result at the cursor; `None` once drained or stopping
    fn next_result(&self) -> Option<(Key, SynthesisResult)> {
        let mut st = self.shared.lock();
        loop {
            if st.stopping {
                return None;
            }

            let key = (st.player_epoch, st.next_sequence);
            if let Some(result) = st.results.remove(&key) {
                // A worker may be waiting for room in the results budget
                self.shared.notify();
                if st.skip_pending_for(key) {
                    st.skip_requested = None;
                    st.next_sequence += 1;
                    debug!("Skipping {}:{} before playback", key.0, key.1);
                    self.shared.emit(PipelineEvent::SentenceSkipped {
                        epoch: key.0,
                        sequence: key.1,
                    });
                    self.shared.notify();
                    continue;
                }
                st.now_playing = Some(NowPlaying {
                    epoch: key.0,
                    sequence: key.1,
                    started: false,
                });
                return Some((key, result));
            }

            if st.player_epoch < st.epoch {
                st.adopt_current_epoch();
                info!("🔀 Player switched to epoch {}", st.player_epoch);
                self.shared.emit(PipelineEvent::EpochChanged {
                    epoch: st.player_epoch,
                });
                self.shared.notify();
                continue;
            }

            if st.close_gate_when_idle && !st.has_pending_work() {
                st.gate_open = false;
                st.close_gate_when_idle = false;
                info!("⏸️ Queue flushed, playback gate closed");
                self.shared.notify();
            }

            if st.is_drained() {
                info!("📭 Speech pipeline drained");
                self.shared.emit(PipelineEvent::Drained);
                self.shared.notify();
                return None;
            }

            st = self.shared.wait(st);
        }
    }

    /// Hold a taken result until the gate opens.
    ///
    /// Returns `false` if it was abandoned while waiting.
    fn wait_for_gate(&self, key: Key, text: &str) -> bool {
        let mut st = self.shared.lock();
        loop {
            let abandon = if st.stopping {
                true
            } else if st.player_epoch != key.0 {
                debug!("{}:{} superseded before playback", key.0, key.1);
                true
            } else if st.skip_pending_for(key) {
                st.skip_requested = None;
                st.next_sequence += 1;
                self.shared.emit(PipelineEvent::SentenceSkipped {
                    epoch: key.0,
                    sequence: key.1,
                });
                true
            } else if st.epoch != key.0 && st.soft_policy == SoftBargeInPolicy::DiscardReady {
                // Soft barge-in arrived before this sentence reached the device
                debug!("{}:{} discarded by soft barge-in", key.0, key.1);
                true
            } else {
                false
            };

            if abandon {
                st.now_playing = None;
                drop(st);
                self.shared.notify();
                return false;
            }

            if st.gate_open {
                if let Some(playing) = st.now_playing.as_mut() {
                    playing.started = true;
                }
                st.last_spoken = Some(text.to_string());
                return true;
            }

            st = self.shared.wait(st);
        }
    }

    /// Advance past a sentence whose synthesis failed
    fn pass_over(&self, key: Key) {
        let mut st = self.shared.lock();
        st.now_playing = None;
        st.settle_skip(key);
        if st.player_epoch == key.0 && st.next_sequence == key.1 {
            st.next_sequence += 1;
        }
        drop(st);
        debug!("No audio for {}:{}, skipping", key.0, key.1);
        self.shared.emit(PipelineEvent::SentenceSkipped {
            epoch: key.0,
            sequence: key.1,
        });
        self.shared.notify();
    }

    fn interruption(&self, key: Key) -> Option<Cut> {
        let st = self.shared.lock();
        if st.stopping {
            Some(Cut::Stopping)
        } else if st.player_epoch != key.0 {
            Some(Cut::Superseded)
        } else if st.skip_pending_for(key) {
            Some(Cut::Skipped)
        } else {
            None
        }
    }

    fn play(&self, key: Key, text: &str, audio: &PcmAudio) {
        info!("🔊 Speaking {}:{} {:?}", key.0, key.1, text);
        crate::tdbg!("play start {}:{} ({} ms)", key.0, key.1, audio.duration_ms());
        self.shared.emit(PipelineEvent::SentenceStarted {
            epoch: key.0,
            sequence: key.1,
            text: text.to_string(),
        });

        let mut stream = match self.sink.open(audio.sample_rate) {
            Ok(stream) => stream,
            Err(e) => {
                error!("Could not open audio output: {}", e);
                self.finish(key, Some(Cut::DeviceError));
                return;
            }
        };

        let started = Instant::now();
        let mut cut = None;
        for chunk in audio.samples.chunks(audio.chunk_len(self.chunk_ms)) {
            if let Some(reason) = self.interruption(key) {
                cut = Some(reason);
                break;
            }
            if let Some(gate) = &self.echo_gate {
                gate.publish_far_end_at(chunk, audio.sample_rate);
            }
            if let Err(e) = stream.write(chunk) {
                error!("Audio output failed mid-sentence: {}", e);
                cut = Some(Cut::DeviceError);
                break;
            }
        }

        // The device still holds up to one buffer of audio; stay interruptible
        // until it has had time to play out.
        if cut.is_none() {
            let total = Duration::from_millis(audio.duration_ms());
            let tick = Duration::from_millis(self.chunk_ms.max(5) as u64);
            while started.elapsed() + tick < total {
                if let Some(reason) = self.interruption(key) {
                    cut = Some(reason);
                    break;
                }
                std::thread::sleep(tick);
            }
        }

        let settle = match cut {
            Some(_) => stream.flush(),
            None => stream.drain(),
        };
        if let Err(e) = settle {
            warn!("Audio output did not settle cleanly: {}", e);
        }

        crate::tdbg!("play end {}:{} cut={:?}", key.0, key.1, cut);
        self.finish(key, cut);
    }

    fn finish(&self, key: Key, cut: Option<Cut>) {
        let mut st = self.shared.lock();
        st.now_playing = None;
        if st.player_epoch == key.0 && st.next_sequence == key.1 {
            st.next_sequence += 1;
        }
        st.settle_skip(key);
        drop(st);

        if let Some(reason) = cut {
            info!("⏹️ Sentence {}:{} cut short ({:?})", key.0, key.1, reason);
        }
        self.shared.emit(PipelineEvent::SentenceFinished {
            epoch: key.0,
            sequence: key.1,
            interrupted: cut.is_some(),
        });
        self.shared.notify();
    }
}
