//! Synthesis stage: one of N workers turning sentences into audio

use super::state::{Sentence, Shared};
use crate::events::PipelineEvent;
use crate::synthesis::Synthesizer;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

pub(crate) fn run(shared: Arc<Shared>, synthesizer: Arc<dyn Synthesizer>, id: usize) {
    while let Some(sentence) = next_sentence(&shared) {
        let started = Instant::now();
        let outcome = synthesizer.synthesize(&sentence.text);

        let mut st = shared.lock();
        if st.stopping {
            break;
        }

        let (audio, error) = match outcome {
            Ok(audio) => (Some(audio), None),
            Err(e) => (None, Some(e.to_string())),
        };
        let failed = audio.is_none();

        if st.store_result(&sentence, audio) {
            debug!(
                "Worker {} finished {}:{} in {} ms",
                id,
                sentence.epoch,
                sentence.sequence,
                started.elapsed().as_millis()
            );
            if let Some(error) = error {
                warn!(
                    "Synthesis failed for {}:{} {:?}: {}",
                    sentence.epoch, sentence.sequence, sentence.text, error
                );
                shared.emit(PipelineEvent::SynthesisFailed {
                    epoch: sentence.epoch,
                    sequence: sentence.sequence,
                    error,
                });
            }
        } else {
            debug!(
                "Worker {} discarded {}:{} from superseded epoch (failed: {})",
                id, sentence.epoch, sentence.sequence, failed
            );
        }
        drop(st);
        shared.notify();
    }
    debug!("Synthesis worker {} exiting", id);
}

/// Block until a sentence is available; `None` means the worker should exit.
///
/// Waits while the current epoch already holds a full budget of results, so a
/// closed gate cannot make stored audio grow without bound.
fn next_sentence(shared: &Shared) -> Option<Sentence> {
    let mut st = shared.lock();
    loop {
        if st.stopping {
            return None;
        }
        if !st.sentences.is_empty() && st.results_full() {
            st = shared.wait(st);
            continue;
        }
        if let Some(sentence) = st.sentences.pop_front() {
            st.in_flight.push((sentence.epoch, sentence.sequence));
            drop(st);
            // Ingestion may be waiting for room
            shared.notify();
            return Some(sentence);
        }
        if st.ingest_done {
            return None;
        }
        st = shared.wait(st);
    }
}
