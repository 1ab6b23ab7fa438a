//! Ingest stage: raw fragments in, numbered sentences out

use super::segment::SentenceSegmenter;
use super::state::{Shared, State};
use crate::events::PipelineEvent;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, MutexGuard};
use tracing::{debug, info};

/// Messages accepted by the ingest thread
#[derive(Debug)]
pub(crate) enum IngestMsg {
    /// A fragment pushed while `epoch` was current
    Text { epoch: u64, text: String },
    /// No more input; flush the buffer
    Close,
}

pub(crate) fn run(shared: Arc<Shared>, rx: Receiver<IngestMsg>, segmenter: SentenceSegmenter) {
    while let Ok(msg) = rx.recv() {
        let mut st = shared.lock();
        let finished = match msg {
            IngestMsg::Text { epoch, text } => {
                if epoch == st.epoch && !st.stopping {
                    st.buffer.push_str(&text);
                    st = emit_sentences(&shared, st, &segmenter, false);
                } else {
                    debug!("Dropping fragment from superseded epoch {}", epoch);
                }
                false
            }
            IngestMsg::Close => {
                st = emit_sentences(&shared, st, &segmenter, true);
                st.ingest_done = true;
                info!("📥 Input closed after epoch {} sequence {}", st.epoch, st.next_assign_seq);
                true
            }
        };
        st.pending_input = st.pending_input.saturating_sub(1);
        let stopping = st.stopping;
        drop(st);
        shared.notify();

        if finished || stopping {
            break;
        }
    }

    // Either closed normally or the sender went away during shutdown
    let mut st = shared.lock();
    st.ingest_done = true;
    drop(st);
    shared.notify();
    debug!("Ingest stage exiting");
}

/// Cut every complete sentence out of the buffer and queue it.
///
/// Blocks while the sentence queue is full. Gives up on the remaining text if
/// the epoch changes while waiting, since that text is then stale.
fn emit_sentences<'a>(
    shared: &Shared,
    mut st: MutexGuard<'a, State>,
    segmenter: &SentenceSegmenter,
    flush: bool,
) -> MutexGuard<'a, State> {
    let epoch = st.epoch;
    while let Some(text) = segmenter.next_sentence(&mut st.buffer, flush) {
        while st.queue_full() && st.epoch == epoch && !st.stopping {
            st = shared.wait(st);
        }
        if st.epoch != epoch || st.stopping {
            break;
        }
        let sentence = st.enqueue(text);
        debug!(
            "Queued sentence {}:{} {:?}",
            sentence.epoch, sentence.sequence, sentence.text
        );
        shared.emit(PipelineEvent::SentenceQueued {
            epoch: sentence.epoch,
            sequence: sentence.sequence,
            text: sentence.text,
        });
        shared.notify();
    }
    st
}
