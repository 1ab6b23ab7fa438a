//! Event types shared between the speech pipeline and the turn controller

/// Progress notifications from the speech pipeline.
///
/// Broadcast to any number of observers; a slow observer only loses events,
/// it never stalls playback.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    /// Ingestion cut a sentence and queued it for synthesis
    SentenceQueued {
        epoch: u64,
        sequence: u64,
        text: String,
    },
    /// The player opened the device for a sentence
    SentenceStarted {
        epoch: u64,
        sequence: u64,
        text: String,
    },
    /// Playback of a sentence ended, normally or cut short
    SentenceFinished {
        epoch: u64,
        sequence: u64,
        interrupted: bool,
    },
    /// A sentence was passed over without playing
    SentenceSkipped { epoch: u64, sequence: u64 },
    /// Synthesis failed after its retry; the sentence will be skipped
    SynthesisFailed {
        epoch: u64,
        sequence: u64,
        error: String,
    },
    /// The player moved to a new epoch
    EpochChanged { epoch: u64 },
    /// Input closed and every queued sentence has been handled
    Drained,
}

/// Input to the turn controller's control loop
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    /// The listener confirmed the user started talking
    SpeechStarted,
    /// A transcript from speech-to-text
    Transcript { text: String, is_final: bool },
    /// The microphone failed; the listener will retry
    ListenerFailed(String),
    /// Stop the conversation loop
    Shutdown,
}
