//! HaloLive - Full-duplex spoken conversation engine
//!
//! Listens on the microphone while it talks, tells the user's voice apart
//! from its own echo, and speaks replies through a pipelined synthesizer
//! that can be interrupted at any moment.

#![forbid(unsafe_code)]

/// Debug helpers (`tdbg!`)
#[macro_use]
pub mod util;

/// PCM frames, WAV and sample conversion helpers
pub mod audio;
/// Engine configuration loaded from JSON
pub mod config;
/// PulseAudio capture and playback behind small traits
pub mod device;
/// Cross-correlation gate against the agent's own playback
pub mod echo_gate;
/// Events emitted by the pipeline and consumed by the turn controller
pub mod events;
/// Microphone listener thread
pub mod listener;
/// Ordered, interruptible speech synthesis and playback
pub mod pipeline;
/// Chat completions client
pub mod responder;
/// Text-to-speech backends
pub mod synthesis;
/// Transcript filtering heuristics
pub mod transcript;
/// Conversation control loop
pub mod turn;
/// Debounced voice activity detection
pub mod vad;

#[cfg(test)]
pub(crate) mod testing;
