//! Voice activity detection
//!
//! Frames are classified one at a time by a [`FrameClassifier`] and debounced
//! by counting consecutive voiced frames. Frames the [`EchoGate`] recognizes
//! as the agent's own voice count as silence.

use crate::audio::{check_frame_format, AudioFrame};
use crate::config::{AudioConfig, VadConfig};
use crate::device::FrameSource;
use crate::echo_gate::EchoGate;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, span, warn, Level};
use webrtc_vad::{SampleRate, Vad, VadMode};

/// Backoff after a short read so a starved source does not spin
const SHORT_READ_BACKOFF: Duration = Duration::from_millis(2);

/// Error type for voice activity detection
#[derive(Debug, thiserror::Error)]
pub enum VadError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Classifier error: {0}")]
    Classifier(String),
}

pub type Result<T> = std::result::Result<T, VadError>;

/// Which classifier the listener uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum ClassifierKind {
    #[default]
    #[serde(rename = "webrtc")]
    WebRtc,
    #[serde(rename = "loudness")]
    Loudness,
}

/// Per-frame speech / non-speech decision
pub trait FrameClassifier {
    fn is_speech(&mut self, frame: &AudioFrame) -> Result<bool>;
}

/// WebRTC VAD classifier.
///
/// The underlying handle is not `Send`; build it on the thread that uses it.
pub struct WebRtcClassifier {
    vad: Vad,
}

impl WebRtcClassifier {
    pub fn new(sample_rate: u32, aggressiveness: u8) -> Result<Self> {
        let rate = match sample_rate {
            8_000 => SampleRate::Rate8kHz,
            16_000 => SampleRate::Rate16kHz,
            32_000 => SampleRate::Rate32kHz,
            48_000 => SampleRate::Rate48kHz,
            other => {
                return Err(VadError::Config(format!(
                    "WebRTC VAD only supports 8000, 16000, 32000, or 48000 Hz, got {}",
                    other
                )))
            }
        };
        let mode = match aggressiveness {
            0 => VadMode::Quality,
            1 => VadMode::LowBitrate,
            2 => VadMode::Aggressive,
            3 => VadMode::VeryAggressive,
            other => {
                return Err(VadError::Config(format!(
                    "VAD aggressiveness must be 0-3, got {}",
                    other
                )))
            }
        };
        Ok(Self {
            vad: Vad::new_with_rate_and_mode(rate, mode),
        })
    }
}

impl FrameClassifier for WebRtcClassifier {
    fn is_speech(&mut self, frame: &AudioFrame) -> Result<bool> {
        self.vad
            .is_voice_segment(frame.samples())
            .map_err(|_| VadError::Classifier(format!("invalid frame length {}", frame.len())))
    }
}

/// Loudness classifier: a frame is speech when its normalized RMS reaches the threshold
pub struct LoudnessClassifier {
    threshold: f32,
}

impl LoudnessClassifier {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }
}

impl FrameClassifier for LoudnessClassifier {
    fn is_speech(&mut self, frame: &AudioFrame) -> Result<bool> {
        Ok(frame.rms() >= self.threshold)
    }
}

/// Debounce state, owned by whoever runs the listening loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VadState {
    /// Consecutive frames matching what the loop is waiting for
    pub consecutive_count: usize,

    /// A listening loop is currently running
    pub armed: bool,
}

impl VadState {
    fn reset(&mut self) {
        self.consecutive_count = 0;
    }
}

/// How a listening loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenOutcome {
    /// The consecutive-frame threshold was reached
    Detected,
    TimedOut,
    Cancelled,
    /// The source failed; the loop was abandoned
    DeviceFailed,
}

impl ListenOutcome {
    pub fn detected(self) -> bool {
        self == ListenOutcome::Detected
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Speech,
    Silence,
}

/// Debounced voice activity detector
pub struct VoiceActivityDetector {
    classifier: Box<dyn FrameClassifier>,
    sample_rate: u32,
    frame_ms: u32,
    state: VadState,
}

impl VoiceActivityDetector {
    /// Build a detector for frames of `frame_ms` at `sample_rate`
    pub fn new(
        sample_rate: u32,
        frame_ms: u32,
        classifier: Box<dyn FrameClassifier>,
    ) -> Result<Self> {
        check_frame_format(sample_rate, frame_ms).map_err(|e| VadError::Config(e.to_string()))?;
        Ok(Self {
            classifier,
            sample_rate,
            frame_ms,
            state: VadState::default(),
        })
    }

    /// WebRTC-backed detector
    pub fn webrtc(sample_rate: u32, frame_ms: u32, aggressiveness: u8) -> Result<Self> {
        let classifier = WebRtcClassifier::new(sample_rate, aggressiveness)?;
        Self::new(sample_rate, frame_ms, Box::new(classifier))
    }

    pub fn from_config(audio: &AudioConfig, vad: &VadConfig) -> Result<Self> {
        match vad.classifier {
            ClassifierKind::WebRtc => {
                Self::webrtc(audio.sample_rate, audio.frame_ms, vad.aggressiveness)
            }
            ClassifierKind::Loudness => Self::new(
                audio.sample_rate,
                audio.frame_ms,
                Box::new(LoudnessClassifier::new(vad.loudness_threshold)),
            ),
        }
    }

    pub fn state(&self) -> VadState {
        self.state
    }

    /// Classify one frame; classifier errors count as non-speech
    pub fn classify(&mut self, frame: &AudioFrame) -> bool {
        match self.classifier.is_speech(frame) {
            Ok(voiced) => voiced,
            Err(e) => {
                warn!("VAD classification failed: {}", e);
                false
            }
        }
    }

    /// Wait for `min_consecutive_speech_frames` voiced, non-echo frames in a row.
    ///
    /// Returns `false` on timeout, cancellation or device failure.
    pub fn listen_until_voice(
        &mut self,
        source: &mut dyn FrameSource,
        min_consecutive_speech_frames: usize,
        timeout: Option<Duration>,
        echo_gate: Option<&EchoGate>,
        cancel: Option<&AtomicBool>,
    ) -> bool {
        self.listen(
            source,
            min_consecutive_speech_frames,
            timeout,
            echo_gate,
            cancel,
        )
        .detected()
    }

    /// Speech-start loop with the full outcome
    pub fn listen(
        &mut self,
        source: &mut dyn FrameSource,
        min_consecutive_speech_frames: usize,
        timeout: Option<Duration>,
        echo_gate: Option<&EchoGate>,
        cancel: Option<&AtomicBool>,
    ) -> ListenOutcome {
        let _span = span!(Level::DEBUG, "vad.listen_until_voice").entered();
        self.run(
            source,
            Target::Speech,
            min_consecutive_speech_frames,
            timeout,
            echo_gate,
            cancel,
        )
    }

    /// Wait for `min_consecutive_silence_frames` unvoiced frames in a row.
    ///
    /// Echo frames count as silence here, since they are not the user.
    pub fn listen_until_silence(
        &mut self,
        source: &mut dyn FrameSource,
        min_consecutive_silence_frames: usize,
        timeout: Option<Duration>,
        echo_gate: Option<&EchoGate>,
        cancel: Option<&AtomicBool>,
    ) -> ListenOutcome {
        let _span = span!(Level::DEBUG, "vad.listen_until_silence").entered();
        self.run(
            source,
            Target::Silence,
            min_consecutive_silence_frames,
            timeout,
            echo_gate,
            cancel,
        )
    }

    fn run(
        &mut self,
        source: &mut dyn FrameSource,
        target: Target,
        min_frames: usize,
        timeout: Option<Duration>,
        echo_gate: Option<&EchoGate>,
        cancel: Option<&AtomicBool>,
    ) -> ListenOutcome {
        if source.sample_rate() != self.sample_rate || source.frame_ms() != self.frame_ms {
            error!(
                "Frame source delivers {} ms @ {} Hz but detector expects {} ms @ {} Hz",
                source.frame_ms(),
                source.sample_rate(),
                self.frame_ms,
                self.sample_rate
            );
            return ListenOutcome::DeviceFailed;
        }

        let min_frames = min_frames.max(1);
        let deadline = timeout.map(|t| Instant::now() + t);
        self.state = VadState {
            consecutive_count: 0,
            armed: true,
        };

        let outcome = loop {
            if cancel.is_some_and(|c| c.load(Ordering::Acquire)) {
                break ListenOutcome::Cancelled;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                break ListenOutcome::TimedOut;
            }

            let frame = match source.read_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    // Transient; keep the current run
                    std::thread::sleep(SHORT_READ_BACKOFF);
                    continue;
                }
                Err(e) => {
                    error!("Audio input failed while listening: {}", e);
                    break ListenOutcome::DeviceFailed;
                }
            };

            let voiced = self.classify(&frame);
            let echo = voiced && echo_gate.is_some_and(|gate| gate.is_echo_like(&frame));
            let user_speech = voiced && !echo;

            let matches = match target {
                Target::Speech => user_speech,
                Target::Silence => !user_speech,
            };

            if matches {
                self.state.consecutive_count += 1;
                if self.state.consecutive_count >= min_frames {
                    debug!(
                        "{:?} confirmed after {} consecutive frames",
                        target, self.state.consecutive_count
                    );
                    break ListenOutcome::Detected;
                }
            } else {
                if echo {
                    debug!("Voiced frame matched far-end audio, ignoring");
                }
                self.state.reset();
            }
        };

        self.state = VadState::default();
        outcome
    }
}
