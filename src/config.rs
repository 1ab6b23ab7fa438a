//! Engine configuration
//!
//! Every section deserializes from one JSON file with per-field
//! defaults, so a partial file only overrides what it names. Validation is
//! strict: a frame format WebRTC VAD cannot classify is rejected before any
//! thread is spawned.

use crate::pipeline::SoftBargeInPolicy;
use crate::synthesis::Prosody;
use crate::vad::ClassifierKind;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Top level configuration tree
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub audio: AudioConfig,
    pub vad: VadConfig,
    pub echo_gate: EchoGateConfig,
    pub synthesis: SynthesisConfig,
    pub pipeline: PipelineConfig,
    pub turn: TurnConfig,
    pub llm: LlmConfig,
}

/// Microphone and speaker settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Capture sample rate in Hz (8000, 16000, 32000 or 48000)
    pub sample_rate: u32,

    /// Frame duration in milliseconds (10, 20 or 30)
    pub frame_ms: u32,

    /// PulseAudio source name, `None` for the default microphone
    pub input_device: Option<String>,

    /// PulseAudio sink name, `None` for the default speaker
    pub output_device: Option<String>,

    /// Target playback buffer in milliseconds; audio is published to the
    /// echo gate when written, so keep this under `echo_gate.max_lag_ms`
    pub playback_buffer_ms: u32,

    /// Application name reported to PulseAudio
    pub app_name: String,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            frame_ms: 20,
            input_device: None,
            output_device: None,
            playback_buffer_ms: 60,
            app_name: "halolive".to_string(),
        }
    }
}

/// Voice activity detection thresholds
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Frame classifier used by the listener
    pub classifier: ClassifierKind,

    /// WebRTC aggressiveness, 0 = permissive, 3 = strict
    pub aggressiveness: u8,

    /// Consecutive voiced frames before speech counts as started
    pub start_frames: usize,

    /// Consecutive unvoiced frames before speech counts as ended
    pub end_frames: usize,

    /// Normalized RMS threshold for the loudness classifier
    pub loudness_threshold: f32,

    /// Per-listen timeout in milliseconds, `None` waits until cancelled
    pub listen_timeout_ms: Option<u64>,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            classifier: ClassifierKind::WebRtc,
            aggressiveness: 3,
            start_frames: 3,
            end_frames: 25,
            loudness_threshold: 0.05,
            listen_timeout_ms: None,
        }
    }
}

impl VadConfig {
    pub fn listen_timeout(&self) -> Option<Duration> {
        self.listen_timeout_ms.map(Duration::from_millis)
    }
}

/// Far-end correlation gate
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EchoGateConfig {
    pub enabled: bool,

    /// Far-end history kept for correlation, in milliseconds
    pub buffer_ms: u64,

    /// Correlation at or above this value marks a frame as echo
    pub threshold: f32,

    /// Largest acoustic delay searched, in milliseconds
    pub max_lag_ms: u64,
}

impl Default for EchoGateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            buffer_ms: 1_000,
            threshold: 0.60,
            max_lag_ms: 95,
        }
    }
}

/// Synthesis service endpoint and voice
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    pub base_url: String,
    pub speaker: u32,
    pub query_timeout_ms: u64,
    pub synthesis_timeout_ms: u64,
    pub prosody: Prosody,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:50021".to_string(),
            speaker: 89,
            query_timeout_ms: 15_000,
            synthesis_timeout_ms: 60_000,
            prosody: Prosody::default(),
        }
    }
}

impl SynthesisConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn synthesis_timeout(&self) -> Duration {
        Duration::from_millis(self.synthesis_timeout_ms)
    }
}

/// Speech pipeline sizing and behavior
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Buffered characters that force a sentence cut without punctuation
    pub max_sentence_len: usize,

    /// Sentences waiting for a synthesis worker before ingestion blocks
    pub sentence_queue: usize,

    /// Raw text fragments waiting for ingestion before `push_text` blocks
    pub input_queue: usize,

    /// Number of synthesis worker threads
    pub workers: usize,

    /// Start with the playback gate open
    pub autoplay: bool,

    /// What a soft barge-in does with already synthesized sentences
    pub soft_barge_in: SoftBargeInPolicy,

    /// Playback chunk size, bounds hard interrupt latency
    pub chunk_ms: u32,

    /// Per-thread join timeout during shutdown
    pub join_timeout_ms: u64,

    /// How long shutdown lets queued speech drain before stopping
    pub drain_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_sentence_len: 80,
            sentence_queue: 32,
            input_queue: 1024,
            workers: 2,
            autoplay: true,
            soft_barge_in: SoftBargeInPolicy::DiscardReady,
            chunk_ms: 20,
            join_timeout_ms: 2_000,
            drain_timeout_ms: 30_000,
        }
    }
}

impl PipelineConfig {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// A single misrecognition fix-up applied to transcripts
#[derive(Debug, Clone, Deserialize)]
pub struct Replacement {
    pub from: String,
    pub to: String,
}

/// Conversation loop settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TurnConfig {
    pub assistant_name: String,
    pub user_name: String,

    /// Similarity to the last spoken sentence that marks a transcript as self-echo
    pub echo_similarity: f32,

    /// Coherence score below which a transcript is treated as noise
    pub coherence_threshold: f32,

    /// Fragments shorter than this count as noise in single-sentence input
    pub min_fragment_chars: usize,

    /// Transcripts containing any of these end the session
    pub exit_words: Vec<String>,
    pub farewell: String,

    /// Speech-to-text wait per turn in milliseconds
    pub stt_timeout_ms: u64,

    /// Consecutive collaborator failures before the failure counter resets
    pub max_failures: u32,

    /// Conversation lines kept as model context
    pub history_lines: usize,

    pub system_prompt: String,
    pub replacements: Vec<Replacement>,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            assistant_name: "ハロ".to_string(),
            user_name: "ユーザー".to_string(),
            echo_similarity: 0.75,
            coherence_threshold: 0.45,
            min_fragment_chars: 4,
            exit_words: vec![
                "終了".to_string(),
                "バイバイ".to_string(),
                "さようなら".to_string(),
            ],
            farewell: "またね。".to_string(),
            stt_timeout_ms: 8_000,
            max_failures: 3,
            history_lines: 20,
            system_prompt: "あなたは親しみやすい音声アシスタントです。短く自然な話し言葉で答えてください。"
                .to_string(),
            replacements: Vec::new(),
        }
    }
}

impl TurnConfig {
    pub fn stt_timeout(&self) -> Duration {
        Duration::from_millis(self.stt_timeout_ms)
    }
}

/// OpenAI-compatible chat completions endpoint
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,

    /// Environment variable holding the bearer key
    pub api_key_env: String,
    pub timeout_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_ms: 30_000,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file.
    ///
    /// A missing file yields the defaults; a malformed one is an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config = match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str::<EngineConfig>(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("⚙️ No config at {}, using defaults", path.display());
                EngineConfig::default()
            }
            Err(e) => return Err(e.into()),
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a JSON string and validate it
    pub fn from_json(text: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        crate::audio::check_frame_format(self.audio.sample_rate, self.audio.frame_ms)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        if self.vad.aggressiveness > 3 {
            return Err(ConfigError::Invalid(format!(
                "VAD aggressiveness must be 0-3, got {}",
                self.vad.aggressiveness
            )));
        }
        if self.vad.start_frames == 0 || self.vad.end_frames == 0 {
            return Err(ConfigError::Invalid(
                "VAD start/end frame thresholds must be at least 1".to_string(),
            ));
        }
        if !(self.echo_gate.threshold > 0.0 && self.echo_gate.threshold <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "echo gate threshold must be in (0, 1], got {}",
                self.echo_gate.threshold
            )));
        }
        if self.pipeline.workers == 0 {
            return Err(ConfigError::Invalid(
                "pipeline needs at least one synthesis worker".to_string(),
            ));
        }
        if self.pipeline.max_sentence_len == 0 {
            return Err(ConfigError::Invalid(
                "max sentence length must be at least 1".to_string(),
            ));
        }
        if self.pipeline.sentence_queue == 0 || self.pipeline.input_queue == 0 {
            return Err(ConfigError::Invalid(
                "pipeline queues must hold at least one item".to_string(),
            ));
        }
        if self.pipeline.chunk_ms == 0 {
            return Err(ConfigError::Invalid(
                "playback chunk must be at least 1 ms".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.audio.sample_rate, 16_000);
        assert_eq!(config.audio.frame_ms, 20);
        assert_eq!(config.pipeline.max_sentence_len, 80);
        assert_eq!(config.pipeline.workers, 2);
        assert_eq!(config.synthesis.speaker, 89);
    }

    #[test]
    fn test_partial_json_keeps_other_defaults() {
        let config = EngineConfig::from_json(
            r#"{ "pipeline": { "workers": 4 }, "echo_gate": { "threshold": 0.4 } }"#,
        )
        .unwrap();
        assert_eq!(config.pipeline.workers, 4);
        assert_eq!(config.pipeline.sentence_queue, 32);
        assert!((config.echo_gate.threshold - 0.4).abs() < f32::EPSILON);
        assert_eq!(config.echo_gate.max_lag_ms, 95);
    }

    #[test]
    fn test_prosody_and_policy_from_json() {
        let config = EngineConfig::from_json(
            r#"{
                "synthesis": { "prosody": { "speedScale": 1.2 } },
                "pipeline": { "soft_barge_in": "finish_ready" },
                "vad": { "classifier": "loudness" }
            }"#,
        )
        .unwrap();
        assert!((config.synthesis.prosody.speed_scale - 1.2).abs() < 1e-6);
        assert!((config.synthesis.prosody.pre_phoneme_length - 0.1).abs() < 1e-6);
        assert_eq!(config.pipeline.soft_barge_in, SoftBargeInPolicy::FinishReady);
        assert_eq!(config.vad.classifier, ClassifierKind::Loudness);
    }

    #[test]
    fn test_invalid_frame_duration_rejected() {
        let err = EngineConfig::from_json(r#"{ "audio": { "frame_ms": 25 } }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_invalid_sample_rate_rejected() {
        let err = EngineConfig::from_json(r#"{ "audio": { "sample_rate": 44100 } }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let err = EngineConfig::from_json(r#"{ "pipeline": { "workers": 0 } }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_malformed_json_is_parse_error() {
        let err = EngineConfig::from_json("{ not json").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = EngineConfig::load("/nonexistent/halolive/config.json").unwrap();
        assert_eq!(config.vad.start_frames, 3);
    }
}
