//! Speech synthesis client
//!
//! Talks to a VOICEVOX-compatible engine: `POST /audio_query` returns a JSON
//! synthesis descriptor for the text, prosody fields are overlaid onto it, and
//! `POST /synthesis` renders the descriptor to a WAV file. Each step gets one
//! retry when the request never reached the server.

use crate::audio::{decode_wav, AudioError, PcmAudio};
use crate::config::SynthesisConfig;
use serde::{Deserialize, Serialize};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Error type for synthesis
#[derive(Debug, thiserror::Error)]
pub enum SynthesisError {
    #[error("Transport error during {step}: {message}")]
    Transport { step: &'static str, message: String },

    #[error("{step} returned HTTP {status}: {body}")]
    Status {
        step: &'static str,
        status: u16,
        body: String,
    },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<AudioError> for SynthesisError {
    fn from(e: AudioError) -> Self {
        SynthesisError::Decode(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SynthesisError>;

/// Text-to-speech backend used by the pipeline's worker pool.
///
/// Called concurrently from several worker threads.
pub trait Synthesizer: Send + Sync {
    fn synthesize(&self, text: &str) -> Result<PcmAudio>;
}

/// Prosody overrides applied to every synthesis descriptor
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Prosody {
    pub speed_scale: f32,
    pub pitch_scale: f32,
    pub intonation_scale: f32,
    pub volume_scale: f32,
    /// Leading silence in seconds
    pub pre_phoneme_length: f32,
    /// Trailing silence in seconds
    pub post_phoneme_length: f32,
    /// Raise pitch at the end of questions
    pub enable_interrogative_upspeak: bool,
}

impl Default for Prosody {
    fn default() -> Self {
        Self {
            speed_scale: 1.0,
            pitch_scale: 0.0,
            intonation_scale: 1.0,
            volume_scale: 1.0,
            pre_phoneme_length: 0.1,
            post_phoneme_length: 0.1,
            enable_interrogative_upspeak: true,
        }
    }
}

impl Prosody {
    /// Overwrite the prosody fields of a synthesis descriptor
    pub fn apply_to(&self, descriptor: &mut serde_json::Value) -> Result<()> {
        let fields = match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(fields)) => fields,
            Ok(_) => return Err(SynthesisError::Decode("prosody is not an object".into())),
            Err(e) => return Err(SynthesisError::Decode(e.to_string())),
        };
        let target = descriptor.as_object_mut().ok_or_else(|| {
            SynthesisError::Decode("synthesis descriptor is not a JSON object".into())
        })?;
        for (key, value) in fields {
            target.insert(key, value);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct Voice {
    speaker: u32,
    prosody: Prosody,
}

/// Blocking HTTP client for a VOICEVOX-compatible engine
pub struct VoiceVoxClient {
    base_url: String,
    client: reqwest::blocking::Client,
    voice: RwLock<Voice>,
    query_timeout: Duration,
    synthesis_timeout: Duration,
}

impl VoiceVoxClient {
    pub fn new(config: &SynthesisConfig) -> Result<Self> {
        if config.base_url.trim().is_empty() {
            return Err(SynthesisError::Config("synthesis base_url is empty".into()));
        }
        let client = reqwest::blocking::Client::builder()
            .build()
            .map_err(|e| SynthesisError::Config(e.to_string()))?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
            voice: RwLock::new(Voice {
                speaker: config.speaker,
                prosody: config.prosody,
            }),
            query_timeout: config.query_timeout(),
            synthesis_timeout: config.synthesis_timeout(),
        })
    }

    pub fn set_speaker(&self, speaker: u32) {
        self.voice
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .speaker = speaker;
    }

    pub fn set_prosody(&self, prosody: Prosody) {
        self.voice
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .prosody = prosody;
    }

    fn voice(&self) -> Voice {
        *self.voice.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Step 1: text to synthesis descriptor
    fn audio_query(&self, text: &str, speaker: u32) -> Result<serde_json::Value> {
        const STEP: &str = "audio_query";
        let speaker = speaker.to_string();
        let response = self
            .client
            .post(format!("{}/audio_query", self.base_url))
            .query(&[("text", text), ("speaker", speaker.as_str())])
            .timeout(self.query_timeout)
            .send()
            .map_err(|e| transport(STEP, e))?;
        let response = check_status(STEP, response)?;
        response
            .json::<serde_json::Value>()
            .map_err(|e| SynthesisError::Decode(format!("{}: {}", STEP, e)))
    }

    /// Step 2: descriptor to WAV bytes
    fn render(&self, descriptor: &serde_json::Value, speaker: u32) -> Result<Vec<u8>> {
        const STEP: &str = "synthesis";
        let response = self
            .client
            .post(format!("{}/synthesis", self.base_url))
            .query(&[("speaker", speaker.to_string())])
            .json(descriptor)
            .timeout(self.synthesis_timeout)
            .send()
            .map_err(|e| transport(STEP, e))?;
        let response = check_status(STEP, response)?;
        let bytes = response
            .bytes()
            .map_err(|e| transport(STEP, e))?;
        Ok(bytes.to_vec())
    }
}

impl Synthesizer for VoiceVoxClient {
    fn synthesize(&self, text: &str) -> Result<PcmAudio> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(PcmAudio::default());
        }

        let started = Instant::now();
        let voice = self.voice();

        let mut descriptor = with_retry("audio_query", || self.audio_query(text, voice.speaker))?;
        voice.prosody.apply_to(&mut descriptor)?;
        let wav = with_retry("synthesis", || self.render(&descriptor, voice.speaker))?;
        let audio = decode_wav(&wav)?;

        debug!(
            "Synthesized {} chars -> {} ms audio in {} ms",
            text.chars().count(),
            audio.duration_ms(),
            started.elapsed().as_millis()
        );
        Ok(audio)
    }
}

fn transport(step: &'static str, e: reqwest::Error) -> SynthesisError {
    SynthesisError::Transport {
        step,
        message: e.to_string(),
    }
}

fn check_status(
    step: &'static str,
    response: reqwest::blocking::Response,
) -> Result<reqwest::blocking::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    Err(SynthesisError::Status {
        step,
        status: status.as_u16(),
        body,
    })
}

/// Run `attempt`, retrying once if it failed at the transport level
pub(crate) fn with_retry<T>(step: &str, mut attempt: impl FnMut() -> Result<T>) -> Result<T> {
    match attempt() {
        Err(SynthesisError::Transport { message, .. }) => {
            warn!("{} transport failure ({}), retrying once", step, message);
            attempt()
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_prosody_overlays_descriptor() {
        let mut descriptor = serde_json::json!({
            "accent_phrases": [],
            "speedScale": 1.0,
            "outputSamplingRate": 24000
        });
        let prosody = Prosody {
            speed_scale: 1.25,
            ..Prosody::default()
        };
        prosody.apply_to(&mut descriptor).unwrap();

        assert_eq!(descriptor["speedScale"], serde_json::json!(1.25));
        assert_eq!(descriptor["prePhonemeLength"], serde_json::json!(0.1f32));
        assert_eq!(descriptor["enableInterrogativeUpspeak"], serde_json::json!(true));
        assert_eq!(descriptor["outputSamplingRate"], serde_json::json!(24000));
    }

    #[test]
    fn test_prosody_rejects_non_object_descriptor() {
        let mut descriptor = serde_json::json!([1, 2, 3]);
        assert!(Prosody::default().apply_to(&mut descriptor).is_err());
    }

    #[test]
    fn test_retry_once_on_transport_failure() {
        let calls = Cell::new(0);
        let result = with_retry("audio_query", || {
            calls.set(calls.get() + 1);
            if calls.get() == 1 {
                Err(SynthesisError::Transport {
                    step: "audio_query",
                    message: "connection refused".into(),
                })
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_retry_gives_up_after_second_failure() {
        let calls = Cell::new(0);
        let result: Result<()> = with_retry("synthesis", || {
            calls.set(calls.get() + 1);
            Err(SynthesisError::Transport {
                step: "synthesis",
                message: "timed out".into(),
            })
        });
        assert!(matches!(result, Err(SynthesisError::Transport { .. })));
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_status_errors_are_not_retried() {
        let calls = Cell::new(0);
        let result: Result<()> = with_retry("audio_query", || {
            calls.set(calls.get() + 1);
            Err(SynthesisError::Status {
                step: "audio_query",
                status: 422,
                body: "bad speaker".into(),
            })
        });
        assert!(matches!(result, Err(SynthesisError::Status { status: 422, .. })));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_unreachable_engine_reports_transport_error() {
        let config = SynthesisConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            query_timeout_ms: 500,
            ..SynthesisConfig::default()
        };
        let client = VoiceVoxClient::new(&config).unwrap();
        let err = client.synthesize("こんにちは。").unwrap_err();
        assert!(matches!(err, SynthesisError::Transport { step: "audio_query", .. }));
    }

    #[test]
    fn test_empty_text_skips_requests() {
        let client = VoiceVoxClient::new(&SynthesisConfig::default()).unwrap();
        assert!(client.synthesize("   ").unwrap().is_empty());
    }
}
