//! Audio primitives
//!
//! Fixed-size microphone frames, decoded far-end audio and the small amount of
//! sample arithmetic the rest of the engine needs. All audio is 16-bit mono
//! PCM; the microphone side runs at 8/16/32/48 kHz in 10/20/30 ms frames, which
//! is what WebRTC VAD accepts.

use std::io::Cursor;

/// Sample rates the voice activity classifier accepts
pub const SUPPORTED_SAMPLE_RATES: [u32; 4] = [8_000, 16_000, 32_000, 48_000];

/// Frame durations the voice activity classifier accepts
pub const SUPPORTED_FRAME_MS: [u32; 3] = [10, 20, 30];

/// Error type for audio operations
#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Format error: {0}")]
    Format(String),
}

pub type Result<T> = std::result::Result<T, AudioError>;

/// Reject frame formats the classifier cannot handle
pub fn check_frame_format(sample_rate: u32, frame_ms: u32) -> Result<()> {
    if !SUPPORTED_SAMPLE_RATES.contains(&sample_rate) {
        return Err(AudioError::Format(format!(
            "sample rate must be one of 8000, 16000, 32000, 48000 Hz, got {}",
            sample_rate
        )));
    }
    if !SUPPORTED_FRAME_MS.contains(&frame_ms) {
        return Err(AudioError::Format(format!(
            "frame duration must be 10, 20 or 30 ms, got {}",
            frame_ms
        )));
    }
    Ok(())
}

/// Number of samples in one frame
pub fn samples_per_frame(sample_rate: u32, frame_ms: u32) -> usize {
    (sample_rate as u64 * frame_ms as u64 / 1000) as usize
}

/// One microphone frame.
///
/// Immutable once built; stages pass it by value or borrow it.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Vec<i16>,
    sample_rate: u32,
    duration_ms: u32,
}

impl AudioFrame {
    /// Build a frame, checking that the sample count matches the nominal duration
    pub fn new(samples: Vec<i16>, sample_rate: u32, duration_ms: u32) -> Result<Self> {
        check_frame_format(sample_rate, duration_ms)?;
        let expected = samples_per_frame(sample_rate, duration_ms);
        if samples.len() != expected {
            return Err(AudioError::Format(format!(
                "{} ms frame at {} Hz needs {} samples, got {}",
                duration_ms,
                sample_rate,
                expected,
                samples.len()
            )));
        }
        Ok(Self {
            samples,
            sample_rate,
            duration_ms,
        })
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn duration_ms(&self) -> u32 {
        self.duration_ms
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Root mean square level normalized to [0, 1]
    pub fn rms(&self) -> f32 {
        rms(&self.samples)
    }

    pub fn into_samples(self) -> Vec<i16> {
        self.samples
    }
}

/// Decoded, playable mono audio
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PcmAudio {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

impl PcmAudio {
    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        self.samples.len() as u64 * 1000 / self.sample_rate as u64
    }

    /// Samples per playback chunk of `chunk_ms`
    pub fn chunk_len(&self, chunk_ms: u32) -> usize {
        samples_per_frame(self.sample_rate, chunk_ms).max(1)
    }
}

/// Normalized RMS of a block of samples, 0.0 for an empty block
pub fn rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples
        .iter()
        .map(|&s| {
            let v = s as f64 / 32768.0;
            v * v
        })
        .sum();
    (sum / samples.len() as f64).sqrt() as f32
}

/// Decode a RIFF/WAV container into mono PCM.
///
/// Only 16-bit integer data is accepted; multi-channel audio is averaged down.
pub fn decode_wav(bytes: &[u8]) -> Result<PcmAudio> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes))?;
    let spec = reader.spec();
    if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != 16 {
        return Err(AudioError::Format(format!(
            "expected 16-bit integer WAV, got {:?} {}-bit",
            spec.sample_format, spec.bits_per_sample
        )));
    }

    let interleaved = reader
        .samples::<i16>()
        .collect::<std::result::Result<Vec<i16>, _>>()?;

    let channels = spec.channels.max(1) as usize;
    let samples = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks_exact(channels)
            .map(|frame| {
                let sum: i32 = frame.iter().map(|&s| s as i32).sum();
                (sum / channels as i32) as i16
            })
            .collect()
    };

    Ok(PcmAudio::new(samples, spec.sample_rate))
}

/// Encode mono PCM as a 16-bit WAV file in memory
pub fn encode_wav(audio: &PcmAudio) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: audio.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for &sample in &audio.samples {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

/// Linear-interpolation resampler.
///
/// Good enough for the correlation reference, which only needs the waveform
/// shape at the microphone rate.
pub fn resample_linear(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 || to_rate == 0 {
        return samples.to_vec();
    }

    let out_len = (samples.len() as u64 * to_rate as u64 / from_rate as u64) as usize;
    let step = from_rate as f64 / to_rate as f64;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = pos.floor() as usize;
            if idx >= last {
                return samples[last];
            }
            let frac = pos - idx as f64;
            let a = samples[idx] as f64;
            let b = samples[idx + 1] as f64;
            (a + (b - a) * frac).round() as i16
        })
        .collect()
}

/// Convert i16 PCM samples to little-endian bytes
pub fn i16_slice_to_u8(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

/// Convert little-endian bytes to i16 PCM samples, ignoring a trailing odd byte
pub fn u8_to_i16_slice(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_format_validation() {
        assert!(check_frame_format(16_000, 20).is_ok());
        assert!(check_frame_format(48_000, 10).is_ok());
        assert!(check_frame_format(44_100, 20).is_err());
        assert!(check_frame_format(16_000, 25).is_err());
    }

    #[test]
    fn test_frame_length_must_match_duration() {
        assert_eq!(samples_per_frame(16_000, 20), 320);
        assert!(AudioFrame::new(vec![0; 320], 16_000, 20).is_ok());
        assert!(AudioFrame::new(vec![0; 319], 16_000, 20).is_err());
    }

    #[test]
    fn test_rms_levels() {
        assert_eq!(rms(&[]), 0.0);
        assert_eq!(rms(&[0; 160]), 0.0);
        let loud = rms(&[i16::MAX; 160]);
        assert!(loud > 0.99 && loud <= 1.0);
    }

    #[test]
    fn test_i16_u8_conversion() {
        let samples = vec![0i16, 100, -100, i16::MAX, i16::MIN];
        let bytes = i16_slice_to_u8(&samples);
        assert_eq!(bytes.len(), 10);
        assert_eq!(u8_to_i16_slice(&bytes), samples);
    }

    #[test]
    fn test_decode_wav_downmixes_stereo() {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 24_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for _ in 0..4 {
                writer.write_sample(1000i16).unwrap();
                writer.write_sample(3000i16).unwrap();
            }
            writer.finalize().unwrap();
        }

        let pcm = decode_wav(&cursor.into_inner()).unwrap();
        assert_eq!(pcm.sample_rate, 24_000);
        assert_eq!(pcm.samples, vec![2000; 4]);
    }

    #[test]
    fn test_encode_then_decode_mono() {
        let audio = PcmAudio::new(vec![1, -1, 500, -500], 16_000);
        let decoded = decode_wav(&encode_wav(&audio).unwrap()).unwrap();
        assert_eq!(decoded, audio);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_wav(b"definitely not a wav file").is_err());
    }

    #[test]
    fn test_resample_linear_lengths_and_values() {
        let ramp: Vec<i16> = (0..240).map(|i| i * 10).collect();
        let down = resample_linear(&ramp, 24_000, 16_000);
        assert_eq!(down.len(), 160);
        assert_eq!(down[0], 0);
        // 1.5 input samples per output sample on a linear ramp
        assert_eq!(down[2], 30);

        let same = resample_linear(&ramp, 16_000, 16_000);
        assert_eq!(same, ramp);
    }
}
