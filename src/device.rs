//! Audio device seams
//!
//! The engine only talks to devices through [`FrameSource`] (microphone) and
//! [`AudioSink`] / [`PlaybackStream`] (speaker). The PulseAudio simple API
//! backs both in production; tests plug in scripted fakes.

use crate::audio::{i16_slice_to_u8, samples_per_frame, u8_to_i16_slice, AudioError, AudioFrame, Result};
use crate::config::AudioConfig;
use libpulse_binding::def::BufferAttr;
use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::Direction;
use libpulse_simple_binding::Simple;
use tracing::{debug, info};

/// Produces microphone frames of a fixed size.
pub trait FrameSource {
    fn sample_rate(&self) -> u32;

    fn frame_ms(&self) -> u32;

    /// Read the next frame.
    ///
    /// `Ok(None)` is a short or empty read and should be retried; `Err` means
    /// the device is gone.
    fn read_frame(&mut self) -> Result<Option<AudioFrame>>;
}

/// One open output stream, owned by a single thread while it plays.
pub trait PlaybackStream {
    /// Queue samples for playback, blocking while the device buffer is full
    fn write(&mut self, samples: &[i16]) -> Result<()>;

    /// Block until everything written has been played
    fn drain(&mut self) -> Result<()>;

    /// Drop buffered audio so playback stops at once
    fn flush(&mut self) -> Result<()>;
}

/// Opens playback streams at a given sample rate.
pub trait AudioSink: Send + Sync {
    fn open(&self, sample_rate: u32) -> Result<Box<dyn PlaybackStream>>;
}

fn pulse_err(context: &str, e: impl std::fmt::Display) -> AudioError {
    AudioError::Device(format!("{}: {}", context, e))
}

fn mono_spec(rate: u32) -> Result<Spec> {
    let spec = Spec {
        format: Format::S16le,
        channels: 1,
        rate,
    };
    if !spec.is_valid() {
        return Err(AudioError::Format(format!("invalid sample spec at {} Hz", rate)));
    }
    Ok(spec)
}

/// Microphone capture through the PulseAudio simple API
pub struct PulseFrameSource {
    simple: Simple,
    sample_rate: u32,
    frame_ms: u32,
    /// Reused byte buffer, exactly one frame long
    buf: Vec<u8>,
}

impl PulseFrameSource {
    pub fn open(config: &AudioConfig) -> Result<Self> {
        crate::audio::check_frame_format(config.sample_rate, config.frame_ms)?;
        let spec = mono_spec(config.sample_rate)?;
        let frame_bytes = samples_per_frame(config.sample_rate, config.frame_ms) * 2;

        // Small fragments so a read returns once per frame
        let attr = BufferAttr {
            maxlength: u32::MAX,
            tlength: u32::MAX,
            prebuf: u32::MAX,
            minreq: u32::MAX,
            fragsize: frame_bytes as u32,
        };

        let simple = Simple::new(
            None,
            &config.app_name,
            Direction::Record,
            config.input_device.as_deref(),
            "microphone",
            &spec,
            None,
            Some(&attr),
        )
        .map_err(|e| pulse_err("failed to open microphone", e))?;

        info!(
            "🎤 Microphone open ({} Hz, {} ms frames, device: {})",
            config.sample_rate,
            config.frame_ms,
            config.input_device.as_deref().unwrap_or("default")
        );

        Ok(Self {
            simple,
            sample_rate: config.sample_rate,
            frame_ms: config.frame_ms,
            buf: vec![0u8; frame_bytes],
        })
    }
}

impl FrameSource for PulseFrameSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn frame_ms(&self) -> u32 {
        self.frame_ms
    }

    fn read_frame(&mut self) -> Result<Option<AudioFrame>> {
        self.simple
            .read(&mut self.buf)
            .map_err(|e| pulse_err("microphone read failed", e))?;
        let samples = u8_to_i16_slice(&self.buf);
        if samples.is_empty() {
            return Ok(None);
        }
        AudioFrame::new(samples, self.sample_rate, self.frame_ms).map(Some)
    }
}

/// Speaker output through the PulseAudio simple API.
///
/// Opens one stream per sentence with a short target buffer, so flushing
/// after an interrupt discards at most `buffer_ms` of audio.
pub struct PulseSink {
    app_name: String,
    device: Option<String>,
    buffer_ms: u32,
}

impl PulseSink {
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            app_name: config.app_name.clone(),
            device: config.output_device.clone(),
            buffer_ms: config.playback_buffer_ms,
        }
    }
}

impl AudioSink for PulseSink {
    fn open(&self, sample_rate: u32) -> Result<Box<dyn PlaybackStream>> {
        let spec = mono_spec(sample_rate)?;
        let target_bytes = (samples_per_frame(sample_rate, self.buffer_ms) * 2) as u32;
        let attr = BufferAttr {
            maxlength: u32::MAX,
            tlength: target_bytes,
            prebuf: u32::MAX,
            minreq: u32::MAX,
            fragsize: u32::MAX,
        };

        let simple = Simple::new(
            None,
            &self.app_name,
            Direction::Playback,
            self.device.as_deref(),
            "speech",
            &spec,
            None,
            Some(&attr),
        )
        .map_err(|e| pulse_err("failed to open speaker", e))?;

        debug!("Opened playback stream at {} Hz", sample_rate);
        Ok(Box::new(PulsePlayback { simple }))
    }
}

struct PulsePlayback {
    simple: Simple,
}

impl PlaybackStream for PulsePlayback {
    fn write(&mut self, samples: &[i16]) -> Result<()> {
        self.simple
            .write(&i16_slice_to_u8(samples))
            .map_err(|e| pulse_err("speaker write failed", e))
    }

    fn drain(&mut self) -> Result<()> {
        self.simple
            .drain()
            .map_err(|e| pulse_err("speaker drain failed", e))
    }

    fn flush(&mut self) -> Result<()> {
        self.simple
            .flush()
            .map_err(|e| pulse_err("speaker flush failed", e))
    }
}
