//! Fakes shared by the pipeline and turn controller tests

use crate::audio::{self, PcmAudio};
use crate::config::PipelineConfig;
use crate::device::{AudioSink, PlaybackStream};
use crate::echo_gate::EchoGate;
use crate::pipeline::SpeechPipeline;
use crate::synthesis::{self, SynthesisError, Synthesizer};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

pub const RATE: u32 = 16_000;

/// Renders each distinct text as a constant tone whose value identifies it
pub struct FakeSynth {
    registry: Arc<Mutex<Vec<String>>>,
    audio_ms: u64,
    delays: HashMap<String, Duration>,
}

impl FakeSynth {
    pub fn new(audio_ms: u64) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Vec::new())),
            audio_ms,
            delays: HashMap::new(),
        }
    }

    pub fn with_delay(mut self, text: &str, delay: Duration) -> Self {
        self.delays.insert(text.to_string(), delay);
        self
    }
}

impl Synthesizer for FakeSynth {
    fn synthesize(&self, text: &str) -> synthesis::Result<PcmAudio> {
        if let Some(delay) = self.delays.get(text) {
            thread::sleep(*delay);
        }
        if text.contains("FAIL") {
            return Err(SynthesisError::Status {
                step: "synthesis",
                status: 500,
                body: "engine crashed".into(),
            });
        }
        let mut registry = self.registry.lock().unwrap();
        let id = match registry.iter().position(|t| t == text) {
            Some(id) => id,
            None => {
                registry.push(text.to_string());
                registry.len() - 1
            }
        };
        let samples = (RATE as u64 * self.audio_ms / 1000) as usize;
        Ok(PcmAudio::new(vec![id as i16 + 1; samples], RATE))
    }
}

/// One sentence as it reached the fake speaker
#[derive(Debug, Clone)]
pub struct Played {
    pub text: String,
    pub samples: usize,
    pub interrupted: bool,
    /// Every chunk was written and the stream is draining
    pub draining: bool,
}

pub type PlayLog = Arc<Mutex<Vec<Played>>>;

/// Plays in real time and records what reached the speaker
pub struct FakeSink {
    registry: Arc<Mutex<Vec<String>>>,
    log: PlayLog,
    drain_delay: Duration,
}

struct FakeStream {
    registry: Arc<Mutex<Vec<String>>>,
    log: PlayLog,
    entry: Option<usize>,
    sample_rate: u32,
    drain_delay: Duration,
}

impl AudioSink for FakeSink {
    fn open(&self, sample_rate: u32) -> audio::Result<Box<dyn PlaybackStream>> {
        Ok(Box::new(FakeStream {
            registry: self.registry.clone(),
            log: self.log.clone(),
            entry: None,
            sample_rate,
            drain_delay: self.drain_delay,
        }))
    }
}

impl PlaybackStream for FakeStream {
    fn write(&mut self, samples: &[i16]) -> audio::Result<()> {
        {
            let mut log = self.log.lock().unwrap();
            match self.entry {
                Some(i) => log[i].samples += samples.len(),
                None => {
                    let id = samples[0] as usize - 1;
                    let text = self.registry.lock().unwrap()[id].clone();
                    log.push(Played {
                        text,
                        samples: samples.len(),
                        interrupted: false,
                        draining: false,
                    });
                    self.entry = Some(log.len() - 1);
                }
            }
        }
        thread::sleep(Duration::from_secs_f64(
            samples.len() as f64 / self.sample_rate as f64,
        ));
        Ok(())
    }

    fn drain(&mut self) -> audio::Result<()> {
        if let Some(i) = self.entry {
            self.log.lock().unwrap()[i].draining = true;
        }
        thread::sleep(self.drain_delay);
        Ok(())
    }

    fn flush(&mut self) -> audio::Result<()> {
        if let Some(i) = self.entry {
            self.log.lock().unwrap()[i].interrupted = true;
        }
        Ok(())
    }
}

pub fn pipeline_config() -> PipelineConfig {
    PipelineConfig {
        workers: 2,
        chunk_ms: 20,
        join_timeout_ms: 1_000,
        drain_timeout_ms: 5_000,
        ..PipelineConfig::default()
    }
}

/// Start a pipeline over the fakes, returning it with its play log
pub fn start_pipeline(
    config: PipelineConfig,
    synth: FakeSynth,
    gate: Option<Arc<EchoGate>>,
) -> (SpeechPipeline, PlayLog) {
    start_pipeline_draining(config, synth, gate, Duration::ZERO)
}

/// Like [`start_pipeline`], with a speaker that takes `drain_delay` to play out its buffer
pub fn start_pipeline_draining(
    config: PipelineConfig,
    synth: FakeSynth,
    gate: Option<Arc<EchoGate>>,
    drain_delay: Duration,
) -> (SpeechPipeline, PlayLog) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = FakeSink {
        registry: synth.registry.clone(),
        log: log.clone(),
        drain_delay,
    };
    let pipeline = SpeechPipeline::start(&config, Arc::new(synth), Arc::new(sink), gate).unwrap();
    (pipeline, log)
}

pub fn wait_for(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

pub fn texts(log: &PlayLog) -> Vec<String> {
    log.lock().unwrap().iter().map(|p| p.text.clone()).collect()
}

pub fn played(log: &PlayLog) -> Vec<Played> {
    log.lock().unwrap().clone()
}
