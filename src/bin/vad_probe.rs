/// Voice detection probe
/// Prints when the microphone hears speech, and optionally plays a test tone
/// so you can watch the echo gate suppress the agent's own voice.
use halolive::audio::{check_frame_format, samples_per_frame};
use halolive::config::EngineConfig;
use halolive::device::{AudioSink, FrameSource, PlaybackStream, PulseFrameSource, PulseSink};
use halolive::echo_gate::EchoGate;
use halolive::vad::{ListenOutcome, VoiceActivityDetector};
use std::error::Error;
use std::f32::consts::PI;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Two-tone test signal, loud enough to reach the microphone
fn tone(sample_rate: u32, ms: u32) -> Vec<i16> {
    let n = samples_per_frame(sample_rate, ms);
    (0..n)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            let v = 0.3 * (2.0 * PI * 300.0 * t).sin() + 0.2 * (2.0 * PI * 700.0 * t).sin();
            (v * i16::MAX as f32) as i16
        })
        .collect()
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let path = std::env::var("HALOLIVE_CONFIG").unwrap_or_else(|_| "halolive.json".to_string());
    let config = EngineConfig::load(&path)?;
    check_frame_format(config.audio.sample_rate, config.audio.frame_ms)?;

    let with_tone = std::env::args().any(|a| a == "--tone");
    let use_gate = !std::env::args().any(|a| a == "--no-gate");

    println!("🎤 Voice detection probe");
    println!(
        "{} ms frames @ {} Hz, {:?} classifier, {} frames to confirm",
        config.audio.frame_ms, config.audio.sample_rate, config.vad.classifier, config.vad.start_frames
    );
    println!(
        "Echo gate: {}   Test tone: {}",
        if use_gate { "on" } else { "off" },
        if with_tone { "on" } else { "off (pass --tone)" }
    );
    println!("Press Ctrl+C to exit\n");

    let gate = Arc::new(EchoGate::from_config(&config.echo_gate, config.audio.sample_rate));
    let stop = Arc::new(AtomicBool::new(false));

    if with_tone {
        let gate = gate.clone();
        let stop = stop.clone();
        let audio = config.audio.clone();
        let chunk_ms = config.pipeline.chunk_ms;
        thread::spawn(move || -> Result<(), String> {
            let sink = PulseSink::new(&audio);
            let chunk = tone(audio.sample_rate, chunk_ms);
            while !stop.load(Ordering::Acquire) {
                let mut stream = sink.open(audio.sample_rate).map_err(|e| e.to_string())?;
                // One second on, one second off
                for _ in 0..(1000 / chunk_ms.max(1)) {
                    gate.publish_far_end(&chunk);
                    stream.write(&chunk).map_err(|e| e.to_string())?;
                }
                stream.drain().map_err(|e| e.to_string())?;
                thread::sleep(Duration::from_secs(1));
            }
            Ok(())
        });
    }

    let mut source = PulseFrameSource::open(&config.audio)?;
    let mut detector = VoiceActivityDetector::from_config(&config.audio, &config.vad)?;
    let started = Instant::now();
    let mut detections = 0;

    loop {
        let outcome = detector.listen(
            &mut source,
            config.vad.start_frames,
            None,
            use_gate.then_some(gate.as_ref()),
            Some(&stop),
        );
        match outcome {
            ListenOutcome::Detected => {
                detections += 1;
                println!(
                    "🗣️  Speech #{} at {:.1}s (reference buffer {} samples)",
                    detections,
                    started.elapsed().as_secs_f32(),
                    gate.buffered_samples()
                );
                let ended = detector.listen_until_silence(
                    &mut source,
                    config.vad.end_frames,
                    None,
                    use_gate.then_some(gate.as_ref()),
                    Some(&stop),
                );
                if ended == ListenOutcome::Detected {
                    println!("   ...ended at {:.1}s", started.elapsed().as_secs_f32());
                }
            }
            ListenOutcome::TimedOut => continue,
            ListenOutcome::Cancelled => break,
            ListenOutcome::DeviceFailed => {
                println!("❌ Microphone failed (source reports {} Hz)", source.sample_rate());
                break;
            }
        }
    }

    stop.store(true, Ordering::Release);
    Ok(())
}
