/// Speech pipeline probe
/// Speaks the text given on the command line (or a default greeting) through
/// VOICEVOX and PulseAudio, printing pipeline events as they happen.
use halolive::config::EngineConfig;
use halolive::device::PulseSink;
use halolive::events::PipelineEvent;
use halolive::pipeline::SpeechPipeline;
use halolive::synthesis::VoiceVoxClient;
use std::error::Error;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast::error::TryRecvError;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let path = std::env::var("HALOLIVE_CONFIG").unwrap_or_else(|_| "halolive.json".to_string());
    let config = EngineConfig::load(&path)?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let text = if args.is_empty() {
        "こんにちは。今日はいい天気ですね。音声合成のテストをしています。".to_string()
    } else {
        args.join(" ")
    };

    println!("🔊 Speech pipeline probe");
    println!("Engine: {}  speaker: {}", config.synthesis.base_url, config.synthesis.speaker);
    println!("Text: {}\n", text);

    let synthesizer = Arc::new(VoiceVoxClient::new(&config.synthesis)?);
    let sink = Arc::new(PulseSink::new(&config.audio));
    let pipeline = SpeechPipeline::start(&config.pipeline, synthesizer, sink, None)?;
    let mut events = pipeline.subscribe();

    let started = Instant::now();
    // Feed it in small pieces, the way a streaming model would
    let chars: Vec<char> = text.chars().collect();
    for piece in chars.chunks(4) {
        pipeline.push_text(&piece.iter().collect::<String>())?;
    }
    pipeline.close();

    let idle = pipeline.wait_until_idle(config.pipeline.drain_timeout());
    loop {
        match events.try_recv() {
            Ok(PipelineEvent::SentenceQueued { sequence, text, .. }) => {
                println!("📝 #{} queued: {}", sequence, text)
            }
            Ok(PipelineEvent::SentenceStarted { sequence, .. }) => println!("▶️  #{} playing", sequence),
            Ok(PipelineEvent::SentenceFinished {
                sequence,
                interrupted,
                ..
            }) => println!("⏹️  #{} done{}", sequence, if interrupted { " (cut)" } else { "" }),
            Ok(PipelineEvent::SynthesisFailed { sequence, error, .. }) => {
                println!("❌ #{} failed: {}", sequence, error)
            }
            Ok(other) => println!("   {:?}", other),
            Err(TryRecvError::Lagged(n)) => println!("   ({} events missed)", n),
            Err(_) => break,
        }
    }

    println!(
        "\n{} after {:.1}s",
        if idle { "✅ Finished" } else { "⚠️ Timed out" },
        started.elapsed().as_secs_f32()
    );

    let report = pipeline.shutdown();
    if !report.abandoned.is_empty() {
        println!("Abandoned threads: {:?}", report.abandoned);
    }
    Ok(())
}
