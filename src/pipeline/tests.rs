use super::*;
use crate::testing::{
    pipeline_config as test_config, played, start_pipeline as start, start_pipeline_draining,
    texts, wait_for, FakeSynth, RATE,
};

const LONG: Duration = Duration::from_secs(10);

#[test]
fn test_fragments_play_as_two_sentences() {
    let (pipeline, log) = start(test_config(), FakeSynth::new(100), None);
    pipeline.push_text("こんにちは。").unwrap();
    pipeline.push_text("今日は").unwrap();
    pipeline.push_text("晴れです。").unwrap();
    pipeline.close();

    assert!(pipeline.wait_until_idle(LONG));
    assert_eq!(texts(&log), vec!["こんにちは。", "今日は晴れです。"]);
    assert!(played(&log).iter().all(|p| !p.interrupted && p.samples == 1_600));
    assert!(!pipeline.is_playing());
}

#[test]
fn test_out_of_order_synthesis_plays_in_sequence() {
    let synth = FakeSynth::new(60)
        .with_delay("一。", Duration::from_millis(150))
        .with_delay("三。", Duration::from_millis(80));
    let config = PipelineConfig {
        workers: 3,
        ..test_config()
    };
    let (pipeline, log) = start(config, synth, None);
    let mut events = pipeline.subscribe();

    pipeline.push_text("一。二。三。四。").unwrap();
    pipeline.close();
    assert!(pipeline.wait_until_idle(LONG));
    assert_eq!(texts(&log), vec!["一。", "二。", "三。", "四。"]);

    let mut started = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let PipelineEvent::SentenceStarted { epoch, sequence, .. } = event {
            started.push((epoch, sequence));
        }
    }
    assert_eq!(started, vec![(0, 0), (0, 1), (0, 2), (0, 3)]);
}

#[test]
fn test_hard_barge_in_cuts_current_and_speaks_next() {
    let (pipeline, log) = start(test_config(), FakeSynth::new(400), None);
    pipeline.push_text("一。二。三。四。").unwrap();

    assert!(wait_for(LONG, || log.lock().unwrap().len() >= 2));
    let epoch = pipeline.barge_in("割り込み。", BargeInMode::Hard).unwrap();
    assert_eq!(epoch, 1);

    assert!(pipeline.wait_until_idle(LONG));
    let played = played(&log);
    let texts: Vec<&str> = played.iter().map(|p| p.text.as_str()).collect();
    assert_eq!(texts, vec!["一。", "二。", "割り込み。"]);
    assert!(!played[0].interrupted);
    assert!(played[1].interrupted);
    assert!(played[1].samples < 6_400);
    assert!(!played[2].interrupted);
}

#[test]
fn test_soft_barge_in_finishes_current_then_switches() {
    let (pipeline, log) = start(test_config(), FakeSynth::new(400), None);
    pipeline.push_text("一。二。三。四。").unwrap();

    assert!(wait_for(LONG, || log.lock().unwrap().len() >= 2));
    pipeline.barge_in("新しい話題。", BargeInMode::Soft).unwrap();

    assert!(pipeline.wait_until_idle(LONG));
    let played = played(&log);
    let texts: Vec<&str> = played.iter().map(|p| p.text.as_str()).collect();
    assert_eq!(texts, vec!["一。", "二。", "新しい話題。"]);
    assert!(!played[1].interrupted);
    assert_eq!(played[1].samples, 6_400);
}

#[test]
fn test_soft_barge_in_finish_ready_policy() {
    let config = PipelineConfig {
        soft_barge_in: SoftBargeInPolicy::FinishReady,
        ..test_config()
    };
    let (pipeline, log) = start(config, FakeSynth::new(200), None);
    pipeline.push_text("一。二。三。").unwrap();

    assert!(wait_for(LONG, || log.lock().unwrap().len() >= 1));
    thread::sleep(Duration::from_millis(50));
    pipeline.barge_in("次。", BargeInMode::Soft).unwrap();

    assert!(pipeline.wait_until_idle(LONG));
    assert_eq!(texts(&log), vec!["一。", "二。", "三。", "次。"]);
}

#[test]
fn test_barge_in_with_nothing_playing_starts_fresh_epoch() {
    let (pipeline, log) = start(test_config(), FakeSynth::new(50), None);
    let epoch = pipeline.barge_in("はい。", BargeInMode::Soft).unwrap();
    assert_eq!(epoch, 1);
    assert!(pipeline.wait_until_idle(LONG));
    assert_eq!(texts(&log), vec!["はい。"]);
    assert_eq!(pipeline.current_epoch(), 1);
}

#[test]
fn test_gate_holds_playback_until_resume() {
    let config = PipelineConfig {
        autoplay: false,
        ..test_config()
    };
    let (pipeline, log) = start(config, FakeSynth::new(50), None);
    assert!(pipeline.is_paused());
    pipeline.push_text("一。").unwrap();

    thread::sleep(Duration::from_millis(150));
    assert!(texts(&log).is_empty());
    assert!(pipeline.is_playing());

    pipeline.resume();
    assert!(pipeline.wait_until_idle(LONG));
    assert_eq!(texts(&log), vec!["一。"]);
}

#[test]
fn test_pause_after_flush_closes_gate_once_queue_empties() {
    let (pipeline, log) = start(test_config(), FakeSynth::new(100), None);
    pipeline.push_text("一。二。").unwrap();
    pipeline.pause_after_flush();

    assert!(wait_for(LONG, || pipeline.is_paused()));
    assert_eq!(texts(&log), vec!["一。", "二。"]);

    pipeline.push_text("三。").unwrap();
    thread::sleep(Duration::from_millis(200));
    assert_eq!(texts(&log).len(), 2);

    pipeline.resume();
    assert!(pipeline.wait_until_idle(LONG));
    assert_eq!(texts(&log), vec!["一。", "二。", "三。"]);
}

#[test]
fn test_skip_current_abandons_playing_sentence() {
    let (pipeline, log) = start(test_config(), FakeSynth::new(400), None);
    pipeline.push_text("一。二。").unwrap();

    assert!(wait_for(LONG, || log.lock().unwrap().len() >= 1));
    pipeline.skip_current();

    assert!(pipeline.wait_until_idle(LONG));
    let played = played(&log);
    assert_eq!(played.len(), 2);
    assert!(played[0].interrupted);
    assert!(!played[1].interrupted);
    assert_eq!(played[1].text, "二。");
}

#[test]
fn test_skip_after_last_chunk_does_not_eat_the_next_sentence() {
    let (pipeline, log) = start_pipeline_draining(
        test_config(),
        FakeSynth::new(100),
        None,
        Duration::from_millis(300),
    );
    pipeline.push_text("一。二。").unwrap();

    // The first sentence is fully written and only the device buffer remains
    assert!(wait_for(LONG, || played(&log).first().is_some_and(|p| p.draining)));
    pipeline.skip_current();

    pipeline.close();
    assert!(pipeline.wait_until_idle(LONG));
    let played = played(&log);
    let texts: Vec<&str> = played.iter().map(|p| p.text.as_str()).collect();
    assert_eq!(texts, vec!["一。", "二。"]);
    assert!(played.iter().all(|p| !p.interrupted && p.samples == 1_600));
}

#[test]
fn test_skip_while_idle_targets_only_the_next_sentence() {
    let (pipeline, log) = start(test_config(), FakeSynth::new(50), None);
    pipeline.push_text("一。").unwrap();
    assert!(pipeline.wait_until_idle(LONG));

    pipeline.skip_current();
    pipeline.push_text("二。三。四。").unwrap();
    pipeline.close();

    assert!(pipeline.wait_until_idle(LONG));
    assert_eq!(texts(&log), vec!["一。", "三。", "四。"]);
}

#[test]
fn test_closed_gate_bounds_stored_audio() {
    let config = PipelineConfig {
        sentence_queue: 2,
        autoplay: false,
        ..test_config()
    };
    let (pipeline, log) = start(config, FakeSynth::new(50), None);
    pipeline.push_text("一。二。三。四。五。六。").unwrap();

    assert!(wait_for(LONG, || pipeline.shared.lock().results.len() == 2));
    thread::sleep(Duration::from_millis(200));
    {
        let st = pipeline.shared.lock();
        assert_eq!(st.results.len(), 2);
        assert!(st.in_flight.is_empty());
        assert!(!st.sentences.is_empty());
    }
    assert!(texts(&log).is_empty());

    pipeline.resume();
    pipeline.close();
    assert!(pipeline.wait_until_idle(LONG));
    assert_eq!(
        texts(&log),
        vec!["一。", "二。", "三。", "四。", "五。", "六。"]
    );
}

#[test]
fn test_failed_synthesis_is_skipped() {
    let (pipeline, log) = start(test_config(), FakeSynth::new(50), None);
    let mut events = pipeline.subscribe();
    pipeline.push_text("一。FAIL。三。").unwrap();
    pipeline.close();

    assert!(pipeline.wait_until_idle(LONG));
    assert_eq!(texts(&log), vec!["一。", "三。"]);

    let mut failed = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let PipelineEvent::SynthesisFailed { sequence, .. } = event {
            failed.push(sequence);
        }
    }
    assert_eq!(failed, vec![1]);
}

#[test]
fn test_input_rejected_after_close() {
    let (pipeline, _log) = start(test_config(), FakeSynth::new(50), None);
    pipeline.close();
    assert!(matches!(pipeline.push_text("まだ。"), Err(PipelineError::Closed)));
    assert!(matches!(
        pipeline.barge_in("まだ。", BargeInMode::Hard),
        Err(PipelineError::Closed)
    ));
}

#[test]
fn test_stop_silences_and_goes_idle() {
    let (pipeline, log) = start(test_config(), FakeSynth::new(1_000), None);
    pipeline.push_text("長い文。次の文。").unwrap();

    assert!(wait_for(LONG, || log.lock().unwrap().len() >= 1));
    pipeline.stop();

    assert!(pipeline.wait_until_idle(Duration::from_secs(1)));
    assert!(!pipeline.is_playing());
    let played = played(&log);
    assert_eq!(played.len(), 1);
    assert!(played[0].interrupted);
}

#[test]
fn test_shutdown_drains_and_joins_every_stage() {
    let (pipeline, log) = start(test_config(), FakeSynth::new(50), None);
    pipeline.push_text("一。").unwrap();

    let report = pipeline.shutdown();
    assert_eq!(texts(&log), vec!["一。"]);
    assert!(report.abandoned.is_empty());
    assert_eq!(report.joined.len(), 4);
    assert!(!pipeline.is_playing());

    assert_eq!(pipeline.shutdown(), ShutdownReport::default());
}

#[test]
fn test_shutdown_abandons_stuck_worker() {
    let synth = FakeSynth::new(50).with_delay("遅い。", Duration::from_secs(3));
    let config = PipelineConfig {
        join_timeout_ms: 200,
        drain_timeout_ms: 100,
        ..test_config()
    };
    let (pipeline, _log) = start(config, synth, None);
    pipeline.push_text("遅い。").unwrap();
    thread::sleep(Duration::from_millis(50));

    let began = Instant::now();
    let report = pipeline.shutdown();
    assert!(began.elapsed() < Duration::from_millis(1_500));
    assert_eq!(report.abandoned.len(), 1);
    assert!(report.abandoned[0].starts_with("tts-synth-"));
    assert!(!pipeline.is_playing());
}

#[test]
fn test_played_audio_feeds_echo_gate() {
    let gate = Arc::new(EchoGate::new(RATE, 1_000, 0.6, 95));
    let (pipeline, _log) = start(test_config(), FakeSynth::new(100), Some(gate.clone()));
    pipeline.push_text("一。").unwrap();
    pipeline.close();

    assert!(pipeline.wait_until_idle(LONG));
    assert_eq!(gate.buffered_samples(), 1_600);
    assert_eq!(pipeline.last_spoken().as_deref(), Some("一。"));
}
