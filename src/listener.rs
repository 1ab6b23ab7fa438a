//! Microphone listener thread
//!
//! Owns the capture device and a [`VoiceActivityDetector`] on a dedicated OS
//! thread and reports speech starts to the turn controller. The WebRTC VAD is
//! not `Send`, so the detector is built on the thread that uses it.

use crate::audio;
use crate::config::{AudioConfig, VadConfig};
use crate::device::{FrameSource, PulseFrameSource};
use crate::echo_gate::EchoGate;
use crate::events::TurnEvent;
use crate::vad::{ListenOutcome, VoiceActivityDetector};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Running listener; dropping it cancels the thread without joining
pub struct ListenerHandle {
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ListenerHandle {
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Cancel and wait for the thread
    pub fn stop(mut self) {
        self.cancel();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Listener thread panicked");
            }
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Listen on the configured PulseAudio input
pub fn spawn_listener(
    audio: &AudioConfig,
    vad: &VadConfig,
    echo_gate: Option<Arc<EchoGate>>,
    tx: UnboundedSender<TurnEvent>,
) -> std::io::Result<ListenerHandle> {
    let device = audio.clone();
    spawn_listener_with(audio, vad, echo_gate, tx, move || {
        PulseFrameSource::open(&device).map(|s| Box::new(s) as Box<dyn FrameSource>)
    })
}

/// Listen on whatever source `open` produces; it is called again after a device failure
pub fn spawn_listener_with<F>(
    audio: &AudioConfig,
    vad: &VadConfig,
    echo_gate: Option<Arc<EchoGate>>,
    tx: UnboundedSender<TurnEvent>,
    open: F,
) -> std::io::Result<ListenerHandle>
where
    F: FnMut() -> audio::Result<Box<dyn FrameSource>> + Send + 'static,
{
    let cancel = Arc::new(AtomicBool::new(false));
    let worker = Listener {
        audio: audio.clone(),
        vad: vad.clone(),
        echo_gate,
        tx,
        cancel: cancel.clone(),
    };
    let handle = thread::Builder::new()
        .name("mic-listener".to_string())
        .spawn(move || worker.run(open))?;

    Ok(ListenerHandle {
        cancel,
        handle: Some(handle),
    })
}

struct Listener {
    audio: AudioConfig,
    vad: VadConfig,
    echo_gate: Option<Arc<EchoGate>>,
    tx: UnboundedSender<TurnEvent>,
    cancel: Arc<AtomicBool>,
}

impl Listener {
    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    fn report_failure(&self, message: String) -> bool {
        self.tx.send(TurnEvent::ListenerFailed(message)).is_ok()
    }

    /// Sleep for `duration` unless cancelled first
    fn back_off(&self, duration: Duration) {
        let tick = Duration::from_millis(20);
        let mut slept = Duration::ZERO;
        while slept < duration && !self.cancelled() {
            thread::sleep(tick);
            slept += tick;
        }
    }

    fn run<F>(self, mut open: F)
    where
        F: FnMut() -> audio::Result<Box<dyn FrameSource>>,
    {
        let mut detector = match VoiceActivityDetector::from_config(&self.audio, &self.vad) {
            Ok(detector) => detector,
            Err(e) => {
                error!("Cannot build voice detector: {}", e);
                self.report_failure(e.to_string());
                return;
            }
        };

        let gate = self.echo_gate.as_deref();
        let mut backoff = INITIAL_BACKOFF;
        info!("🎙️ Listener started");

        while !self.cancelled() {
            let mut source = match open() {
                Ok(source) => source,
                Err(e) => {
                    warn!("Microphone unavailable, retrying in {:?}: {}", backoff, e);
                    if !self.report_failure(e.to_string()) {
                        break;
                    }
                    self.back_off(backoff);
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            };
            backoff = INITIAL_BACKOFF;

            let failed = loop {
                let outcome = detector.listen(
                    source.as_mut(),
                    self.vad.start_frames,
                    None,
                    gate,
                    Some(&self.cancel),
                );
                match outcome {
                    ListenOutcome::Detected => {
                        info!("🗣️ User speech detected");
                        if self.tx.send(TurnEvent::SpeechStarted).is_err() {
                            debug!("Turn controller gone, listener exiting");
                            return;
                        }
                    }
                    ListenOutcome::TimedOut => continue,
                    ListenOutcome::Cancelled => break false,
                    ListenOutcome::DeviceFailed => break true,
                }

                // One report per utterance: wait for it to end before re-arming
                match detector.listen_until_silence(
                    source.as_mut(),
                    self.vad.end_frames,
                    None,
                    gate,
                    Some(&self.cancel),
                ) {
                    ListenOutcome::DeviceFailed => break true,
                    ListenOutcome::Cancelled => break false,
                    _ => debug!("Utterance ended"),
                }
            };

            if failed {
                warn!("Microphone failed, reopening in {:?}", backoff);
                if !self.report_failure("microphone read failed".to_string()) {
                    break;
                }
                drop(source);
                self.back_off(backoff);
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
        info!("Listener stopped");
    }
}
