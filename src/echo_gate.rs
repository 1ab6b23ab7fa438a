//! Far-end echo gate
//!
//! Without hardware echo cancellation the microphone hears the agent's own
//! voice a few tens of milliseconds after the speaker plays it. The player
//! publishes every chunk it is about to write; the listener asks whether a
//! microphone frame looks like a delayed copy of that recent output and, if
//! so, does not count it as user speech.

use crate::audio::{resample_linear, AudioFrame};
use crate::config::EchoGateConfig;
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use tracing::trace;

/// Bounded far-end history plus the correlation test against it
#[derive(Debug)]
pub struct EchoGate {
    /// Most recent far-end samples at `sample_rate`, oldest first
    reference: Mutex<VecDeque<i16>>,

    /// Ring capacity in samples
    capacity: usize,

    /// Microphone sample rate the reference is kept at
    sample_rate: u32,

    /// Correlation at or above this marks a frame as echo
    threshold: f32,

    /// Largest lag searched, in samples
    max_lag: usize,
}

impl EchoGate {
    pub fn new(sample_rate: u32, buffer_ms: u64, threshold: f32, max_lag_ms: u64) -> Self {
        let capacity = (sample_rate as u64 * buffer_ms / 1000).max(1) as usize;
        let max_lag = (sample_rate as u64 * max_lag_ms / 1000) as usize;
        Self {
            reference: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            sample_rate,
            threshold,
            max_lag,
        }
    }

    pub fn from_config(config: &EchoGateConfig, sample_rate: u32) -> Self {
        Self::new(
            sample_rate,
            config.buffer_ms,
            config.threshold,
            config.max_lag_ms,
        )
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Append far-end samples (already at the microphone rate), evicting the oldest
    pub fn publish_far_end(&self, samples: &[i16]) {
        let mut reference = self.reference.lock().unwrap_or_else(PoisonError::into_inner);

        // Only the newest `capacity` samples can survive
        let incoming = if samples.len() > self.capacity {
            &samples[samples.len() - self.capacity..]
        } else {
            samples
        };

        let overflow = (reference.len() + incoming.len()).saturating_sub(self.capacity);
        reference.drain(..overflow);
        reference.extend(incoming.iter().copied());
    }

    /// Publish audio rendered at another rate, converting it first
    pub fn publish_far_end_at(&self, samples: &[i16], sample_rate: u32) {
        if sample_rate == self.sample_rate {
            self.publish_far_end(samples);
        } else {
            self.publish_far_end(&resample_linear(samples, sample_rate, self.sample_rate));
        }
    }

    /// Forget all far-end history
    pub fn clear(&self) {
        self.reference
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn buffered_samples(&self) -> usize {
        self.reference
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether `frame` correlates with recent far-end output at some lag
    pub fn is_echo_like(&self, frame: &AudioFrame) -> bool {
        self.is_echo_like_samples(frame.samples())
    }

    pub fn is_echo_like_samples(&self, near: &[i16]) -> bool {
        match self.scan(near, true) {
            Some(best) => {
                trace!("echo gate best correlation {:.3}", best);
                best >= self.threshold
            }
            None => false,
        }
    }

    /// Best correlation over the whole lag window, `None` without enough history
    pub fn best_correlation(&self, near: &[i16]) -> Option<f32> {
        self.scan(near, false)
    }

    fn scan(&self, near: &[i16], early_exit: bool) -> Option<f32> {
        let frame_len = near.len();
        if frame_len == 0 {
            return None;
        }

        // Copy only the tail the lag window can reach, then release the lock
        let window: Vec<i16> = {
            let reference = self.reference.lock().unwrap_or_else(PoisonError::into_inner);
            if reference.len() < frame_len {
                return None;
            }
            let keep = (frame_len + self.max_lag).min(reference.len());
            reference.range(reference.len() - keep..).copied().collect()
        };

        let last_start = window.len() - frame_len;
        let step = (frame_len / 2).max(1);
        let mut best = f32::MIN;
        let mut start = 0;
        loop {
            let r = normalized_correlation(near, &window[start..start + frame_len]);
            if r > best {
                best = r;
            }
            if early_exit && best >= self.threshold {
                break;
            }
            if start == last_start {
                break;
            }
            start = (start + step).min(last_start);
        }
        Some(best)
    }
}

/// Mean-removed normalized cross-correlation of two equal-length blocks.
///
/// Returns 0.0 when either block has no energy after mean removal.
pub fn normalized_correlation(a: &[i16], b: &[i16]) -> f32 {
    let n = a.len().min(b.len());
    if n == 0 {
        return 0.0;
    }
    let a = &a[..n];
    let b = &b[..n];

    let mean_a = a.iter().map(|&x| x as f64).sum::<f64>() / n as f64;
    let mean_b = b.iter().map(|&x| x as f64).sum::<f64>() / n as f64;

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b) {
        let x = x as f64 - mean_a;
        let y = y as f64 - mean_b;
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom <= f64::EPSILON {
        return 0.0;
    }
    (dot / denom).clamp(-1.0, 1.0) as f32
}
