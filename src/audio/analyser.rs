//! Amplitude tap shared between an audio thread and its readers.

use parking_lot::Mutex;
use std::sync::Arc;

pub const SMOOTHING: f32 = 0.96;

/// Smoothed RMS level of the most recent samples.
#[derive(Clone, Default)]
pub struct AmplitudeTap {
    rms: Arc<Mutex<f32>>,
}

impl AmplitudeTap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }
        let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
        let rms = (sum_sq / samples.len() as f32).sqrt();
        let mut level = self.rms.lock();
        *level = SMOOTHING * *level + (1.0 - SMOOTHING) * rms;
    }

    pub fn rms(&self) -> f32 {
        *self.rms.lock()
    }
}
