use std::collections::VecDeque;

use crate::types::AccelSample;

/// Moving/stationary classification from accelerometer magnitude variance
///
/// Keeps up to `2 * window_size` samples; the classification looks at the
/// most recent `window_size` of them.
pub struct MotionClassifier {
    history: VecDeque<AccelSample>,
    window_size: usize,
    threshold: f64,
}

impl MotionClassifier {
    /// `threshold` is a variance in (m/s²)². 2.0 ignores hand tremor and gravity noise.
    pub fn new(window_size: usize, threshold: f64) -> Self {
        let window_size = window_size.max(1);
        MotionClassifier {
            history: VecDeque::with_capacity(window_size * 2),
            window_size,
            threshold,
        }
    }

    pub fn add_reading(&mut self, x: f64, y: f64, z: f64, timestamp: i64) {
        self.add_sample(AccelSample::new(x, y, z, timestamp));
    }

    pub fn add_sample(&mut self, sample: AccelSample) {
        self.history.push_back(sample);
        while self.history.len() > self.window_size * 2 {
            self.history.pop_front();
        }
    }

    /// False until a full window has been recorded.
    pub fn is_moving(&self) -> bool {
        if self.history.len() < self.window_size {
            return false;
        }
        self.recent_variance() > self.threshold
    }

    /// Population variance of the magnitude over the most recent window.
    pub fn recent_variance(&self) -> f64 {
        let skip = self.history.len().saturating_sub(self.window_size);
        let mags: Vec<f64> = self.history.iter().skip(skip).map(|s| s.magnitude()).collect();
        if mags.is_empty() {
            return 0.0;
        }
        let n = mags.len() as f64;
        let mean = mags.iter().sum::<f64>() / n;
        mags.iter().map(|m| (m - mean).powi(2)).sum::<f64>() / n
    }

    /// Rate of change of magnitude between the oldest and newest retained
    /// samples, per second. Diagnostics only.
    pub fn velocity_estimate(&self) -> f64 {
        let (Some(first), Some(last)) = (self.history.front(), self.history.back()) else {
            return 0.0;
        };
        if self.history.len() < 2 {
            return 0.0;
        }
        let dt = (last.timestamp - first.timestamp) as f64 / 1000.0;
        if dt == 0.0 {
            return 0.0;
        }
        (last.magnitude() - first.magnitude()) / dt
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }
}

impl Default for MotionClassifier {
    fn default() -> Self {
        Self::new(10, 2.0)
    }
}
