/// Per-session sample accumulation and averaging
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::models::{AverageResult, MeasurementSample};
use crate::utils::mean_to_tenth;

/// Fewest samples a session needs before its average is reported
pub const DEFAULT_MIN_SAMPLES: usize = 7;

/// Sample buffer shared between the session loop and the disconnect watcher
pub type SharedAggregator = Arc<Mutex<SampleAggregator>>;

/// Lock the shared buffer, recovering the data if a holder panicked
pub fn lock_samples(shared: &SharedAggregator) -> MutexGuard<'_, SampleAggregator> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
pub struct SampleAggregator {
    samples: Vec<MeasurementSample>,
    min_samples: usize,
}

impl SampleAggregator {
    pub fn new(min_samples: usize) -> Self {
        SampleAggregator {
            samples: Vec::new(),
            min_samples,
        }
    }

    pub fn shared(min_samples: usize) -> SharedAggregator {
        Arc::new(Mutex::new(Self::new(min_samples)))
    }

    pub fn append(&mut self, sample: MeasurementSample) {
        self.samples.push(sample);
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn min_samples(&self) -> usize {
        self.min_samples
    }

    pub fn samples(&self) -> &[MeasurementSample] {
        &self.samples
    }

    /// Pulse values in arrival order, for live charting
    pub fn pulse_series(&self) -> Vec<u8> {
        self.samples.iter().map(|s| s.pulse).collect()
    }

    /// Calculate the session average
    ///
    /// Each field is averaged independently and rounded to one decimal.
    ///
    /// # Returns
    /// None while fewer than the minimum number of samples have been collected
    pub fn average(&self) -> Option<AverageResult> {
        if self.samples.is_empty() || self.samples.len() < self.min_samples {
            return None;
        }

        let count = self.samples.len();

        // Totals in tenths
        let spo2_sum: u64 = self.samples.iter().map(|s| s.spo2 as u64 * 10).sum();
        let pulse_sum: u64 = self.samples.iter().map(|s| s.pulse as u64 * 10).sum();
        let pi_sum: u64 = self
            .samples
            .iter()
            .map(|s| (s.perfusion_index * 10.0).round() as u64)
            .sum();

        Some(AverageResult {
            spo2: mean_to_tenth(spo2_sum, count),
            pulse: mean_to_tenth(pulse_sum, count),
            perfusion_index: mean_to_tenth(pi_sum, count),
        })
    }
}

impl Default for SampleAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_SAMPLES)
    }
}
